//! Filesystem adapter: source files for reads, temporary files for writes,
//! atomic commit, and mail-spool resolution.
//!
//! Uploads never touch their destination until the last block has been
//! written: data accumulates in a uniquely named temporary file that is
//! fsynced and renamed over the target on commit. Temporary names come from
//! a process-wide wrapping 16-bit counter, so concurrent sessions cannot
//! collide.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU16, Ordering};

use tokio::fs::{self, File};

/// Prefix for temporary upload files in the system temp directory.
pub const TMP_PREFIX: &str = "tftp.";
/// Environment variable overriding the mail spool location.
pub const MAIL_PREFIX_ENV: &str = "TFTP_MAIL_PREFIX";
/// Default mail spool when the environment does not say otherwise.
pub const DEFAULT_MAIL_PREFIX: &str = "/var/spool/mail";

static TMP_COUNT: AtomicU16 = AtomicU16::new(0);
static TEMP_DIR: OnceLock<PathBuf> = OnceLock::new();
static MAIL_PREFIX: OnceLock<PathBuf> = OnceLock::new();

/// The memoized system temp directory.
pub fn temp_directory() -> &'static Path {
    TEMP_DIR.get_or_init(std::env::temp_dir)
}

/// Allocates the next temporary file path, `<tmpdir>/tftp.NNNNN`.
pub fn tmpname() -> PathBuf {
    let n = TMP_COUNT.fetch_add(1, Ordering::Relaxed);
    temp_directory().join(format!("{TMP_PREFIX}{n:05}"))
}

/// Forces the mail spool prefix, overriding `TFTP_MAIL_PREFIX`. Must be
/// called before the first transfer; later calls lose to the memoized value.
pub fn set_mail_prefix(path: PathBuf) {
    let _ = MAIL_PREFIX.set(path);
}

/// The memoized mail spool prefix.
pub fn mail_prefix() -> &'static Path {
    MAIL_PREFIX.get_or_init(|| {
        std::env::var_os(MAIL_PREFIX_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MAIL_PREFIX))
    })
}

/// Destination for a mail-mode write: `<prefix>/<user>/<timestamp>`.
pub fn mail_target(user: &str) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    mail_prefix().join(user).join(stamp.to_string())
}

/// Resolves a client-supplied filename beneath `root`. Leading slashes are
/// stripped; `..` segments, root components, and empty names are refused.
pub fn resolve_under(root: &Path, name: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(name.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(clean))
}

/// Screens the client-supplied "filename" of a mail-mode write, which names
/// a spool user and must be a single path component.
pub fn mail_user(name: &str) -> Option<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return None;
    }
    Some(name)
}

pub async fn open_read(path: &Path) -> io::Result<File> {
    File::open(path).await
}

/// Opens a fresh temporary file for an upload to `target`. The target's
/// directory must already exist, otherwise the rename at commit could not
/// succeed; a missing directory surfaces here as NotFound.
pub async fn open_write_tmp(target: &Path) -> io::Result<(File, PathBuf)> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        let meta = fs::metadata(parent).await?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", parent.display()),
            ));
        }
    }

    let tmp = tmpname();
    let file = File::create(&tmp).await?;
    Ok((file, tmp))
}

/// Prepares the spool directory for a mail-mode target. The per-user
/// directory is created on demand, but a missing spool prefix is NotFound
/// (the engine reports it as "no such user").
pub async fn ensure_mail_dir(target: &Path) -> io::Result<()> {
    fs::metadata(mail_prefix()).await?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Commits a completed upload: flush to stable storage, then atomically
/// rename the temporary over the target.
pub async fn commit(file: &File, tmp: &Path, target: &Path) -> io::Result<()> {
    file.sync_all().await?;
    fs::rename(tmp, target).await
}
