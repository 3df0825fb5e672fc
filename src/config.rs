use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TftpError};
use crate::session::{RTT_MAX_DEFAULT, RTT_MIN_DEFAULT, RttClamps};

/// The well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    /// Directory client filenames are resolved beneath.
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Overrides the `TFTP_MAIL_PREFIX` environment variable for mail-mode
    /// writes.
    pub mail_prefix: Option<PathBuf>,
    pub write: WriteConfig,
    pub logging: LoggingConfig,
    pub rtt: RttConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/srv/tftp"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            mail_prefix: None,
            write: WriteConfig::default(),
            logging: LoggingConfig::default(),
            rtt: RttConfig::default(),
        }
    }
}

/// Write operation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Accept WRQs at all.
    pub enabled: bool,

    /// Allow a WRQ to replace an existing file. When false the server
    /// answers "File already exists" per RFC 1350.
    pub allow_overwrite: bool,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_overwrite: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of: critical, error, warn, info, debug.
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured audit events alongside normal logging.
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability.
    Text,
    /// JSON structured logging for log aggregators.
    Json,
}

/// Clamp bounds for the per-session smoothed RTT, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RttConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            min_ms: RTT_MIN_DEFAULT.as_millis() as u64,
            max_ms: RTT_MAX_DEFAULT.as_millis() as u64,
        }
    }
}

impl RttConfig {
    pub fn clamps(&self) -> RttClamps {
        RttClamps {
            min: Duration::from_millis(self.min_ms),
            max: Duration::from_millis(self.max_ms),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["critical", "error", "warn", "info", "debug"];

pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Tftp(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validates a configuration before the server binds. `validate_bind`
/// additionally probes that the bind address is actually available.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Tftp(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Tftp("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Tftp(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Tftp(format!("root_dir is not readable: {}", e)));
    }

    if config.bind_addr.port() == 0 && validate_bind {
        // Port 0 is allowed for tests but meaningless for a real server.
        return Err(TftpError::Tftp(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(TftpError::Tftp(format!(
            "unrecognized log level {:?}; valid levels are: {}",
            config.logging.level,
            LOG_LEVELS.join(", ")
        )));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Tftp("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Tftp(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => return Err(TftpError::Tftp(format!("logging.file parent error: {}", e))),
        }
    }

    if config.rtt.min_ms == 0 || config.rtt.min_ms >= config.rtt.max_ms {
        return Err(TftpError::Tftp(
            "rtt clamps must satisfy 0 < min_ms < max_ms".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Tftp(format!("bind_addr is not available: {}", e)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::io::Result<PathBuf> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("tftpd_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root_dir = temp_dir("parse")?;
        let toml = format!(
            r#"
root_dir = "{}"
bind_addr = "127.0.0.1:6969"

[write]
enabled = false

[rtt]
max_ms = 250
"#,
            root_dir.display()
        );
        let config: TftpConfig = toml::from_str(&toml)?;
        assert!(!config.write.enabled);
        assert_eq!(config.rtt.min_ms, 5);
        assert_eq!(config.rtt.max_ms, 250);
        validate_config(&config, false)?;
        Ok(())
    }

    #[test]
    fn defaults_survive_a_config_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let dir = temp_dir("roundtrip")?;
        let path = dir.join("tftpd.toml");
        write_config(&path, &TftpConfig::default())?;
        let loaded = load_config(&path)?;
        assert_eq!(loaded.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(loaded.root_dir, PathBuf::from("/srv/tftp"));
        assert!(loaded.write.enabled);
        Ok(())
    }

    #[test]
    fn rejects_non_absolute_root_dir() {
        let config = TftpConfig {
            root_dir: PathBuf::from("relative/path"),
            ..Default::default()
        };
        let err = validate_config(&config, false).unwrap_err();
        assert!(format!("{err}").contains("root_dir must be an absolute path"));
    }

    #[test]
    fn rejects_missing_root_dir() {
        let config = TftpConfig {
            root_dir: PathBuf::from("/nonexistent/tftpd-root"),
            ..Default::default()
        };
        let err = validate_config(&config, false).unwrap_err();
        assert!(format!("{err}").contains("root_dir does not exist"));
    }

    #[test]
    fn rejects_unknown_log_level() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("loglevel")?;
        config.logging.level = "verbose".to_string();
        let err = validate_config(&config, false).unwrap_err();
        assert!(format!("{err}").contains("unrecognized log level"));
        Ok(())
    }

    #[test]
    fn rejects_inverted_rtt_clamps() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("rtt")?;
        config.rtt.min_ms = 600;
        let err = validate_config(&config, false).unwrap_err();
        assert!(format!("{err}").contains("rtt clamps"));
        Ok(())
    }

    #[test]
    fn rejects_bind_addr_when_in_use() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-in-use")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        let err = validate_config(&config, true).unwrap_err();
        assert!(format!("{err}").contains("bind_addr is not available"));
        Ok(())
    }

    #[test]
    fn validates_bind_addr_on_free_port() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();
        drop(socket);

        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-free")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        validate_config(&config, true)?;
        Ok(())
    }
}
