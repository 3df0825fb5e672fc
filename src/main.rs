use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tftpd::audit::AuditLogger;
use tftpd::config::{self, LogFormat, TftpConfig};
use tftpd::engine::Engine;
use tftpd::error::{Result, TftpError};
use tftpd::filesystem;
use tftpd::transport::UdpTransport;

#[derive(Parser, Debug)]
#[command(name = "tftpd", about = "RFC 1350 TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/tftpd/tftpd.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Bind address for the server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Port to listen on (default: 69)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory to serve files from
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Spool directory for mail-mode writes
    #[arg(short, long)]
    mail_prefix: Option<PathBuf>,

    /// Log level (critical, error, warn, info, debug)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        TftpConfig::default()
    };

    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(port) = cli.port {
        config.bind_addr.set_port(port);
    }
    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(mail_prefix) = cli.mail_prefix {
        config.mail_prefix = Some(mail_prefix);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level.to_lowercase();
    }

    if cli.init_config {
        config::write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.check_config {
        config::validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    config::validate_config(&config, true)?;
    init_logging(&config)?;

    if let Some(ref prefix) = config.mail_prefix {
        filesystem::set_mail_prefix(prefix.clone());
    }

    if config.logging.audit_enabled {
        AuditLogger::server_started(&config.bind_addr, &config.root_dir);
    }

    let (tx, rx) = mpsc::channel(1024);
    let transport = UdpTransport::bind(config.bind_addr, tx.clone())?;
    info!("TFTP server listening on {}", config.bind_addr);

    let engine = Engine::new(transport, &config, tx, rx);

    tokio::select! {
        _ = engine.run() => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, aborting in-flight sessions");
        }
    }

    if config.logging.audit_enabled {
        AuditLogger::server_stopped("signal");
    }
    info!("TFTP server stopped");
    Ok(())
}

/// "critical" is accepted for operators used to syslog levels; tracing has
/// no such level, so it behaves as "error".
fn effective_level(level: &str) -> &str {
    match level {
        "critical" => "error",
        other => other,
    }
}

fn init_logging(config: &TftpConfig) -> Result<()> {
    let filter = EnvFilter::new(effective_level(&config.logging.level));

    if let Some(ref log_file) = config.logging.file {
        let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TftpError::Tftp("logging.file must include a file name".to_string()))?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // The guard flushes the writer on drop; the server logs until exit.
        Box::leak(Box::new(guard));

        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(non_blocking)
                    .init();
            }
        }
    } else {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt().json().with_env_filter(filter).init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
