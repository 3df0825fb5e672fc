//! Structured audit events.
//!
//! Every security-relevant transition is emitted through `tracing` as one
//! JSON object under the `audit_event` field, so a log aggregator can parse
//! the stream without scraping message text.

use std::net::SocketAddr;

use serde::Serialize;
use tracing::{Level, event};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    ServerStopped {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    RequestAccepted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        operation: String,
    },

    RequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        blocks: u16,
        duration_ms: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
    },

    /// A datagram that references a transfer this server does not have.
    StrayDatagram {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        detail: String,
    },
}

/// Fields present in every audit record.
#[derive(Debug, Clone, Serialize)]
pub struct CommonFields {
    /// ISO 8601 timestamp.
    pub timestamp: String,
    pub service: &'static str,
    pub severity: &'static str,
}

impl CommonFields {
    fn new(severity: &'static str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            service: "tftpd",
            severity,
        }
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"error\": \"Failed to serialize audit event: {:?}\"}}", self)
        });

        match self.severity() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn severity(&self) -> &'static str {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerStopped { common, .. }
            | AuditEvent::RequestAccepted { common, .. }
            | AuditEvent::RequestDenied { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::StrayDatagram { common, .. } => common.severity,
        }
    }
}

pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addr: &SocketAddr, root_dir: &std::path::Path) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.display().to_string(),
        }
        .log();
    }

    pub fn server_stopped(reason: &str) {
        AuditEvent::ServerStopped {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn request_accepted(client: SocketAddr, filename: &str, mode: &str, operation: &str) {
        AuditEvent::RequestAccepted {
            common: CommonFields::new("info"),
            client_addr: client.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            operation: operation.to_string(),
        }
        .log();
    }

    pub fn request_denied(client: SocketAddr, filename: &str, reason: &str) {
        AuditEvent::RequestDenied {
            common: CommonFields::new("warn"),
            client_addr: client.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn transfer_completed(
        client: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        blocks: u16,
        duration_ms: u64,
    ) {
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: client.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            blocks,
            duration_ms,
        }
        .log();
    }

    pub fn transfer_failed(client: SocketAddr, filename: &str, error: &str) {
        AuditEvent::TransferFailed {
            common: CommonFields::new("error"),
            client_addr: client.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn stray_datagram(client: SocketAddr, detail: &str) {
        AuditEvent::StrayDatagram {
            common: CommonFields::new("warn"),
            client_addr: client.to_string(),
            detail: detail.to_string(),
        }
        .log();
    }
}
