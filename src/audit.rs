/// Audit logging for policy changes and firewall applications
///
/// Every mutating engine call and every orchestrator outcome is recorded as a
/// JSON line with the principal that caused it.
use crate::core::model::Principal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    CreateFirewall,
    DeleteFirewall,
    CreatePolicy,
    DeletePolicy,
    EditRule,
    CompilePolicy,
    SubmitApply,
    ApplySucceeded,
    ApplyRetry,
    ApplyFailed,
    Rollback,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Who caused the event; `system` for worker-driven outcomes
    pub principal: Principal,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        principal: Principal,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            principal,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the XDG state directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&self.log_path).await?;

        // One write per event keeps concurrent appends line-atomic
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

/// Cloneable audit handle shared by the engine and the workers.
///
/// A disabled handle drops events. Write failures are logged and never fail
/// the operation being audited.
#[derive(Clone, Default)]
pub struct Auditor {
    log: Option<Arc<AuditLog>>,
}

impl Auditor {
    pub fn disabled() -> Self {
        Self { log: None }
    }

    pub fn new(log: AuditLog) -> Self {
        Self {
            log: Some(Arc::new(log)),
        }
    }

    /// Audit log in the state directory when `enabled`, otherwise disabled.
    pub fn from_config(enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }
        match AuditLog::new() {
            Ok(log) => Self::new(log),
            Err(e) => {
                tracing::warn!("Audit log unavailable: {e}");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.log.is_some()
    }

    pub async fn record(
        &self,
        event_type: EventType,
        principal: &Principal,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        let Some(log) = &self.log else {
            return;
        };
        let event = AuditEvent::new(event_type, principal.clone(), success, details, error);
        if let Err(e) = log.log(&event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}
