/// Audit logging for privileged operations
///
/// Every apply, confirm, enable, disable and reload is recorded as one JSON
/// object per line in the state directory, so the history of a remote host
/// can be reconstructed after the fact.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Apply,
    ArmSafeguard,
    Confirm,
    Enable,
    Disable,
    Reload,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
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
    /// Opens the log in the state directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined.
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written.
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads up to `count` of the most recent events, newest first.
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
}

/// Writes `event` to the default log. Failures are only warned about.
pub async fn record(
    event_type: EventType,
    success: bool,
    details: serde_json::Value,
    error: Option<String>,
) {
    if let Ok(audit) = AuditLog::new() {
        let event = AuditEvent::new(event_type, success, details, error);

        if let Err(e) = audit.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Logs an apply attempt
pub async fn log_apply(candidate: &str, delay: &str, success: bool, error: Option<String>) {
    record(
        EventType::Apply,
        success,
        serde_json::json!({
            "candidate": candidate,
            "delay": delay,
        }),
        error,
    )
    .await;
}

/// Logs the rollback job being armed
pub async fn log_arm(job: &str, known_good: &str, delay: &str) {
    record(
        EventType::ArmSafeguard,
        true,
        serde_json::json!({
            "job": job,
            "known_good": known_good,
            "delay": delay,
        }),
        None,
    )
    .await;
}

/// Logs a confirm attempt
pub async fn log_confirm(
    candidate: &str,
    destination: &str,
    success: bool,
    error: Option<String>,
) {
    record(
        EventType::Confirm,
        success,
        serde_json::json!({
            "candidate": candidate,
            "destination": destination,
        }),
        error,
    )
    .await;
}
