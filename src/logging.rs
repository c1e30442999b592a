//! Structured logging for the signing operator
//!
//! Plain `tracing` macros are used throughout the crate. The helpers here add
//! category-tagged JSON events for the operations an operator is audited on:
//! keyshare consumption, signing rounds, federation fan-out failures and
//! transfer state changes.

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Keyshare,
    Dkg,
    Signing,
    Transfer,
    Federation,
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (RFC 3339)
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    /// Transfer id, DKG request id, or other correlation key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for failed events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_filter().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

/// Log a transfer state change or a rejected transfer operation
pub fn log_transfer_event(
    event_type: &str,
    transfer_id: &str,
    status: &str,
    error: Option<(&str, &str)>,
) {
    let level = if error.is_some() {
        LogLevel::Warn
    } else {
        LogLevel::Info
    };
    let mut event = LogEvent::new(level, EventCategory::Transfer, event_type)
        .with_correlation_id(transfer_id)
        .with_data(serde_json::json!({
            "transfer_id": transfer_id,
            "status": status,
        }));

    if let Some((code, message)) = error {
        event = event.with_error(code, message);
        tracing::warn!(target: "frost_operator::transfer", "{}", event.to_json());
    } else {
        tracing::info!(target: "frost_operator::transfer", "{}", event.to_json());
    }
}

/// Log keyshare pool consumption
pub fn log_keyshare_event(event_type: &str, count: usize, remaining: usize) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Keyshare, event_type).with_data(
        serde_json::json!({
            "count": count,
            "remaining": remaining,
        }),
    );
    tracing::info!(target: "frost_operator::keyshare", "{}", event.to_json());
}

/// Log a distributed signing outcome
pub fn log_signing_event(event_type: &str, jobs: usize, adaptor_jobs: usize, error: Option<(&str, &str)>) {
    let level = if error.is_some() {
        LogLevel::Warn
    } else {
        LogLevel::Info
    };
    let mut event = LogEvent::new(level, EventCategory::Signing, event_type).with_data(
        serde_json::json!({
            "jobs": jobs,
            "adaptor_jobs": adaptor_jobs,
        }),
    );

    if let Some((code, message)) = error {
        event = event.with_error(code, message);
        tracing::warn!(target: "frost_operator::signing", "{}", event.to_json());
    } else {
        tracing::info!(target: "frost_operator::signing", "{}", event.to_json());
    }
}

/// Log the operators a fan-out could not reach or was rejected by
pub fn log_fanout_failure(selected: usize, failed: &[String], unavailable: bool) {
    let event = LogEvent::new(LogLevel::Warn, EventCategory::Federation, "fanout_failed")
        .with_data(serde_json::json!({
            "selected": selected,
            "failed": failed,
        }))
        .with_error(
            if unavailable {
                "PEER_UNAVAILABLE"
            } else {
                "PEER_REJECTED"
            },
            format!("{} of {} operators failed", failed.len(), selected),
        );
    tracing::warn!(target: "frost_operator::federation", "{}", event.to_json());
}

/// Log the failure of a detached task
pub fn log_detached_failure(category: EventCategory, task: &str, correlation_id: &str, err: &str) {
    let event = LogEvent::new(LogLevel::Error, category, task)
        .with_correlation_id(correlation_id)
        .with_error("DETACHED_TASK_FAILED", err);
    tracing::error!(target: "frost_operator::detached", "{}", event.to_json());
}

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = Level::from(level);
        EnvFilter::new(format!(
            "frost_operator={level},tower_http={level},axum={level}"
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from the federation config
pub fn init_from_config(config: &crate::config::FederationConfig) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Transfer, "transfer_created")
            .with_correlation_id("8d1c")
            .with_data(serde_json::json!({"status": "sender_initiated"}))
            .with_error("LEAF_LOCKED", "leaf is locked");

        let json = event.to_json();
        assert!(json.contains("transfer_created"));
        assert!(json.contains("8d1c"));
        assert!(json.contains("\"category\":\"transfer\""));
        assert!(json.contains("LEAF_LOCKED"));
    }

    #[test]
    fn test_fanout_failure_event() {
        let event = LogEvent::new(LogLevel::Warn, EventCategory::Federation, "fanout_failed")
            .with_data(serde_json::json!({"failed": ["0000000000000000000000000000000000000000000000000000000000000002"]}));
        let json = event.to_json();
        assert!(json.contains("\"category\":\"federation\""));
        assert!(json.contains("\"level\":\"WARN\""));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::from("nonsense"), LogLevel::Info);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
    }
}
