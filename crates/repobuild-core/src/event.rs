//! Progress events emitted while a build runs.
//!
//! A build produces two independent sequences: status changes driven by the
//! cluster's view of the build job, and log lines read from the builder
//! container. Both travel to the consumer as [`ProgressEvent`]s.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// Phase reported for log lines that could not be parsed.
pub const UNKNOWN_LOG_PHASE: &str = "unknown";

/// Something that happened during a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The build moved to a new status.
    StatusChange(BuildStatus),
    /// The builder wrote a log line.
    LogMessage(LogLine),
}

impl ProgressEvent {
    /// Whether this event ends the build lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::StatusChange(status) if status.is_terminal())
    }
}

/// Status of a build as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("built")]
    Built,
    #[display("failed")]
    Failed,
    #[display("unknown")]
    Unknown,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Built | BuildStatus::Failed)
    }
}

/// A structured line of builder output.
///
/// The builder writes newline-delimited JSON objects carrying at least a
/// `phase` and a `message`. Any other fields are kept in `extra` so they
/// reach the consumer untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub phase: String,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogLine {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            message: message.into(),
            extra: Map::new(),
        }
    }

    /// Wrap raw, unstructured output with the `unknown` phase.
    pub fn unknown(raw: impl Into<String>) -> Self {
        Self::new(UNKNOWN_LOG_PHASE, raw)
    }

    /// Parse one line of structured builder output.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Parse one line, falling back to [`LogLine::unknown`] for anything
    /// that is not a `{phase, message}` object.
    pub fn parse_lossy(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|_| Self::unknown(raw))
    }

    /// Render back to the JSON wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"phase":{:?},"message":{:?}}}"#,
                self.phase, self.message
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(BuildStatus::Built.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(!BuildStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&BuildStatus::Built).unwrap();
        assert_eq!(json, r#""built""#);
        assert_eq!(BuildStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_parse_structured_line() {
        let line = LogLine::parse(r#"{"phase":"building","message":"Step 1/4\n"}"#).unwrap();
        assert_eq!(line.phase, "building");
        assert_eq!(line.message, "Step 1/4\n");
        assert!(line.extra.is_empty());
    }

    #[test]
    fn test_extra_fields_preserved() {
        let raw = r#"{"phase":"built","message":"done","imageId":"sha256:abc"}"#;
        let line = LogLine::parse(raw).unwrap();
        assert_eq!(line.extra.get("imageId"), Some(&Value::from("sha256:abc")));

        let back: Value = serde_json::from_str(&line.to_json()).unwrap();
        assert_eq!(back["imageId"], "sha256:abc");
    }

    #[test]
    fn test_non_json_wrapped_as_unknown() {
        let line = LogLine::parse_lossy("not json");
        assert_eq!(line, LogLine::new("unknown", "not json"));

        let wire: Value = serde_json::from_str(&line.to_json()).unwrap();
        assert_eq!(
            wire,
            serde_json::json!({"phase": "unknown", "message": "not json"})
        );
    }

    #[test]
    fn test_json_without_phase_wrapped() {
        let raw = r#"{"message":"no phase here"}"#;
        let line = LogLine::parse_lossy(raw);
        assert_eq!(line.phase, UNKNOWN_LOG_PHASE);
        assert_eq!(line.message, raw);
    }

    #[test]
    fn test_progress_event_terminal() {
        assert!(ProgressEvent::StatusChange(BuildStatus::Failed).is_terminal());
        assert!(!ProgressEvent::StatusChange(BuildStatus::Running).is_terminal());
        assert!(!ProgressEvent::LogMessage(LogLine::unknown("x")).is_terminal());
    }

    #[test]
    fn test_progress_event_wire_shape() {
        let event = ProgressEvent::StatusChange(BuildStatus::Pending);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "status_change", "payload": "pending"})
        );
    }
}
