//! Per-build log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build::BuildId;

/// Classification of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    StepStarted,
    StepCompleted,
    StepFailed,
    Info,
    Warning,
    Error,
    Output,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::StepStarted => "step_started",
            LogKind::StepCompleted => "step_completed",
            LogKind::StepFailed => "step_failed",
            LogKind::Info => "info",
            LogKind::Warning => "warning",
            LogKind::Error => "error",
            LogKind::Output => "output",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "step_started" => Some(LogKind::StepStarted),
            "step_completed" => Some(LogKind::StepCompleted),
            "step_failed" => Some(LogKind::StepFailed),
            "info" => Some(LogKind::Info),
            "warning" => Some(LogKind::Warning),
            "error" => Some(LogKind::Error),
            "output" => Some(LogKind::Output),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted log line.
///
/// `sequence` is dense and strictly increasing per build; the pair
/// `(build_id, sequence)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub build_id: BuildId,
    pub sequence: i64,
    pub kind: LogKind,
    /// Step the line belongs to, when inside a step bracket
    pub step_name: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}
