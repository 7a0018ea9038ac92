use crate::error::TrainingError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle status of a training run or tokenizer job.
///
/// Transitions only move forward: `queued -> running -> {completed|failed}`.
/// Cancellation is not a status; a cancelled run ends as `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Writing the same status again is allowed so heartbeat-style rewrites
    /// and re-delivered jobs stay harmless.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Queued => true,
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TrainingError::InvalidRequest(format!("unknown run status: {other}"))),
        }
    }
}

/// Raw status strings the artifact cleanup accepts as finished.
///
/// `canceled` is never written by the worker but external tooling may set it.
pub const TERMINAL_STATUS_STRINGS: [&str; 3] = ["completed", "failed", "canceled"];

#[must_use]
pub fn is_terminal_status_str(raw: &str) -> bool {
    TERMINAL_STATUS_STRINGS.contains(&raw.trim())
}
