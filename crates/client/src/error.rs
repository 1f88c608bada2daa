use std::time::Duration;

use jobwatch_types::{FailureKind, JobFailure};
use thiserror::Error;

/// Everything that can go wrong while tracking a job.
///
/// Transient variants are absorbed by the transports (retry, "reconnecting");
/// the rest end the job timeline exactly once. Caller cancellation is not an
/// error: it is the `cancelled` job status.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("stream rejected by server (code {code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TrackError {
    /// Whether the transport that hit this error should try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// Terminal failure to record on the snapshot, if this error is one.
    pub fn to_failure(&self) -> Option<JobFailure> {
        let kind = match self {
            Self::Transport(_) => FailureKind::Transport,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::JobFailed(_) => FailureKind::Job,
            Self::Rejected { .. } => FailureKind::Rejected,
            Self::Protocol(_) | Self::Config(_) => return None,
        };
        let message = match self {
            Self::JobFailed(msg) => msg.clone(),
            other => other.to_string(),
        };
        Some(JobFailure::new(kind, message))
    }
}

impl From<reqwest::Error> for TrackError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Protocol(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TrackError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackError>;
