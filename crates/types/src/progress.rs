//! The canonical progress envelope and the snapshot handed to subscribers.

use std::fmt;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::status::{JobStatus, RemoteStatus};

/// Opaque, externally assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ordering key for updates coming from either transport.
///
/// `server` is the sequence number the server attached (or the highest one
/// seen so far when the update carried none); `local` breaks ties between
/// unsequenced updates in receive order. Comparison is lexicographic, which
/// the derived `Ord` gives us from the field order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
pub struct Sequence {
    #[ts(type = "number")]
    pub server: u64,
    #[ts(type = "number")]
    pub local: u64,
}

impl Sequence {
    pub const ZERO: Sequence = Sequence { server: 0, local: 0 };

    pub const fn new(server: u64, local: u64) -> Self {
        Self { server, local }
    }

    /// A sequence that came straight from the server.
    pub const fn server(server: u64) -> Self {
        Self { server, local: 0 }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.server, self.local)
    }
}

/// One normalised progress report, whichever transport delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub status: RemoteStatus,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    pub stage: String,
    pub message: String,
    #[ts(type = "number")]
    pub processed_count: u64,
    #[ts(type = "number")]
    pub total_count: u64,
    pub sequence: Sequence,
    /// The server restarted the job; the progress baseline resets.
    #[serde(default)]
    pub restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressUpdate {
    pub fn new(job_id: impl Into<JobId>, status: RemoteStatus, progress: f64) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            progress,
            stage: String::new(),
            message: String::new(),
            processed_count: 0,
            total_count: 0,
            sequence: Sequence::ZERO,
            restart: false,
            result: None,
            error: None,
        }
    }

    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_counts(mut self, processed: u64, total: u64) -> Self {
        self.processed_count = processed;
        self.total_count = total;
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn restarting(mut self) -> Self {
        self.restart = true;
        self
    }
}

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The server reported the job itself as failed.
    Job,
    /// The retry budget of every transport ran out.
    Transport,
    /// The last transport gave up after repeated timeouts.
    Timeout,
    /// The server refused the push channel with an application close code.
    Rejected,
}

/// Terminal error carried on a failed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Canonical state of one tracked job, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../bindings/"))]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: f64,
    pub stage: String,
    pub message: String,
    #[ts(type = "number")]
    pub processed_count: u64,
    #[ts(type = "number")]
    pub total_count: u64,
    /// Sequence of the last applied update; `None` until the first one.
    pub sequence: Option<Sequence>,
    /// Sequence of the restart the current progress baseline began at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_at: Option<Sequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
}

impl JobSnapshot {
    /// Initial state of a freshly created handle.
    pub fn pending(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            progress: 0.0,
            stage: String::new(),
            message: String::new(),
            processed_count: 0,
            total_count: 0,
            sequence: None,
            restart_at: None,
            result: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
