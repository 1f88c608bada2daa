//! Shared types for jobwatch.
//!
//! Everything the client and the dev server need to agree on lives here:
//! the canonical progress envelope ([`ProgressUpdate`]), the snapshot handed
//! to subscribers ([`JobSnapshot`]), the lifecycle enums and the raw wire
//! shapes of the REST status endpoint and the push channel.

pub mod progress;
pub mod status;
pub mod wire;

pub use progress::{FailureKind, JobFailure, JobId, JobSnapshot, ProgressUpdate, Sequence};
pub use status::{ConnectionState, JobStatus, RemoteStatus, UnknownStatus};
pub use wire::{frame, ClientAction, StatusBody, StreamMessage};
