//! The single place job state changes.
//!
//! [`reduce`] is pure: it borrows the current snapshot and either hands the
//! same reference back (nothing observable changed) or returns a new owned
//! snapshot. Callers notify subscribers only in the second case, which makes
//! re-applying a duplicate from the other transport a no-op.
//!
//! Rules, in order:
//! - a terminal snapshot never changes;
//! - an update whose sequence is not newer than the last applied one is
//!   dropped. The only exception is the first restart marker: it resets
//!   the baseline and is recorded in `restart_at`, after which restart
//!   markers are ordered like any other update;
//! - a non-terminal update that would move progress backwards is dropped
//!   unless it is an accepted restart; a terminal one is applied with
//!   progress held at its current value;
//! - processed counts never go backwards.

use std::borrow::Cow;

use jobwatch_types::{
    FailureKind, JobFailure, JobSnapshot, JobStatus, ProgressUpdate, RemoteStatus,
};

use crate::error::TrackError;
use crate::transport::TransportEvent;

/// Inputs to the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The handle spun up its transports.
    Started,
    Transport(TransportEvent),
    /// Caller-initiated termination.
    Cancelled,
}

impl From<TransportEvent> for JobEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

pub fn reduce<'a>(state: &'a JobSnapshot, event: &JobEvent) -> Cow<'a, JobSnapshot> {
    if state.is_terminal() {
        return Cow::Borrowed(state);
    }
    match event {
        JobEvent::Started => match state.status {
            JobStatus::Pending => with_status(state, JobStatus::Connecting),
            _ => Cow::Borrowed(state),
        },
        JobEvent::Cancelled => with_status(state, JobStatus::Cancelled),
        JobEvent::Transport(TransportEvent::Update(update)) => apply(state, update),
        JobEvent::Transport(TransportEvent::Connected) => match state.status {
            JobStatus::Pending | JobStatus::Connecting | JobStatus::Reconnecting => {
                with_status(state, JobStatus::Running)
            }
            _ => Cow::Borrowed(state),
        },
        JobEvent::Transport(TransportEvent::Interrupted(_)) => match state.status {
            JobStatus::Connecting | JobStatus::Running => {
                with_status(state, JobStatus::Reconnecting)
            }
            _ => Cow::Borrowed(state),
        },
        JobEvent::Transport(TransportEvent::Fatal(err)) => {
            let mut next = state.clone();
            next.status = JobStatus::Failed;
            next.failure = Some(
                err.to_failure()
                    .unwrap_or_else(|| JobFailure::new(FailureKind::Transport, err.to_string())),
            );
            Cow::Owned(next)
        }
    }
}

/// Apply one progress update.
pub fn apply<'a>(state: &'a JobSnapshot, update: &ProgressUpdate) -> Cow<'a, JobSnapshot> {
    if state.is_terminal() || update.job_id != state.job_id {
        return Cow::Borrowed(state);
    }
    let newer = state.sequence.map_or(true, |last| update.sequence > last);
    let restart = update.restart && (state.restart_at.is_none() || newer);
    if !newer && !restart {
        return Cow::Borrowed(state);
    }

    let status = match update.status {
        RemoteStatus::Queued | RemoteStatus::Running => JobStatus::Running,
        RemoteStatus::Completed => JobStatus::Completed,
        RemoteStatus::Failed => JobStatus::Failed,
        RemoteStatus::Cancelled => JobStatus::Cancelled,
    };

    let progress = if restart {
        update.progress
    } else if update.progress < state.progress {
        if !status.is_terminal() {
            return Cow::Borrowed(state);
        }
        state.progress
    } else {
        update.progress
    };
    let progress = if status == JobStatus::Completed {
        1.0
    } else {
        progress
    };

    let processed_count = if restart {
        update.processed_count
    } else {
        state.processed_count.max(update.processed_count)
    };
    let total_count = if update.total_count > 0 {
        update.total_count
    } else {
        state.total_count
    };

    let failure = if status == JobStatus::Failed {
        let message = update
            .error
            .clone()
            .or_else(|| (!update.message.is_empty()).then(|| update.message.clone()))
            .unwrap_or_else(|| "job failed".to_string());
        TrackError::JobFailed(message).to_failure()
    } else {
        None
    };

    let next = JobSnapshot {
        job_id: state.job_id.clone(),
        status,
        progress,
        stage: keep_unless_empty(&state.stage, &update.stage),
        message: keep_unless_empty(&state.message, &update.message),
        processed_count,
        total_count,
        sequence: Some(update.sequence),
        restart_at: if restart {
            Some(update.sequence)
        } else {
            state.restart_at
        },
        result: update.result.clone().or_else(|| state.result.clone()),
        failure,
    };

    if same_observable_state(state, &next) && next.restart_at == state.restart_at {
        Cow::Borrowed(state)
    } else {
        Cow::Owned(next)
    }
}

fn with_status(state: &JobSnapshot, status: JobStatus) -> Cow<'_, JobSnapshot> {
    let mut next = state.clone();
    next.status = status;
    Cow::Owned(next)
}

fn keep_unless_empty(current: &str, incoming: &str) -> String {
    if incoming.is_empty() {
        current.to_string()
    } else {
        incoming.to_string()
    }
}

/// Everything a subscriber can see, i.e. all fields except the sequences.
fn same_observable_state(a: &JobSnapshot, b: &JobSnapshot) -> bool {
    a.status == b.status
        && a.progress == b.progress
        && a.stage == b.stage
        && a.message == b.message
        && a.processed_count == b.processed_count
        && a.total_count == b.total_count
        && a.result == b.result
        && a.failure == b.failure
}
