//! Raw wire bodies -> canonical [`ProgressUpdate`]s.
//!
//! Anything that cannot be normalised comes back as
//! [`TrackError::Protocol`]; transports log and drop those.

use std::sync::Mutex;

use jobwatch_types::{frame, JobId, ProgressUpdate, RemoteStatus, Sequence, StatusBody, StreamMessage};

use crate::config::ProgressScale;
use crate::error::{Result, TrackError};

/// Issues the ordering key for every update of one handle, whichever
/// transport received it.
///
/// Server sequence numbers are passed through and raise the clock;
/// unsequenced updates are stamped `(highest server seen, next local tick)`.
#[derive(Debug, Default)]
pub struct SequenceClock {
    state: Mutex<Sequence>,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&self, server: Option<u64>, restart: bool) -> Sequence {
        let mut last = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match server {
            Some(seq) => {
                if restart || seq > last.server {
                    *last = Sequence::server(seq);
                }
                Sequence::server(seq)
            }
            None => {
                // Local ticks keep counting so stamps stay unique across a reset.
                if restart {
                    last.server = 0;
                }
                last.local += 1;
                *last
            }
        }
    }
}

/// Convert a raw `progress` value in `scale` units to a fraction.
pub fn normalize_progress(raw: f64, scale: ProgressScale) -> Result<f64> {
    let (fraction, max) = match scale {
        ProgressScale::Fraction => (raw, 1.0),
        ProgressScale::Percent => (raw / 100.0, 100.0),
    };
    if raw.is_nan() || raw < 0.0 || raw > max {
        return Err(TrackError::Protocol(format!(
            "progress {raw} out of range for {scale:?} scale"
        )));
    }
    Ok(fraction)
}

/// The scale a body actually used. A body that carries processed/total
/// counts settles it: whichever reading lies closer to `processed / total`.
fn resolve_scale(raw: f64, processed: u64, total: u64, configured: ProgressScale) -> ProgressScale {
    if processed == 0 || total == 0 {
        return configured;
    }
    let counted = processed as f64 / total as f64;
    let as_fraction = (raw - counted).abs();
    let as_percent = (raw / 100.0 - counted).abs();
    if as_fraction < as_percent {
        ProgressScale::Fraction
    } else if as_percent < as_fraction {
        ProgressScale::Percent
    } else {
        configured
    }
}

/// Normalise a `GET /jobs/{id}/status` body. The status field is required.
pub fn from_status_body(
    job_id: &JobId,
    body: StatusBody,
    scale: ProgressScale,
    clock: &SequenceClock,
) -> Result<ProgressUpdate> {
    build(job_id, body, None, scale, clock)
}

/// Normalise one push frame. Keepalive frames yield `Ok(None)`.
pub fn from_stream_message(
    job_id: &JobId,
    msg: StreamMessage,
    scale: ProgressScale,
    clock: &SequenceClock,
) -> Result<Option<ProgressUpdate>> {
    let StreamMessage { kind, body, data } = msg;
    match kind.as_str() {
        frame::PROGRESS | frame::GENERATION_PROGRESS | frame::EXECUTION_PROGRESS => {
            build(job_id, body, Some(RemoteStatus::Running), scale, clock).map(Some)
        }
        frame::RESULT => {
            let mut update = build(job_id, body, Some(RemoteStatus::Completed), scale, clock)?;
            update.status = RemoteStatus::Completed;
            update.progress = 1.0;
            update.result = data;
            Ok(Some(update))
        }
        frame::ERROR => {
            let error = body
                .error
                .clone()
                .or_else(|| body.message.clone())
                .unwrap_or_else(|| "job failed without an error message".to_string());
            let mut update = build(job_id, body, Some(RemoteStatus::Failed), scale, clock)?;
            update.status = RemoteStatus::Failed;
            update.error = Some(error);
            Ok(Some(update))
        }
        frame::PONG => Ok(None),
        other => Err(TrackError::Protocol(format!("unknown frame type {other:?}"))),
    }
}

fn build(
    job_id: &JobId,
    body: StatusBody,
    default_status: Option<RemoteStatus>,
    scale: ProgressScale,
    clock: &SequenceClock,
) -> Result<ProgressUpdate> {
    let status = match (body.status.as_deref(), default_status) {
        (Some(raw), _) => raw
            .parse::<RemoteStatus>()
            .map_err(|e| TrackError::Protocol(e.to_string()))?,
        (None, Some(fallback)) => fallback,
        (None, None) => return Err(TrackError::Protocol("status body has no status".into())),
    };

    let processed = body.processed.unwrap_or(0);
    let total = body.total.unwrap_or(0);
    // Without an explicit value, derive progress from the counters.
    let progress = match body.progress {
        Some(raw) => normalize_progress(raw, resolve_scale(raw, processed, total, scale))?,
        None if total > 0 => (processed as f64 / total as f64).min(1.0),
        None => 0.0,
    };

    let sequence = clock.stamp(body.sequence, body.restart);
    Ok(ProgressUpdate {
        job_id: job_id.clone(),
        status,
        progress,
        stage: body.stage.unwrap_or_default(),
        message: body.message.unwrap_or_default(),
        processed_count: processed,
        total_count: total,
        sequence,
        restart: body.restart,
        result: None,
        error: body.error,
    })
}
