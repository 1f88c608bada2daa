use std::sync::Arc;

use dashmap::DashMap;
use jobwatch_types::{StatusBody, StreamMessage};
use serde_json::Value;
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 64;

/// What the server knows about one job.
#[derive(Debug, Clone, Default)]
pub struct JobRecord {
    pub body: StatusBody,
    /// Payload of the `result` frame once completed.
    pub result: Option<Value>,
}

impl JobRecord {
    /// The frame a freshly connected socket gets first.
    pub fn frame(&self) -> StreamMessage {
        match self.body.status.as_deref() {
            Some("completed") => {
                StreamMessage::result(self.body.clone(), self.result.clone().unwrap_or(Value::Null))
            }
            Some("failed") => {
                let error = self.body.error.clone().unwrap_or_else(|| "job failed".into());
                StreamMessage::error(self.body.clone(), error)
            }
            _ => StreamMessage::progress(self.body.clone()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.body.status.as_deref(),
            Some("completed" | "failed" | "cancelled")
        )
    }
}

/// Pushed to every socket watching a job.
#[derive(Debug, Clone)]
pub enum Feed {
    Message(StreamMessage),
    /// Close the socket with this code (simulated server-side drop).
    Drop { code: u16, reason: String },
}

/// Shared dev server state. Cloning is cheap.
#[derive(Clone, Default)]
pub struct DevState {
    /// Current record per job id.
    pub jobs: Arc<DashMap<String, JobRecord>>,
    feeds: Arc<DashMap<String, broadcast::Sender<Feed>>>,
}

impl DevState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a known job's feed and read its current record.
    ///
    /// Unknown ids get `None` and leave no feed behind.
    pub fn attach(&self, job_id: &str) -> Option<(broadcast::Receiver<Feed>, JobRecord)> {
        let record = self.jobs.get(job_id)?;
        // The record stays read-locked until we are subscribed, so a
        // concurrent publish is either in `record` or on the feed.
        let rx = self.feed(job_id).subscribe();
        Some((rx, record.clone()))
    }

    /// Number of sockets currently attached to a job.
    pub fn stream_count(&self, job_id: &str) -> usize {
        self.feeds
            .get(job_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn record(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.get(job_id).map(|r| r.clone())
    }

    /// Register a job as queued. Returns false if it is already known and
    /// still running.
    pub fn create(&self, job_id: &str) -> bool {
        if self.jobs.get(job_id).is_some_and(|r| !r.is_terminal()) {
            return false;
        }
        let body = StatusBody {
            status: Some("queued".into()),
            progress: Some(0.0),
            restart: self.jobs.contains_key(job_id),
            ..Default::default()
        };
        let stamped = self.store(job_id, body, None);
        self.send(job_id, Feed::Message(StreamMessage::progress(stamped)));
        true
    }

    /// Store a new status and push it as a `progress` frame. Returns the
    /// sequence number it was stamped with.
    pub fn publish(&self, job_id: &str, body: StatusBody) -> u64 {
        let stamped = self.store(job_id, body, None);
        let seq = stamped.sequence.unwrap_or_default();
        self.send(job_id, Feed::Message(StreamMessage::progress(stamped)));
        seq
    }

    pub fn finish(&self, job_id: &str, data: Value) -> u64 {
        let previous = self.record(job_id).unwrap_or_default().body;
        let body = StatusBody {
            status: Some("completed".into()),
            progress: Some(1.0),
            restart: false,
            error: None,
            ..previous
        };
        let stamped = self.store(job_id, body, Some(data.clone()));
        let seq = stamped.sequence.unwrap_or_default();
        self.send(job_id, Feed::Message(StreamMessage::result(stamped, data)));
        seq
    }

    pub fn fail(&self, job_id: &str, error: &str) -> u64 {
        let previous = self.record(job_id).unwrap_or_default().body;
        let body = StatusBody {
            status: Some("failed".into()),
            error: Some(error.to_string()),
            restart: false,
            ..previous
        };
        let stamped = self.store(job_id, body, None);
        let seq = stamped.sequence.unwrap_or_default();
        self.send(job_id, Feed::Message(StreamMessage::error(stamped, error)));
        seq
    }

    /// Close every socket on this job with `code`.
    pub fn drop_streams(&self, job_id: &str, code: u16, reason: &str) {
        self.send(
            job_id,
            Feed::Drop {
                code,
                reason: reason.to_string(),
            },
        );
    }

    fn store(&self, job_id: &str, mut body: StatusBody, result: Option<Value>) -> StatusBody {
        let mut record = self.jobs.entry(job_id.to_string()).or_default();
        let seq = if body.restart {
            1
        } else {
            record.body.sequence.unwrap_or(0) + 1
        };
        body.sequence = Some(seq);
        body.updated_at = Some(chrono::Utc::now().to_rfc3339());
        record.body = body.clone();
        record.result = result;
        body
    }

    fn feed(&self, job_id: &str) -> broadcast::Sender<Feed> {
        self.feeds
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn send(&self, job_id: &str, feed: Feed) {
        if let Some(tx) = self.feeds.get(job_id) {
            // No receivers is fine: nobody is watching right now.
            let _ = tx.send(feed);
        }
    }
}
