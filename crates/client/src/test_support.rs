//! Scripted status source for driving the poll loop under paused time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use jobwatch_types::{JobId, StatusBody};

use crate::error::{Result, TrackError};
use crate::transport::StatusSource;

#[derive(Debug, Clone)]
pub enum Step {
    Reply(StatusBody),
    Fail(TrackError),
    Slow(Duration, StatusBody),
}

/// Plays `steps` in order, then repeats the last one forever.
pub struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        if let Some(step) = steps.pop_front() {
            *last = Some(step.clone());
            return step;
        }
        last.clone().unwrap_or_else(|| Step::Fail(TrackError::Transport("empty script".into())))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn fetch_status(&self, _job_id: &JobId) -> Result<StatusBody> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match self.next_step() {
            Step::Reply(body) => Ok(body),
            Step::Fail(e) => Err(e),
            Step::Slow(delay, body) => {
                tokio::time::sleep(delay).await;
                Ok(body)
            }
        }
    }
}

pub fn body(status: &str, progress: f64) -> StatusBody {
    StatusBody {
        status: Some(status.to_string()),
        progress: Some(progress),
        ..Default::default()
    }
}
