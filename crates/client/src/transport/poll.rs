//! Request-based status polling.
//!
//! One request per tick, never more than one in flight: the loop awaits each
//! request before waiting for the next tick, and ticks that fall due while a
//! request is still outstanding are skipped rather than queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobwatch_types::{ConnectionState, JobId, StatusBody};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{EventSink, TransportEvent};
use crate::config::{PollConfig, WatchConfig};
use crate::error::{Result, TrackError};
use crate::normalize::{self, SequenceClock};

/// Fetches the raw status of one job.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn fetch_status(&self, job_id: &JobId) -> Result<StatusBody>;
}

/// [`StatusSource`] backed by `GET {base_url}{status_path}`.
pub struct HttpStatusSource {
    http: reqwest::Client,
    config: WatchConfig,
}

impl HttpStatusSource {
    pub fn new(config: WatchConfig) -> Result<Self> {
        config.validate()?;
        crate::install_crypto_provider();
        let http = reqwest::Client::builder()
            .timeout(config.poll.request_timeout)
            .build()
            .map_err(|e| TrackError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch_status(&self, job_id: &JobId) -> Result<StatusBody> {
        let url = self.config.status_url(job_id);
        let timeout = self.config.poll.request_timeout;
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                TrackError::Timeout(timeout)
            } else {
                TrackError::from(e)
            }
        };

        let response = self.http.get(&url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackError::Transport(format!("GET {url} returned {status}")));
        }
        let text = response.text().await.map_err(classify)?;
        serde_json::from_str(&text)
            .map_err(|e| TrackError::Protocol(format!("malformed status body from {url}: {e}")))
    }
}

/// Periodic status fetcher for one job.
///
/// Stops on its own when the job reaches a terminal status, when the sink
/// asks it to, or after too many consecutive failures.
pub struct PollTransport {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: watch::Receiver<ConnectionState>,
}

impl PollTransport {
    pub fn start<K: EventSink>(
        job_id: JobId,
        config: PollConfig,
        source: Arc<dyn StatusSource>,
        sink: K,
    ) -> Self {
        Self::spawn(
            job_id,
            config,
            source,
            Arc::new(SequenceClock::new()),
            sink,
            CancellationToken::new(),
        )
    }

    pub(crate) fn spawn<K: EventSink>(
        job_id: JobId,
        config: PollConfig,
        source: Arc<dyn StatusSource>,
        clock: Arc<SequenceClock>,
        sink: K,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let task = tokio::spawn(run_poll(PollLoop {
            job_id,
            config,
            source,
            clock,
            sink,
            cancel: cancel.clone(),
            state: state_tx,
        }));
        Self {
            cancel,
            task,
            state,
        }
    }

    /// Stop polling. Any request still in flight is dropped unanswered.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for PollTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PollLoop<K> {
    job_id: JobId,
    config: PollConfig,
    source: Arc<dyn StatusSource>,
    clock: Arc<SequenceClock>,
    sink: K,
    cancel: CancellationToken,
    state: watch::Sender<ConnectionState>,
}

async fn run_poll<K: EventSink>(ctx: PollLoop<K>) {
    let job_id = &ctx.job_id;
    let mut ticker = tokio::time::interval(ctx.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            r = tokio::time::timeout(ctx.config.request_timeout, ctx.source.fetch_status(job_id)) => {
                r.unwrap_or(Err(TrackError::Timeout(ctx.config.request_timeout)))
            }
        };
        let skipped = skipped_ticks(started.elapsed(), ctx.config.interval);
        if skipped > 0 {
            debug!(job_id = %job_id, skipped, "poll ticks skipped while request was in flight");
        }

        match outcome {
            Ok(body) => {
                failures = 0;
                ctx.state.send_replace(ConnectionState::Connected);
                let update = match normalize::from_status_body(job_id, body, ctx.config.progress_scale, &ctx.clock) {
                    Ok(update) => update,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "dropping malformed status response");
                        continue;
                    }
                };
                let terminal = update.status.is_terminal();
                if ctx.sink.emit(TransportEvent::Update(update)).is_break() || terminal {
                    debug!(job_id = %job_id, terminal, "polling finished");
                    break;
                }
            }
            Err(e @ TrackError::Protocol(_)) => {
                warn!(job_id = %job_id, error = %e, "dropping malformed status response");
            }
            Err(e) if e.is_transient() => {
                failures += 1;
                if failures > ctx.config.max_consecutive_failures {
                    error!(job_id = %job_id, failures, error = %e, "status polling gave up");
                    let _ = ctx.sink.emit(TransportEvent::Fatal(e));
                    break;
                }
                warn!(job_id = %job_id, failures, error = %e, "status poll failed, retrying next tick");
                ctx.state.send_replace(ConnectionState::BackoffWaiting);
                if ctx.sink.emit(TransportEvent::Interrupted(e)).is_break() {
                    break;
                }
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "status source failed permanently");
                let _ = ctx.sink.emit(TransportEvent::Fatal(e));
                break;
            }
        }
    }

    ctx.state.send_replace(ConnectionState::Disconnected);
}

fn skipped_ticks(elapsed: Duration, interval: Duration) -> u128 {
    if interval.is_zero() {
        return 0;
    }
    elapsed.as_nanos() / interval.as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body, ScriptedSource, Step};
    use jobwatch_types::RemoteStatus;
    use tokio::sync::mpsc;

    fn config(max_failures: u32) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(100),
            max_consecutive_failures: max_failures,
            request_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_terminal_status() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Reply(body("running", 0.3)),
            Step::Reply(body("running", 0.6)),
            Step::Reply(body("completed", 1.0)),
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poll = PollTransport::start("job-1".into(), config(3), source.clone(), tx);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(poll.is_stopped());
        assert_eq!(source.calls(), 3);
        assert_eq!(poll.connection_state(), ConnectionState::Disconnected);

        drop(poll);
        let events = drain(&mut rx).await;
        let progress: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Update(u) => Some(u.progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0.3, 0.6, 1.0]);
        assert!(matches!(
            events.last(),
            Some(TransportEvent::Update(u)) if u.status == RemoteStatus::Completed
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_requests_never_overlap() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Slow(
            Duration::from_millis(450),
            body("running", 0.1),
        )]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let poll = PollTransport::start("job-1".into(), config(3), source.clone(), tx);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        poll.stop();

        assert_eq!(source.max_in_flight(), 1);
        // 2s of 450ms requests: ticks that fell due mid-request were skipped.
        assert!(source.calls() <= 5, "calls = {}", source.calls());
        assert!(source.calls() >= 3, "calls = {}", source.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Fail(TrackError::Transport("connection reset".into())),
            Step::Fail(TrackError::Timeout(Duration::from_secs(1))),
            Step::Reply(body("completed", 1.0)),
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poll = PollTransport::start("job-1".into(), config(3), source, tx);

        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(poll);
        let events = drain(&mut rx).await;
        assert!(matches!(events[0], TransportEvent::Interrupted(TrackError::Transport(_))));
        assert!(matches!(events[1], TransportEvent::Interrupted(TrackError::Timeout(_))));
        assert!(matches!(&events[2], TransportEvent::Update(u) if u.status == RemoteStatus::Completed));
        assert_eq!(events.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_consecutive_failures() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Fail(TrackError::Transport(
            "503".into(),
        ))]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poll = PollTransport::start("job-1".into(), config(2), source.clone(), tx);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(poll.is_stopped());
        assert_eq!(source.calls(), 3);

        drop(poll);
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TransportEvent::Interrupted(_)));
        assert!(matches!(events[1], TransportEvent::Interrupted(_)));
        assert!(matches!(events[2], TransportEvent::Fatal(TrackError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_responses_are_dropped() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Reply(body("teleporting", 0.2)),
            Step::Fail(TrackError::Protocol("not json".into())),
            Step::Reply(body("completed", 1.0)),
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poll = PollTransport::start("job-1".into(), config(0), source, tx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(poll);
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TransportEvent::Update(u) if u.status == RemoteStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_counts_as_failure() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Slow(
            Duration::from_secs(30),
            body("running", 0.5),
        )]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poll = PollTransport::start("job-1".into(), config(0), source, tx);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(poll.is_stopped());
        drop(poll);
        let events = drain(&mut rx).await;
        assert_eq!(
            events,
            vec![TransportEvent::Fatal(TrackError::Timeout(Duration::from_secs(1)))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_immediate() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Reply(body("running", 0.2))]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let poll = PollTransport::start("job-1".into(), config(3), source.clone(), tx);

        tokio::time::sleep(Duration::from_millis(250)).await;
        poll.stop();
        let calls = source.calls();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls(), calls);
    }
}
