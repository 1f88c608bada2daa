//! Per-job lifecycle: transports in, reducer in the middle, subscribers out.

use std::borrow::Cow;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use jobwatch_types::{ConnectionState, JobId, JobSnapshot, ProgressUpdate};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::{Result, TrackError};
use crate::normalize::{self, SequenceClock};
use crate::reducer::{reduce, JobEvent};
use crate::transport::{
    EventSink, HttpStatusSource, PollTransport, StatusSource, StreamTransport, TransportEvent,
    TransportKind,
};

/// Which transports a handle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOptions {
    pub use_stream: bool,
    pub use_poll: bool,
}

impl TrackOptions {
    /// Push channel with polling fallback.
    pub fn hybrid() -> Self {
        Self {
            use_stream: true,
            use_poll: true,
        }
    }

    pub fn poll_only() -> Self {
        Self {
            use_stream: false,
            use_poll: true,
        }
    }

    pub fn stream_only() -> Self {
        Self {
            use_stream: true,
            use_poll: false,
        }
    }
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self::hybrid()
    }
}

/// Starts [`JobHandle`]s against one backend.
pub struct JobWatcher {
    config: WatchConfig,
    source: Arc<dyn StatusSource>,
}

impl JobWatcher {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let source = HttpStatusSource::new(config.clone())?;
        Ok(Self {
            config,
            source: Arc::new(source),
        })
    }

    /// Use a custom status source for polling (tests, non-HTTP backends).
    pub fn with_source(config: WatchConfig, source: Arc<dyn StatusSource>) -> Result<Self> {
        config.validate()?;
        crate::install_crypto_provider();
        Ok(Self { config, source })
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// One status request, normalised, outside of any handle.
    pub async fn fetch_once(&self, job_id: &JobId) -> Result<ProgressUpdate> {
        let body = self.source.fetch_status(job_id).await?;
        normalize::from_status_body(
            job_id,
            body,
            self.config.poll.progress_scale,
            &SequenceClock::new(),
        )
    }

    /// Begin tracking `job_id`. Must be called inside a tokio runtime.
    ///
    /// One handle per job id is expected; two handles for the same id are
    /// independent trackers.
    pub fn start(&self, job_id: impl Into<JobId>, options: TrackOptions) -> Result<JobHandle> {
        if !options.use_stream && !options.use_poll {
            return Err(TrackError::Config(
                "at least one of stream or poll must be enabled".into(),
            ));
        }
        let job_id = job_id.into();
        let stream_url = if options.use_stream {
            Some(self.config.stream_url(&job_id)?)
        } else {
            None
        };

        let core = Core::new(job_id.clone());
        let clock = Arc::new(SequenceClock::new());
        let generation = {
            let mut inner = core.lock();
            if options.use_poll {
                inner.live.insert(TransportKind::Poll);
            }
            if options.use_stream {
                inner.live.insert(TransportKind::Stream);
            }
            let _ = core.commit_event(&mut inner, &JobEvent::Started);
            inner.generation
        };

        let stream = stream_url.map(|url| {
            StreamTransport::spawn(
                job_id.clone(),
                url,
                self.config.stream,
                self.config.reconnect,
                clock.clone(),
                core.link(generation, TransportKind::Stream),
                core.shutdown.child_token(),
            )
        });
        let poll = options.use_poll.then(|| {
            PollTransport::spawn(
                job_id.clone(),
                self.config.poll,
                self.source.clone(),
                clock.clone(),
                core.link(generation, TransportKind::Poll),
                core.shutdown.child_token(),
            )
        });

        info!(
            job_id = %job_id,
            stream = options.use_stream,
            poll = options.use_poll,
            "tracking job"
        );
        Ok(JobHandle { core, poll, stream })
    }
}

struct Inner {
    /// Bumped by cancel; events from older generations are ignored.
    generation: u64,
    snapshot: JobSnapshot,
    subscribers: Vec<(u64, mpsc::UnboundedSender<JobSnapshot>)>,
    next_subscriber_id: u64,
    /// Transports that have not given up.
    live: HashSet<TransportKind>,
    /// Transports currently delivering.
    healthy: HashSet<TransportKind>,
}

struct Core {
    job_id: JobId,
    inner: Mutex<Inner>,
    latest: watch::Sender<JobSnapshot>,
    shutdown: CancellationToken,
}

impl Core {
    fn new(job_id: JobId) -> Arc<Self> {
        let snapshot = JobSnapshot::pending(job_id.clone());
        let (latest, _) = watch::channel(snapshot.clone());
        Arc::new(Self {
            job_id,
            inner: Mutex::new(Inner {
                generation: 0,
                snapshot,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                live: HashSet::new(),
                healthy: HashSet::new(),
            }),
            latest,
            shutdown: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn link(self: &Arc<Self>, generation: u64, kind: TransportKind) -> Link {
        Link {
            core: self.clone(),
            generation,
            kind,
        }
    }

    /// The single serialization point for everything the transports report.
    fn ingest(&self, generation: u64, kind: TransportKind, event: TransportEvent) -> ControlFlow<()> {
        let mut inner = self.lock();
        if inner.generation != generation || inner.snapshot.is_terminal() {
            debug!(job_id = %self.job_id, transport = %kind, "ignoring event for finished handle");
            return ControlFlow::Break(());
        }

        match &event {
            TransportEvent::Fatal(e) => {
                inner.live.remove(&kind);
                inner.healthy.remove(&kind);
                if !inner.live.is_empty() {
                    warn!(job_id = %self.job_id, transport = %kind, error = %e, "transport gave up, continuing on the other one");
                    return ControlFlow::Break(());
                }
            }
            TransportEvent::Interrupted(e) => {
                inner.healthy.remove(&kind);
                if !inner.healthy.is_empty() {
                    debug!(job_id = %self.job_id, transport = %kind, error = %e, "transport interrupted, other transport still delivering");
                    return ControlFlow::Continue(());
                }
            }
            TransportEvent::Connected | TransportEvent::Update(_) => {
                inner.healthy.insert(kind);
            }
        }

        self.commit_event(&mut inner, &JobEvent::Transport(event))
    }

    fn commit_event(&self, inner: &mut Inner, event: &JobEvent) -> ControlFlow<()> {
        let next = match reduce(&inner.snapshot, event) {
            Cow::Borrowed(_) => return ControlFlow::Continue(()),
            Cow::Owned(next) => next,
        };
        self.publish(inner, next)
    }

    fn publish(&self, inner: &mut Inner, next: JobSnapshot) -> ControlFlow<()> {
        debug!(
            job_id = %self.job_id,
            status = %next.status,
            progress = next.progress,
            "snapshot changed"
        );
        inner.snapshot = next;
        let snapshot = &inner.snapshot;
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(snapshot.clone()).is_ok());
        self.latest.send_replace(snapshot.clone());

        if inner.snapshot.is_terminal() {
            info!(job_id = %self.job_id, status = %inner.snapshot.status, "job finished");
            inner.subscribers.clear();
            self.shutdown.cancel();
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

/// A transport's way into the handle, tagged with the generation it was
/// started under.
struct Link {
    core: Arc<Core>,
    generation: u64,
    kind: TransportKind,
}

impl EventSink for Link {
    fn emit(&self, event: TransportEvent) -> ControlFlow<()> {
        self.core.ingest(self.generation, self.kind, event)
    }
}

/// Tracks one job until it finishes or is cancelled. Dropping it cancels.
pub struct JobHandle {
    core: Arc<Core>,
    poll: Option<PollTransport>,
    stream: Option<StreamTransport>,
}

impl JobHandle {
    pub fn job_id(&self) -> &JobId {
        &self.core.job_id
    }

    pub fn current(&self) -> JobSnapshot {
        self.core.lock().snapshot.clone()
    }

    /// Snapshots in application order, starting with the current one. The
    /// subscription ends after the terminal snapshot.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.core.lock();
        let _ = tx.send(inner.snapshot.clone());
        let id = if inner.snapshot.is_terminal() {
            None
        } else {
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push((id, tx));
            Some(id)
        };
        Subscription {
            id,
            core: Arc::downgrade(&self.core),
            rx,
        }
    }

    /// Run `callback` for every snapshot on a spawned task.
    #[must_use = "dropping the listener unsubscribes it"]
    pub fn subscribe_with<F>(&self, mut callback: F) -> Listener
    where
        F: FnMut(&JobSnapshot) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(snapshot) = subscription.next().await {
                callback(&snapshot);
            }
        });
        Listener { task }
    }

    /// Resolves with the terminal snapshot.
    pub async fn wait(&self) -> JobSnapshot {
        let mut rx = self.core.latest.subscribe();
        let done = match rx.wait_for(JobSnapshot::is_terminal).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.current(),
        };
        done
    }

    /// Best of the transports' connection states.
    pub fn connection_state(&self) -> ConnectionState {
        let states: Vec<ConnectionState> = self
            .stream
            .iter()
            .map(StreamTransport::connection_state)
            .chain(self.poll.iter().map(PollTransport::connection_state))
            .collect();
        [
            ConnectionState::Connected,
            ConnectionState::Connecting,
            ConnectionState::BackoffWaiting,
        ]
        .into_iter()
        .find(|s| states.contains(s))
        .unwrap_or(ConnectionState::Disconnected)
    }

    /// Stop tracking. Idempotent; a no-op once the job is terminal.
    ///
    /// When this returns no transport can change the snapshot any more: the
    /// generation is bumped under the same lock every event goes through.
    pub fn cancel(&self) {
        {
            let mut inner = self.core.lock();
            if !inner.snapshot.is_terminal() {
                inner.generation += 1;
                let _ = self.core.commit_event(&mut inner, &JobEvent::Cancelled);
                info!(job_id = %self.core.job_id, "tracking cancelled");
            }
        }
        self.core.shutdown.cancel();
        if let Some(poll) = &self.poll {
            poll.stop();
        }
        if let Some(stream) = &self.stream {
            stream.disconnect();
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Stream of snapshots from one [`JobHandle`].
pub struct Subscription {
    id: Option<u64>,
    core: Weak<Core>,
    rx: mpsc::UnboundedReceiver<JobSnapshot>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<JobSnapshot> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<JobSnapshot> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let (Some(id), Some(core)) = (self.id, self.core.upgrade()) {
            core.lock().subscribers.retain(|(sub, _)| *sub != id);
        }
    }
}

/// Callback subscription from [`JobHandle::subscribe_with`].
pub struct Listener {
    task: JoinHandle<()>,
}

impl Listener {
    pub fn unsubscribe(self) {}

    /// Whether the callback has seen the last snapshot it ever will.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollConfig;
    use crate::test_support::{body, ScriptedSource, Step};
    use jobwatch_types::{FailureKind, JobStatus};
    use std::time::Duration;

    fn watcher(source: Arc<ScriptedSource>, max_failures: u32) -> JobWatcher {
        let config = WatchConfig::new("http://jobs.test").with_poll(PollConfig {
            interval: Duration::from_millis(100),
            max_consecutive_failures: max_failures,
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        JobWatcher::with_source(config, source).unwrap()
    }

    async fn collect(mut sub: Subscription) -> Vec<JobSnapshot> {
        let mut seen = Vec::new();
        while let Some(snapshot) = sub.next().await {
            seen.push(snapshot);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_to_completion() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Reply(body("running", 0.3)),
            Step::Reply(body("running", 0.6)),
            Step::Reply(body("completed", 1.0)),
        ]));
        let handle = watcher(source.clone(), 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();
        let sub = handle.subscribe();

        let done = handle.wait().await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 1.0);

        let seen = collect(sub).await;
        let progress: Vec<(JobStatus, f64)> = seen.iter().map(|s| (s.status, s.progress)).collect();
        assert_eq!(
            progress,
            vec![
                (JobStatus::Connecting, 0.0),
                (JobStatus::Running, 0.3),
                (JobStatus::Running, 0.6),
                (JobStatus::Completed, 1.0),
            ]
        );

        let calls = source.calls();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls(), calls);
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ignores_late_response() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Reply(body("running", 0.5)),
            Step::Slow(Duration::from_secs(1), body("running", 0.8)),
        ]));
        let handle = watcher(source.clone(), 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.current().status, JobStatus::Running);
        assert_eq!(handle.current().progress, 0.5);
        assert_eq!(source.calls(), 2, "second request should be in flight");

        let mut sub = handle.subscribe();
        assert_eq!(sub.next().await.map(|s| s.status), Some(JobStatus::Running));

        handle.cancel();
        assert_eq!(handle.current().status, JobStatus::Cancelled);
        assert_eq!(handle.current().progress, 0.5);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sub.next().await.map(|s| s.status), Some(JobStatus::Cancelled));
        assert_eq!(sub.next().await, None);
        assert_eq!(handle.current().progress, 0.5);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_noop_after_terminal() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Reply(body("completed", 1.0))]));
        let handle = watcher(source, 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();
        handle.wait().await;

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.current().status, JobStatus::Completed);

        let source = Arc::new(ScriptedSource::new(vec![Step::Reply(body("running", 0.1))]));
        let handle = watcher(source, 3)
            .start("job-2", TrackOptions::poll_only())
            .unwrap();
        handle.cancel();
        let first = handle.current();
        handle.cancel();
        assert_eq!(handle.current(), first);
        assert_eq!(first.status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_shows_reconnecting_then_recovers() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Reply(body("running", 0.2)),
            Step::Fail(TrackError::Transport("connection reset".into())),
            Step::Reply(body("running", 0.4)),
            Step::Reply(body("completed", 1.0)),
        ]));
        let handle = watcher(source, 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();
        let sub = handle.subscribe();
        handle.wait().await;

        let statuses: Vec<JobStatus> = collect(sub).await.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Connecting,
                JobStatus::Running,
                JobStatus::Reconnecting,
                JobStatus::Running,
                JobStatus::Completed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_poll_budget_fails_job() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Reply(body("running", 0.2)),
            Step::Fail(TrackError::Transport("503 Service Unavailable".into())),
        ]));
        let handle = watcher(source, 2)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();

        let done = handle.wait().await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.progress, 0.2);
        let failure = done.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Transport);
        assert!(failure.message.contains("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_failure_is_terminal() {
        let mut failed = body("failed", 0.4);
        failed.error = Some("LLM quota exceeded".into());
        let source = Arc::new(ScriptedSource::new(vec![Step::Reply(failed)]));
        let handle = watcher(source, 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();

        let done = handle.wait().await;
        assert_eq!(done.status, JobStatus::Failed);
        let failure = done.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Job);
        assert_eq!(failure.message, "LLM quota exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_gets_terminal_snapshot_once() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Reply(body("completed", 1.0))]));
        let handle = watcher(source, 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();
        handle.wait().await;

        let seen = collect(handle.subscribe()).await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_detaches() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Reply(body("running", 0.1))]));
        let handle = watcher(source, 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();
        let sub = handle.subscribe();
        let kept = handle.subscribe();
        assert_eq!(handle.core.lock().subscribers.len(), 2);

        sub.unsubscribe();
        assert_eq!(handle.core.lock().subscribers.len(), 1);
        drop(kept);
        assert!(handle.core.lock().subscribers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_with_callback() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Reply(body("running", 0.5)),
            Step::Reply(body("completed", 1.0)),
        ]));
        let handle = watcher(source, 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = handle.subscribe_with(move |s| sink.lock().unwrap().push(s.progress));
        handle.wait().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(listener.is_finished());
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.5, 1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_transports() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Reply(body("running", 0.1))]));
        let handle = watcher(source.clone(), 3)
            .start("job-1", TrackOptions::poll_only())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(handle);

        let calls = source.calls();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls(), calls);
    }

    #[test]
    fn test_no_transport_is_a_config_error() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let err = watcher(source, 3)
            .start(
                "job-1",
                TrackOptions {
                    use_stream: false,
                    use_poll: false,
                },
            )
            .err()
            .unwrap();
        assert!(matches!(err, TrackError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_once() {
        // Percent on a fraction endpoint; the counts give it away.
        let mut reply = body("generating", 40.0);
        reply.processed = Some(4);
        reply.total = Some(10);
        let source = Arc::new(ScriptedSource::new(vec![Step::Reply(reply)]));
        let update = watcher(source, 3).fetch_once(&"job-1".into()).await.unwrap();
        assert_eq!(update.progress, 0.4);
        assert_eq!(update.processed_count, 4);
        assert_eq!(update.status, jobwatch_types::RemoteStatus::Running);
    }
}
