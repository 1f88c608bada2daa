//! Push-channel transport: one WebSocket per job, reconnected with backoff.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use jobwatch_types::{ClientAction, ConnectionState, JobId, StreamMessage};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventSink, TransportEvent};
use crate::config::StreamConfig;
use crate::error::TrackError;
use crate::normalize::{self, SequenceClock};
use crate::reconnect::{Backoff, CloseKind, ReconnectPolicy};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Live push channel for one job.
///
/// Reconnects after abnormal drops per [`ReconnectPolicy`]; the budget resets
/// on every successful open. Server close codes in the 4000-4999 range are
/// application-level rejections and are never retried.
pub struct StreamTransport {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: watch::Receiver<ConnectionState>,
}

impl StreamTransport {
    pub fn connect<K: EventSink>(
        job_id: JobId,
        url: String,
        config: StreamConfig,
        policy: ReconnectPolicy,
        sink: K,
    ) -> Self {
        Self::spawn(
            job_id,
            url,
            config,
            policy,
            Arc::new(SequenceClock::new()),
            sink,
            CancellationToken::new(),
        )
    }

    pub(crate) fn spawn<K: EventSink>(
        job_id: JobId,
        url: String,
        config: StreamConfig,
        policy: ReconnectPolicy,
        clock: Arc<SequenceClock>,
        sink: K,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let task = tokio::spawn(run_stream(StreamLoop {
            job_id,
            url,
            config,
            policy,
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

    /// Close the socket with a normal close code. No reconnect follows.
    ///
    /// The task is left to send its close frame; it exits within a second.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct StreamLoop<K> {
    job_id: JobId,
    url: String,
    config: StreamConfig,
    policy: ReconnectPolicy,
    clock: Arc<SequenceClock>,
    sink: K,
    cancel: CancellationToken,
    state: watch::Sender<ConnectionState>,
}

/// How one socket session ended.
#[derive(Debug, PartialEq)]
enum SessionEnd {
    /// Cancelled, terminal job, or the sink stopped listening.
    Stopped,
    /// Server refused the job. Fatal.
    Rejected(TrackError),
    /// Network drop, idle timeout, unexpected close. Retried.
    Dropped(TrackError),
}

async fn run_stream<K: EventSink>(ctx: StreamLoop<K>) {
    let mut backoff = Backoff::new(ctx.policy);

    loop {
        match ctx.session(&mut backoff).await {
            SessionEnd::Stopped => break,
            SessionEnd::Rejected(e) => {
                error!(job_id = %ctx.job_id, error = %e, "push channel rejected");
                let _ = ctx.sink.emit(TransportEvent::Fatal(e));
                break;
            }
            SessionEnd::Dropped(e) => match backoff.on_close(CloseKind::Abnormal) {
                None => {
                    let attempts = backoff.attempt();
                    error!(job_id = %ctx.job_id, attempts, error = %e, "push channel gave up reconnecting");
                    let fatal = match e {
                        TrackError::Timeout(_) => e,
                        other => TrackError::Transport(format!(
                            "reconnect budget exhausted after {attempts} attempts: {other}"
                        )),
                    };
                    let _ = ctx.sink.emit(TransportEvent::Fatal(fatal));
                    break;
                }
                Some(delay) => {
                    warn!(
                        job_id = %ctx.job_id,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "push channel dropped, reconnecting"
                    );
                    ctx.state.send_replace(ConnectionState::BackoffWaiting);
                    if ctx.sink.emit(TransportEvent::Interrupted(e)).is_break() {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
        }
    }

    ctx.state.send_replace(ConnectionState::Disconnected);
}

impl<K: EventSink> StreamLoop<K> {
    async fn session(&self, backoff: &mut Backoff) -> SessionEnd {
        self.state.send_replace(ConnectionState::Connecting);
        debug!(job_id = %self.job_id, url = %self.url, "opening push channel");

        let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(self.url.as_str()));
        let ws = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return SessionEnd::Stopped,
            r = connect => match r {
                Err(_) => return SessionEnd::Dropped(TrackError::Timeout(self.config.connect_timeout)),
                Ok(Err(e)) => return connect_failure(e),
                Ok(Ok((ws, _response))) => ws,
            },
        };

        backoff.reset();
        self.state.send_replace(ConnectionState::Connected);
        info!(job_id = %self.job_id, "push channel open");

        let (mut sink, mut stream) = ws.split();
        if self.sink.emit(TransportEvent::Connected).is_break() {
            close_normally(&mut sink).await;
            return SessionEnd::Stopped;
        }

        let hb = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + hb, hb);
        let idle_timeout = self.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    close_normally(&mut sink).await;
                    return SessionEnd::Stopped;
                }
                _ = &mut idle => {
                    return SessionEnd::Dropped(TrackError::Timeout(idle_timeout));
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send(ping_message()).await {
                        return SessionEnd::Dropped(e.into());
                    }
                }
                msg = stream.next() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_text(&text).is_break() {
                                close_normally(&mut sink).await;
                                return SessionEnd::Stopped;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => return close_outcome(frame),
                        // Protocol-level ping/pong is answered by tungstenite.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return SessionEnd::Dropped(e.into()),
                        None => {
                            return SessionEnd::Dropped(TrackError::Transport(
                                "connection ended without a close frame".into(),
                            ))
                        }
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> ControlFlow<()> {
        let msg: StreamMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "dropping malformed frame");
                return ControlFlow::Continue(());
            }
        };
        match normalize::from_stream_message(&self.job_id, msg, self.config.progress_scale, &self.clock) {
            Ok(Some(update)) => {
                let terminal = update.status.is_terminal();
                if self.sink.emit(TransportEvent::Update(update)).is_break() {
                    return ControlFlow::Break(());
                }
                if terminal {
                    debug!(job_id = %self.job_id, "terminal frame received, closing push channel");
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            Ok(None) => ControlFlow::Continue(()),
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "dropping unusable frame");
                ControlFlow::Continue(())
            }
        }
    }
}

fn ping_message() -> Message {
    let text = serde_json::to_string(&ClientAction::Ping).unwrap_or_default();
    Message::Text(text.into())
}

async fn close_normally(sink: &mut WsSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client disconnect".to_string().into(),
    };
    let _ = tokio::time::timeout(CLOSE_GRACE, sink.send(Message::Close(Some(frame)))).await;
}

fn close_outcome(frame: Option<CloseFrame>) -> SessionEnd {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            if (4000..=4999).contains(&code) {
                SessionEnd::Rejected(TrackError::Rejected {
                    code,
                    reason: frame.reason.to_string(),
                })
            } else {
                SessionEnd::Dropped(TrackError::Transport(format!(
                    "server closed push channel (code {code}): {}",
                    frame.reason
                )))
            }
        }
        None => SessionEnd::Dropped(TrackError::Transport(
            "server closed push channel without a code".into(),
        )),
    }
}

/// Handshake refused with a client error means the job is unknown or
/// forbidden; anything else is worth another attempt.
fn connect_failure(e: tungstenite::Error) -> SessionEnd {
    if let tungstenite::Error::Http(response) = &e {
        let status = response.status();
        if status.is_client_error() && status.as_u16() != 408 && status.as_u16() != 429 {
            return SessionEnd::Rejected(TrackError::Rejected {
                code: status.as_u16(),
                reason: format!("handshake refused with {status}"),
            });
        }
    }
    SessionEnd::Dropped(e.into())
}
