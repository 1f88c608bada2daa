use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use jobwatch_types::{ClientAction, StreamMessage};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::{DevState, Feed};

/// Close code for a job id the server has never seen.
pub const CLOSE_UNKNOWN_JOB: u16 = 4404;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(job_id): Path<String>,
    State(state): State<DevState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, job_id, state))
}

/// Push frames carry progress in percent; records hold a fraction.
fn text(msg: &StreamMessage) -> Option<Message> {
    let mut wire = msg.clone();
    wire.body.progress = wire.body.progress.map(|p| p * 100.0);
    serde_json::to_string(&wire).ok().map(|s| Message::Text(s.into()))
}

async fn handle_socket(socket: WebSocket, job_id: String, state: DevState) {
    let (mut sink, mut stream) = socket.split();

    let Some((mut feed, record)) = state.attach(&job_id) else {
        warn!(job_id = %job_id, "stream requested for unknown job");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNKNOWN_JOB,
                reason: "unknown job".into(),
            })))
            .await;
        return;
    };

    info!(job_id = %job_id, "stream attached");
    if let Some(initial) = text(&record.frame()) {
        if sink.send(initial).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = feed.recv() => match event {
                Ok(Feed::Message(msg)) => {
                    let Some(frame) = text(&msg) else { continue };
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(Feed::Drop { code, reason }) => {
                    info!(job_id = %job_id, code, "dropping stream on request");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(job_id = %job_id, skipped = n, "stream lagged, resending current state");
                    let Some(frame) = state.record(&job_id).and_then(|r| text(&r.frame())) else {
                        continue;
                    };
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(body))) => {
                    if let Ok(ClientAction::Ping) = serde_json::from_str::<ClientAction>(&body) {
                        let Some(pong) = text(&StreamMessage::pong()) else { continue };
                        if sink.send(pong).await.is_err() {
                            break;
                        }
                    } else {
                        debug!(job_id = %job_id, "ignoring client frame");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(job_id = %job_id, code = frame.map(|f| f.code), "client closed stream");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }

    info!(job_id = %job_id, "stream detached");
}
