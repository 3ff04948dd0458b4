use std::{borrow::Cow, sync::Arc, time::Duration};

use axum::{
    Json,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    auth::{AuthContext, request_token},
    messages::InboundMessage,
    pipeline::CommandRejection,
    security::{json_error, origin_is_allowed},
    sessions::{SessionConnection, SessionId},
    state::AppState,
};

const OUTBOUND_QUEUE: usize = 256;
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const DEFAULT_HISTORY_LIMIT: usize = 200;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleQuery {
    pub token: Option<String>,
}

/// Registry handle for one console socket. Frames go through the writer
/// task's queue, so closing never blocks.
struct WsConnection {
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl SessionConnection for WsConnection {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.cancel();
        self.tx
            .try_send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::from("session expired"),
            })))
            .map_err(|e| anyhow::anyhow!("failed to queue close frame: {e}"))
    }
}

pub async fn console_ws(
    State(state): State<AppState>,
    Query(query): Query<ConsoleQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_is_allowed(&headers, &state.allowed_origins) {
        return json_error(StatusCode::FORBIDDEN, "origin not allowed");
    }

    let jar = CookieJar::from_headers(&headers);
    let Some(token) = request_token(&headers, &jar, query.token.as_deref()) else {
        return json_error(StatusCode::UNAUTHORIZED, "missing access token");
    };
    let auth = match state.tokens.authenticate(&token) {
        Ok(auth) => auth,
        Err(e) => {
            tracing::debug!(error = %e, "rejected console token");
            return json_error(StatusCode::UNAUTHORIZED, "invalid access token");
        }
    };

    ws.on_upgrade(move |socket| handle_console_socket(state, auth, socket))
        .into_response()
}

async fn send_json<T: Serialize>(tx: &mpsc::Sender<Message>, value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    tx.send(Message::Text(text))
        .await
        .map_err(|_| anyhow::anyhow!("console writer is gone"))
}

async fn handle_console_socket(state: AppState, auth: AuthContext, socket: WebSocket) {
    let id = SessionId::new();
    let span = tracing::info_span!("console_ws", session_id = %id, principal = %auth.principal());
    async move {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let closed = CancellationToken::new();
        let conn = Arc::new(WsConnection {
            tx: tx.clone(),
            closed: closed.clone(),
        });

        let mut writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let last = matches!(msg, Message::Close(_));
                if sender.send(msg).await.is_err() || last {
                    break;
                }
            }
        });

        // Subscribe before taking the history snapshot: a line racing the
        // connect may arrive twice but is never lost.
        let mut feed = state.console.subscribe();
        state.sessions.add_session(id.clone(), conn.clone(), auth.clone());
        tracing::info!("console session opened");

        let mut binding = Some(auth);
        if send_json(&tx, &state.console.history_reply()).await.is_err() {
            closed.cancel();
        }

        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                recv = feed.recv() => match recv {
                    Ok(msg) => {
                        if !state.pipeline.revalidate(&mut binding) {
                            break;
                        }
                        if send_json(&tx, &msg).await.is_err() {
                            closed.cancel();
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "console session lagged; lines dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                inbound = receiver.next() => {
                    let Some(Ok(msg)) = inbound else {
                        closed.cancel();
                        break;
                    };
                    match msg {
                        Message::Text(text) => {
                            if !state.pipeline.revalidate(&mut binding) {
                                break;
                            }
                            let Some(auth) = binding.as_ref() else { break };
                            let handled = match serde_json::from_str::<InboundMessage>(&text) {
                                Ok(msg) => state.pipeline.handle_inbound(auth, msg).await,
                                Err(_) => Err(CommandRejection::Validation),
                            };
                            if let Err(rejection) = handled
                                && send_json(&tx, &rejection.to_reply()).await.is_err()
                            {
                                closed.cancel();
                                break;
                            }
                        }
                        Message::Close(_) => {
                            closed.cancel();
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        // Closes with a policy frame unless the peer already went away.
        state.sessions.remove_session(&id);
        drop(conn);
        drop(tx);
        if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        tracing::info!(revoked = binding.is_none(), "console session closed");
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub cursor: u64,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryPage {
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

/// Pages through retained console output. `cursor=0` returns the newest lines.
pub async fn console_history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> Json<HistoryPage> {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let (lines, next_cursor) = state.console.history().tail_after(q.cursor, limit);
    Json(HistoryPage { lines, next_cursor })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_queues_policy_frame_once_open() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = WsConnection {
            tx,
            closed: CancellationToken::new(),
        };
        assert!(conn.is_open());

        conn.close().unwrap();
        assert!(!conn.is_open());
        match rx.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::POLICY),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn close_reports_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Message::Text("pending".to_string())).unwrap();
        let conn = WsConnection {
            tx,
            closed: CancellationToken::new(),
        };
        assert!(conn.close().is_err());
        assert!(!conn.is_open());
    }

    #[test]
    fn dropped_writer_reads_as_closed() {
        let (tx, rx) = mpsc::channel(1);
        let conn = WsConnection {
            tx,
            closed: CancellationToken::new(),
        };
        drop(rx);
        assert!(!conn.is_open());
    }
}
