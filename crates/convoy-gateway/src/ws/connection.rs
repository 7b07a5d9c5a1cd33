use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use convoy_core::config::{CLOSE_MISSING_PROJECT, CLOSE_SLOW_CONSUMER, OUTBOUND_QUEUE_CAPACITY};
use convoy_protocol::handshake::ConnectParams;
use convoy_protocol::OutboundMessage;
use futures_util::{stream::SplitSink, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::ws::heartbeat::{self, Beat};
use crate::ws::registry::ConnectionHandle;
use crate::ws::{dispatch, handshake, replay};

/// Axum handler: upgrades HTTP to WebSocket at
/// `GET /ws?projectId=..&conversationId=..&token=..`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, state, params))
}

/// Per-connection event loop. Owns the socket; everything else reaches the
/// client through the connection's outbound queue.
async fn run_connection(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let (mut sink, mut stream) = socket.split();

    let key = match handshake::admit(&params, &state.config) {
        Ok(key) => key,
        Err(rejection) => {
            warn!(code = rejection.code, error = %rejection.error, "rejecting connection");
            close(&mut sink, rejection.code, &rejection.error.to_string()).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    let session = state.sessions.create(&key);
    let handle = ConnectionHandle::new(key.clone(), session.session_id.clone(), tx);
    let conn = match replay::attach(&state, handle).await {
        Ok(conn) => conn,
        Err(e) => {
            state.sessions.remove(&session.session_id);
            warn!(conversation = %key, error = %e, "attach refused");
            close(&mut sink, CLOSE_MISSING_PROJECT, &e.to_string()).await;
            return;
        }
    };
    info!(
        conn_id = %conn.conn_id,
        conversation = %key,
        session = %conn.session_id,
        "connection attached"
    );

    pump(&state, &conn, &mut sink, &mut stream, &mut rx).await;
    disconnect(&state, &conn);
    if conn.is_evicted() {
        close(&mut sink, CLOSE_SLOW_CONSUMER, "outbound queue overflow").await;
    } else {
        let _ = sink.close().await;
    }
}

/// Moves traffic between the socket halves and the outbound queue until the
/// client leaves, goes silent past a heartbeat, or is evicted.
async fn pump<S, R>(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionHandle>,
    sink: &mut S,
    stream: &mut R,
    rx: &mut mpsc::Receiver<String>,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut tick = heartbeat::ticker(state.config.heartbeat.interval_secs);

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat::mark_alive(&conn.alive);
                        dispatch::handle(state, conn, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        heartbeat::mark_alive(&conn.alive);
                        conn.send(OutboundMessage::error(
                            "INVALID_MESSAGE",
                            "binary frames are not supported",
                            true,
                        ));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        heartbeat::mark_alive(&conn.alive);
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => heartbeat::mark_alive(&conn.alive),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id = %conn.conn_id, error = %e, "socket read failed");
                        break;
                    }
                }
            }

            outbound = rx.recv() => {
                let Some(json) = outbound else { break };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            _ = conn.evicted() => {
                debug!(conn_id = %conn.conn_id, "evicted, closing");
                break;
            }

            _ = tick.tick() => {
                match heartbeat::on_tick(&conn.alive) {
                    Beat::Probe => {
                        if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                    }
                    Beat::Terminate => {
                        warn!(conn_id = %conn.conn_id, "no traffic since last probe, terminating");
                        break;
                    }
                }
            }
        }
    }
}

/// The one cleanup path for every way a connection ends.
fn disconnect(state: &AppState, conn: &ConnectionHandle) {
    // An evicted connection has already left the registry.
    let unregistered = state.registry.unregister(&conn.conn_id).is_some();
    let ended = state.sessions.remove(&conn.session_id).is_some();
    if unregistered || ended {
        info!(
            conn_id = %conn.conn_id,
            conversation = %conn.key,
            messages = conn.message_count(),
            evicted = conn.is_evicted(),
            "connection closed"
        );
    }
}

async fn close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
