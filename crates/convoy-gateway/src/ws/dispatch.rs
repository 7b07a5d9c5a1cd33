//! Routes one validated inbound message. Protocol errors go back to the
//! sending connection only and never close it.

use std::sync::Arc;

use convoy_core::config::MAX_PAYLOAD_BYTES;
use convoy_core::ConvoyError;
use convoy_history::types::tokens_since_summary;
use convoy_protocol::{
    ControlCommand, ControlResponse, InboundFrame, InboundMessage, OutboundMessage, UserMessage,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::ws::generation;
use crate::ws::registry::ConnectionHandle;

pub async fn handle(app: &Arc<AppState>, conn: &Arc<ConnectionHandle>, text: &str) {
    conn.touch();
    app.sessions.touch(&conn.session_id);

    if text.len() > MAX_PAYLOAD_BYTES {
        let err = ConvoyError::PayloadTooLarge {
            size: text.len(),
            max: MAX_PAYLOAD_BYTES,
        };
        warn!(conn_id = %conn.conn_id, size = text.len(), "payload too large");
        send_error(conn, &err);
        return;
    }

    let (frame, message) = match InboundFrame::parse(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(conn_id = %conn.conn_id, error = %e, "rejected inbound frame");
            conn.send(OutboundMessage::error(e.code(), e.to_string(), true));
            return;
        }
    };

    match message {
        InboundMessage::Ping => {
            conn.reply(&frame.id, OutboundMessage::Pong);
        }
        InboundMessage::UserMessage(user) => user_message(app, conn, user),
        InboundMessage::Control(cmd) => control(app, conn, &frame.id, cmd).await,
    }
}

fn send_error(conn: &ConnectionHandle, err: &ConvoyError) {
    conn.send(OutboundMessage::error(
        err.code(),
        err.to_string(),
        err.recoverable(),
    ));
}

fn user_message(app: &Arc<AppState>, conn: &Arc<ConnectionHandle>, user: UserMessage) {
    if !user.file_ids.is_empty() {
        debug!(conn_id = %conn.conn_id, files = user.file_ids.len(), "file attachments ignored");
    }
    let busy = || ConvoyError::GenerationBusy {
        conversation: conn.key.to_string(),
    };
    if app.generations.is_closed() {
        send_error(conn, &ConvoyError::Internal("server is shutting down".into()));
        return;
    }
    if app.streams.is_active(&conn.key) {
        send_error(conn, &busy());
        return;
    }
    match generation::start(app, &conn.key, user.text) {
        Some((generation_id, _)) => {
            debug!(conn_id = %conn.conn_id, generation = %generation_id, "user message accepted")
        }
        None => send_error(conn, &busy()),
    }
}

async fn control(
    app: &Arc<AppState>,
    conn: &Arc<ConnectionHandle>,
    reply_to: &str,
    cmd: ControlCommand,
) {
    let key = &conn.key;
    let busy = || {
        let err = ConvoyError::GenerationBusy {
            conversation: key.to_string(),
        };
        ControlResponse::failed(cmd, json!({ "code": err.code(), "reason": err.to_string() }))
    };

    let response = match cmd {
        ControlCommand::Abort => {
            let aborted = app.streams.abort(key);
            info!(conversation = %key, aborted, "abort requested");
            ControlResponse::ok(cmd, json!({ "aborted": aborted }))
        }
        ControlCommand::ClearHistory if app.streams.is_active(key) => busy(),
        ControlCommand::ClearHistory => match app.history.clear(key, true).await {
            Ok(()) => ControlResponse::ok(cmd, json!({ "cleared": true })),
            Err(e) => ControlResponse::failed(cmd, json!({ "reason": e.to_string() })),
        },
        ControlCommand::GetHistory => match app.history.get(key).await {
            Ok(messages) => {
                let visible: Vec<_> = messages.into_iter().filter(|m| !m.is_system()).collect();
                ControlResponse::ok(
                    cmd,
                    json!({
                        "messages": visible,
                        "isGenerating": app.streams.is_active(key),
                    }),
                )
            }
            Err(e) => ControlResponse::failed(cmd, json!({ "reason": e.to_string() })),
        },
        ControlCommand::GetStatus => ControlResponse::ok(
            cmd,
            json!({
                "isGenerating": app.streams.is_active(key),
                "connections": app.registry.connections_for(key).len(),
                "sessionId": conn.session_id.as_str(),
                "messageCount": conn.message_count(),
            }),
        ),
        ControlCommand::CompactChat if app.streams.is_active(key) => busy(),
        ControlCommand::CompactChat => {
            // Summarization can take a while; answer from a task so the
            // socket keeps reading.
            let app = Arc::clone(app);
            let conn = Arc::clone(conn);
            let reply_to = reply_to.to_string();
            tokio::spawn(async move {
                let response = match generation::compact_conversation(&app, &conn.key).await {
                    Ok(result) => ControlResponse::ok(cmd, result),
                    Err(e) => {
                        let err = ConvoyError::Compaction(e.to_string());
                        warn!(conversation = %conn.key, error = %err, "manual compaction failed");
                        ControlResponse::failed(
                            cmd,
                            json!({ "code": err.code(), "reason": err.to_string() }),
                        )
                    }
                };
                conn.reply(&reply_to, OutboundMessage::ControlResponse(response));
            });
            return;
        }
        ControlCommand::GetCompactionStatus => {
            let status = app.compaction.status(key);
            let cumulative = match app.history.get(key).await {
                Ok(messages) => tokens_since_summary(&messages),
                Err(e) => {
                    warn!(conversation = %key, error = %e, "history unavailable for status");
                    0
                }
            };
            ControlResponse::ok(
                cmd,
                json!({
                    "inProgress": status.in_progress,
                    "lastResult": status.last_result,
                    "cumulativeTokens": cumulative,
                    "thresholdTokens": app.compaction.config().threshold_tokens,
                }),
            )
        }
    };

    conn.reply(reply_to, OutboundMessage::ControlResponse(response));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use convoy_core::ConversationKey;
    use convoy_history::{HistoryMessage, Role};
    use serde_json::Value;
    use tokio::sync::{mpsc, Notify};

    use crate::test_support::{connect, drain, test_state, wait_until, ScriptedEngine};

    fn key() -> ConversationKey {
        ConversationKey::new("p1", "c1")
    }

    fn control_frame(id: &str, command: &str) -> String {
        json!({ "type": "control", "id": id, "data": { "type": command } }).to_string()
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let json = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no frame in time")
            .expect("queue closed");
        serde_json::from_str(&json).unwrap()
    }

    #[tokio::test]
    async fn malformed_frame_errors_the_sender_only() {
        let app = test_state(ScriptedEngine::new(vec![]));
        let (a, mut rx_a) = connect(&app, &key()).await;
        let (_b, mut rx_b) = connect(&app, &key()).await;

        handle(&app, &a, "{not json").await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["data"]["code"], "INVALID_MESSAGE");
        assert_eq!(frames[0]["data"]["recoverable"], true);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(app.registry.len(), 2);
    }

    #[tokio::test]
    async fn unknown_control_and_oversized_frames_are_reported() {
        let app = test_state(ScriptedEngine::new(vec![]));
        let (a, mut rx) = connect(&app, &key()).await;

        handle(&app, &a, &control_frame("c1", "reboot")).await;
        handle(&app, &a, &"x".repeat(MAX_PAYLOAD_BYTES + 1)).await;

        let frames = drain(&mut rx);
        assert_eq!(frames[0]["data"]["code"], "UNKNOWN_CONTROL");
        assert_eq!(frames[1]["data"]["code"], "PAYLOAD_TOO_LARGE");
        assert_eq!(frames[1]["data"]["recoverable"], true);
    }

    #[tokio::test]
    async fn ping_is_answered_with_the_same_id() {
        let app = test_state(ScriptedEngine::new(vec![]));
        let (a, mut rx) = connect(&app, &key()).await;

        handle(&app, &a, r#"{"type":"ping","id":"p-7"}"#).await;

        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "pong");
        assert_eq!(frames[0]["id"], "p-7");
    }

    #[tokio::test]
    async fn second_user_message_while_generating_is_ignored() {
        let gate = Arc::new(Notify::new());
        let engine = ScriptedEngine::gated(vec!["one"], 1, Arc::clone(&gate));
        let app = test_state(engine.clone());
        let (a, mut rx_a) = connect(&app, &key()).await;
        let (b, _rx_b) = connect(&app, &key()).await;

        handle(&app, &a, r#"{"type":"user_message","id":"m1","data":{"text":"first"}}"#).await;
        wait_until(|| app.streams.is_active(&key())).await;
        handle(&app, &b, r#"{"type":"user_message","id":"m2","data":{"text":"second"}}"#).await;

        gate.notify_one();
        wait_until(|| !app.streams.is_active(&key())).await;

        assert_eq!(engine.calls(), 1);
        let history = app.history.get(&key()).await.unwrap();
        let users: Vec<_> = history.iter().filter(|m| m.role == Role::User).collect();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].content, "first");
        assert_eq!(history.last().unwrap().content, "one");

        let chunks = drain(&mut rx_a)
            .into_iter()
            .filter(|f| f["type"] == "llm_chunk")
            .count();
        assert_eq!(chunks, 1);
    }

    #[tokio::test]
    async fn busy_sender_is_told_why() {
        let gate = Arc::new(Notify::new());
        let app = test_state(ScriptedEngine::gated(vec!["x"], 0, Arc::clone(&gate)));
        let (a, mut rx) = connect(&app, &key()).await;

        handle(&app, &a, r#"{"type":"user_message","id":"m1","data":{"text":"first"}}"#).await;
        wait_until(|| app.streams.is_active(&key())).await;
        drain(&mut rx);
        handle(&app, &a, r#"{"type":"user_message","id":"m2","data":{"text":"again"}}"#).await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"]["code"], "GENERATION_BUSY");
        gate.notify_one();
    }

    #[tokio::test]
    async fn get_history_hides_system_messages() {
        let app = test_state(ScriptedEngine::new(vec![]));
        app.history.set(
            &key(),
            vec![
                HistoryMessage::system("be brief"),
                HistoryMessage::user("hi"),
                HistoryMessage::assistant_completed("g1", "hello", 1, None, None),
            ],
        );
        let (a, mut rx) = connect(&app, &key()).await;

        handle(&app, &a, &control_frame("h1", "get_history")).await;

        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "control_response");
        assert_eq!(frames[0]["id"], "h1");
        let result = &frames[0]["data"]["result"];
        let messages = result["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m["role"] != "system"));
        assert_eq!(result["isGenerating"], false);
    }

    #[tokio::test]
    async fn clear_history_keeps_the_system_message() {
        let app = test_state(ScriptedEngine::new(vec![]));
        app.history.set(
            &key(),
            vec![HistoryMessage::system("be brief"), HistoryMessage::user("hi")],
        );
        let (a, mut rx) = connect(&app, &key()).await;

        handle(&app, &a, &control_frame("x", "clear_history")).await;

        assert_eq!(drain(&mut rx)[0]["data"]["success"], true);
        let history = app.history.get(&key()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_system());
    }

    #[tokio::test]
    async fn abort_control_stops_the_generation() {
        let gate = Arc::new(Notify::new());
        let app = test_state(ScriptedEngine::gated(vec!["x"], 0, gate));
        let (a, mut rx) = connect(&app, &key()).await;

        handle(&app, &a, &control_frame("a0", "abort")).await;
        handle(&app, &a, r#"{"type":"user_message","id":"m1","data":{"text":"go"}}"#).await;
        wait_until(|| app.streams.is_active(&key())).await;
        handle(&app, &a, &control_frame("a1", "abort")).await;
        wait_until(|| !app.streams.is_active(&key())).await;

        let frames = drain(&mut rx);
        let responses: Vec<_> = frames
            .iter()
            .filter(|f| f["type"] == "control_response")
            .collect();
        assert_eq!(responses[0]["data"]["result"]["aborted"], false);
        assert_eq!(responses[1]["data"]["result"]["aborted"], true);
        assert!(frames.iter().all(|f| f["type"] != "error"));
    }

    #[tokio::test]
    async fn status_reports_connection_counts() {
        let app = test_state(ScriptedEngine::new(vec![]));
        let (a, mut rx) = connect(&app, &key()).await;
        let (_b, _rx_b) = connect(&app, &key()).await;

        handle(&app, &a, &control_frame("s", "get_status")).await;

        let result = drain(&mut rx)[0]["data"]["result"].clone();
        assert_eq!(result["isGenerating"], false);
        assert_eq!(result["connections"], 2);
        assert_eq!(result["sessionId"], a.session_id.as_str());
        assert_eq!(result["messageCount"], 1);
    }

    #[tokio::test]
    async fn compaction_status_and_manual_trigger() {
        let app = test_state(ScriptedEngine::new(vec![]));
        let (a, mut rx) = connect(&app, &key()).await;

        handle(&app, &a, &control_frame("cs", "get_compaction_status")).await;
        let status = next_frame(&mut rx).await;
        let result = &status["data"]["result"];
        assert_eq!(result["inProgress"], false);
        assert_eq!(result["cumulativeTokens"], 0);
        assert_eq!(result["thresholdTokens"], 150_000);

        handle(&app, &a, &control_frame("cc", "compact_chat")).await;
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply["id"], "cc");
        assert_eq!(reply["data"]["success"], true);
        assert_eq!(reply["data"]["result"]["compacted"], false);
    }
}
