use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Read an Anthropic SSE response body and forward decoded events.
/// Always ends with `Done` unless the transport fails or the receiver goes away.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut decoder = SseDecoder::default();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        for event in decoder.feed(text) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    let _ = tx.send(decoder.finish()).await;
}

/// Incremental decoder for the Anthropic messages event stream.
#[derive(Default)]
pub struct SseDecoder {
    line_buf: String,
    current_event: String,
    // "text", "thinking" or "tool_use", from content_block_start
    block_type: String,
    tool_id: String,
    tool_name: String,
    tool_input_json: String,
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: String,
}

impl SseDecoder {
    /// Push raw body text; returns the events completed by it.
    /// A trailing partial line is held until the next call.
    pub fn feed(&mut self, text: &str) -> Vec<StreamEvent> {
        self.line_buf.push_str(text);
        let mut events = Vec::new();

        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_sse_line(line) {
                Some(SseParsed::Event(ev)) => self.current_event = ev,
                Some(SseParsed::Data(data)) => {
                    if let Some(event) = self.on_data(&data) {
                        events.push(event);
                    }
                }
                None => {}
            }
        }
        events
    }

    /// The terminal `Done` event carrying accumulated usage.
    pub fn finish(self) -> StreamEvent {
        StreamEvent::Done {
            model: self.model,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            stop_reason: self.stop_reason,
        }
    }

    fn on_data(&mut self, data: &str) -> Option<StreamEvent> {
        match self.current_event.as_str() {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                    self.model = msg.message.model;
                    self.tokens_in = msg.message.usage.input_tokens;
                }
                None
            }

            "content_block_start" => {
                if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                    if start.content_block.block_type == "tool_use" {
                        self.tool_id = start.content_block.id.unwrap_or_default();
                        self.tool_name = start.content_block.name.unwrap_or_default();
                        self.tool_input_json.clear();
                    }
                    self.block_type = start.content_block.block_type;
                }
                None
            }

            "content_block_delta" => {
                let delta = serde_json::from_str::<ContentBlockDelta>(data).ok()?.delta;
                match delta.delta_type.as_str() {
                    "text_delta" => delta.text.map(|text| StreamEvent::TextDelta { text }),
                    "thinking_delta" => delta.thinking.map(|text| StreamEvent::Thinking { text }),
                    "input_json_delta" => {
                        if let Some(partial) = delta.partial_json {
                            self.tool_input_json.push_str(&partial);
                        }
                        None
                    }
                    other => {
                        debug!(delta_type = other, "unhandled delta type");
                        None
                    }
                }
            }

            "content_block_stop" => {
                let block = std::mem::take(&mut self.block_type);
                if block != "tool_use" {
                    return None;
                }
                let input = serde_json::from_str::<serde_json::Value>(&self.tool_input_json)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                self.tool_input_json.clear();
                Some(StreamEvent::ToolUse {
                    id: std::mem::take(&mut self.tool_id),
                    name: std::mem::take(&mut self.tool_name),
                    input,
                })
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    self.tokens_out = delta.usage.output_tokens;
                    if let Some(reason) = delta.delta.stop_reason {
                        self.stop_reason = reason;
                    }
                }
                None
            }

            "error" => {
                warn!(data, "anthropic stream error");
                Some(StreamEvent::Error {
                    message: data.to_string(),
                })
            }

            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = concat!(
        "event: message_start\n",
        "data: {\"message\":{\"model\":\"claude-x\",\"usage\":{\"input_tokens\":12}}}\n\n",
        "event: content_block_start\n",
        "data: {\"content_block\":{\"type\":\"text\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
        "event: content_block_stop\n",
        "data: {}\n\n",
        "event: content_block_start\n",
        "data: {\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"todo_write\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"todos\\\":\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"[]}\"}}\n\n",
        "event: content_block_stop\n",
        "data: {}\n\n",
        "event: message_delta\n",
        "data: {\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":7}}\n\n",
    );

    #[test]
    fn decodes_text_and_tool_use() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(BODY);

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");

        let tool = events.iter().find_map(|e| match e {
            StreamEvent::ToolUse { id, name, input } => Some((id, name, input)),
            _ => None,
        });
        let (id, name, input) = tool.unwrap();
        assert_eq!(id, "t1");
        assert_eq!(name, "todo_write");
        assert_eq!(input["todos"], serde_json::json!([]));

        match decoder.finish() {
            StreamEvent::Done {
                model,
                tokens_in,
                tokens_out,
                stop_reason,
            } => {
                assert_eq!(model, "claude-x");
                assert_eq!(tokens_in, 12);
                assert_eq!(tokens_out, 7);
                assert_eq!(stop_reason, "tool_use");
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn holds_partial_lines_across_chunks() {
        let mut decoder = SseDecoder::default();
        let (a, b) = BODY.split_at(130);
        let mut events = decoder.feed(a);
        events.extend(decoder.feed(b));
        let deltas = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::TextDelta { .. }))
            .count();
        assert_eq!(deltas, 2);
    }

    #[test]
    fn error_event_is_forwarded() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed("event: error\ndata: {\"type\":\"overloaded_error\"}\n");
        assert!(matches!(events.as_slice(), [StreamEvent::Error { .. }]));
    }
}
