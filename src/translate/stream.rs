use crate::error::{AppError, AppResult};
use crate::sse::SseFrame;
use crate::translate::{approx_token_count, map_stop_reason};
use axum::http::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// What a single foreign frame did to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    /// An error event has been written; the caller must stop reading.
    Terminated,
}

#[derive(Debug, Clone)]
pub struct SummaryToolCall {
    pub id: String,
    pub name: Option<String>,
    pub input: Value,
}

/// Terminal view of a translated stream, used to populate the observation
/// record once the client-facing events have been written.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub message_id: String,
    pub model: String,
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<SummaryToolCall>,
    pub stop_reason: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usage_reported: bool,
}

impl StreamSummary {
    /// The reconstructed assistant message, recorded as the synthetic reply
    /// body so the observation record carries semantics, not opaque bytes.
    pub fn to_message_body(&self) -> Value {
        let mut content: Vec<Value> = Vec::new();
        if !self.text.is_empty() {
            content.push(json!({ "type": "text", "text": self.text.as_str() }));
        }
        for call in &self.tool_calls {
            content.push(json!({
                "type": "tool_use",
                "id": call.id.as_str(),
                "name": call.name.clone(),
                "input": call.input.clone(),
            }));
        }
        json!({
            "id": self.message_id.as_str(),
            "type": "message",
            "role": "assistant",
            "model": self.model.as_str(),
            "content": content,
            "stop_reason": self.stop_reason.as_str(),
            "stop_sequence": Value::Null,
            "usage": {
                "input_tokens": self.input_tokens,
                "output_tokens": self.output_tokens,
            }
        })
    }
}

struct ToolCallState {
    id: String,
    name: Option<String>,
    args: String,
    native_index: u64,
}

/// State machine translating an OpenAI-style delta stream into the native
/// Messages event sequence. Every transition is driven by `handle_frame`;
/// the terminator path runs in `finish`.
///
/// Native block indices are allocated in order of first appearance: the
/// foreign protocol numbers tool calls independently of text, so reusing its
/// indices verbatim would collide with the text block.
pub struct MessageStream {
    message_id: String,
    model: String,
    started: bool,
    saw_tool_call: bool,
    next_index: u64,
    /// Text and reasoning share one block; `None` until either opens it.
    text_index: Option<u64>,
    /// Native block indices in the order they were opened; the terminator
    /// closes them in this order.
    opened: Vec<u64>,
    /// Keyed by the *foreign* tool-call index, which is how continuation
    /// frames refer back to their opener.
    tools: HashMap<u64, ToolCallState>,
    tool_order: Vec<u64>,
    text_buf: String,
    thinking_buf: String,
    usage: Option<Value>,
    last_finish: Option<String>,
}

impl MessageStream {
    pub fn new(model: &str) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4()),
            model: model.to_string(),
            started: false,
            saw_tool_call: false,
            next_index: 0,
            text_index: None,
            opened: Vec::new(),
            tools: HashMap::new(),
            tool_order: Vec::new(),
            text_buf: String::new(),
            thinking_buf: String::new(),
            usage: None,
            last_finish: None,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Feed one parsed foreign frame through the machine.
    pub async fn handle_frame(
        &mut self,
        payload: &Value,
        tx: &mpsc::Sender<SseFrame>,
    ) -> AppResult<FrameOutcome> {
        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| error.to_string());
            if !self.started {
                return Err(AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "upstream_stream_error",
                    message,
                ));
            }
            send(
                tx,
                "error",
                &json!({
                    "type": "error",
                    "error": { "type": "api_error", "message": message }
                }),
            )
            .await?;
            return Ok(FrameOutcome::Terminated);
        }

        if let Some(usage) = payload.get("usage") {
            if usage.is_object() {
                self.usage = Some(usage.clone());
            }
        }

        let choice = payload
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(Value::Null);

        // Observed but never acted on mid-stream: some upstreams put a
        // finish_reason on the frame that also carries the last delta, and
        // closing there would race it. The terminator runs only on [DONE].
        if let Some(finish) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.last_finish = Some(finish.to_string());
        }

        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
        let reasoning = delta
            .get("reasoning")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        let content = delta
            .get("content")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        let tool_calls = delta
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .filter(|arr| !arr.is_empty())
            .cloned();

        // Frames carrying only metadata must not open the message.
        if content.is_none() && reasoning.is_none() && tool_calls.is_none() {
            return Ok(FrameOutcome::Continue);
        }
        self.ensure_started(tx).await?;

        if let Some(reasoning) = reasoning {
            let index = self.ensure_text_block(tx).await?;
            send(
                tx,
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": { "type": "thinking_delta", "thinking": reasoning }
                }),
            )
            .await?;
            self.thinking_buf.push_str(reasoning);
        }

        if let Some(content) = content {
            let index = self.ensure_text_block(tx).await?;
            send(
                tx,
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": { "type": "text_delta", "text": content }
                }),
            )
            .await?;
            self.text_buf.push_str(content);
        }

        if let Some(tool_calls) = tool_calls {
            for entry in &tool_calls {
                self.handle_tool_delta(entry, tx).await?;
            }
        }

        Ok(FrameOutcome::Continue)
    }

    /// The `[DONE]` terminator: close every opened block in the order it was
    /// opened, then emit the message trailer. A stream that carried no
    /// content still produces a complete (empty) message.
    pub async fn finish(&mut self, tx: &mpsc::Sender<SseFrame>) -> AppResult<StreamSummary> {
        self.ensure_started(tx).await?;
        let opened = std::mem::take(&mut self.opened);
        for index in &opened {
            send(
                tx,
                "content_block_stop",
                &json!({ "type": "content_block_stop", "index": index }),
            )
            .await?;
        }

        let summary = self.summary();
        send(
            tx,
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": summary.stop_reason.as_str(),
                    "stop_sequence": Value::Null,
                },
                "usage": { "output_tokens": summary.output_tokens }
            }),
        )
        .await?;
        send(tx, "message_stop", &json!({ "type": "message_stop" })).await?;
        Ok(summary)
    }

    /// Terminal view without emitting anything; also used when the stream is
    /// cut short (client gone, upstream timeout) and the record still needs
    /// the partial content.
    pub fn summary(&self) -> StreamSummary {
        let stop_reason = if self.saw_tool_call {
            // Upstreams occasionally close with `stop` despite having
            // emitted tool-call deltas; the tool call wins.
            "tool_use".to_string()
        } else {
            map_stop_reason(self.last_finish.as_deref()).to_string()
        };

        let reported_output = self
            .usage
            .as_ref()
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_u64());
        let usage_reported = reported_output.is_some();
        let output_tokens = reported_output.unwrap_or_else(|| {
            approx_token_count(&self.text_buf) + approx_token_count(&self.thinking_buf)
        });
        let input_tokens = self
            .usage
            .as_ref()
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let mut tool_calls = Vec::with_capacity(self.tool_order.len());
        for index in &self.tool_order {
            let Some(state) = self.tools.get(index) else {
                continue;
            };
            let input = if state.args.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&state.args).unwrap_or_else(|err| {
                    tracing::warn!(
                        "tool call {} closed with invalid JSON arguments: {err}",
                        state.id
                    );
                    json!({})
                })
            };
            tool_calls.push(SummaryToolCall {
                id: state.id.clone(),
                name: state.name.clone(),
                input,
            });
        }

        StreamSummary {
            message_id: self.message_id.clone(),
            model: self.model.clone(),
            text: self.text_buf.clone(),
            thinking: self.thinking_buf.clone(),
            tool_calls,
            stop_reason,
            input_tokens,
            output_tokens,
            usage_reported,
        }
    }

    async fn ensure_started(&mut self, tx: &mpsc::Sender<SseFrame>) -> AppResult<()> {
        if self.started {
            return Ok(());
        }
        send(
            tx,
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id.as_str(),
                    "type": "message",
                    "role": "assistant",
                    "model": self.model.as_str(),
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 }
                }
            }),
        )
        .await?;
        send(tx, "ping", &json!({ "type": "ping" })).await?;
        self.started = true;
        Ok(())
    }

    /// Text and reasoning share one block; whichever arrives first opens it.
    async fn ensure_text_block(&mut self, tx: &mpsc::Sender<SseFrame>) -> AppResult<u64> {
        if let Some(index) = self.text_index {
            return Ok(index);
        }
        let index = self.next_index;
        self.next_index += 1;
        self.text_index = Some(index);
        self.opened.push(index);
        send(
            tx,
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": { "type": "text", "text": "" }
            }),
        )
        .await?;
        Ok(index)
    }

    async fn handle_tool_delta(
        &mut self,
        entry: &Value,
        tx: &mpsc::Sender<SseFrame>,
    ) -> AppResult<()> {
        let foreign_index = entry.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        let entry_name = entry
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());

        if !self.tools.contains_key(&foreign_index) {
            let id = entry
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .unwrap_or_else(|| {
                    format!(
                        "call_{}_{}",
                        chrono::Utc::now().timestamp_millis(),
                        foreign_index
                    )
                });
            if entry_name.is_none() {
                tracing::warn!("tool call at index {foreign_index} opened without a name");
            }
            let native_index = self.next_index;
            self.next_index += 1;
            send(
                tx,
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": native_index,
                    "content_block": {
                        "type": "tool_use",
                        "id": id.as_str(),
                        "name": entry_name,
                        "input": {}
                    }
                }),
            )
            .await?;
            self.tools.insert(
                foreign_index,
                ToolCallState {
                    id,
                    name: entry_name.map(|s| s.to_string()),
                    args: String::new(),
                    native_index,
                },
            );
            self.tool_order.push(foreign_index);
            self.opened.push(native_index);
            self.saw_tool_call = true;
        }

        let state = self
            .tools
            .get_mut(&foreign_index)
            .expect("tool state just ensured");
        if let Some(name) = entry_name {
            match &state.name {
                Some(existing) if existing != name => {
                    tracing::warn!(
                        "tool call at index {foreign_index} renamed mid-stream \
                         ({existing} -> {name}); keeping the opener's name"
                    );
                }
                None => state.name = Some(name.to_string()),
                _ => {}
            }
        }

        // The upstream sends the cumulative arguments string, not a delta.
        let new_args = entry
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if new_args.len() > state.args.len() {
            match new_args.get(state.args.len()..) {
                Some(delta) => {
                    let payload = json!({
                        "type": "content_block_delta",
                        "index": state.native_index,
                        "delta": { "type": "input_json_delta", "partial_json": delta }
                    });
                    send(tx, "content_block_delta", &payload).await?;
                    let state = self
                        .tools
                        .get_mut(&foreign_index)
                        .expect("tool state just ensured");
                    state.args = new_args.to_string();
                }
                None => {
                    tracing::warn!(
                        "tool call at index {foreign_index} sent arguments diverging \
                         mid-character; frame discarded"
                    );
                }
            }
        } else if new_args.len() < state.args.len() {
            tracing::warn!(
                "tool call at index {foreign_index} sent shorter cumulative arguments \
                 ({} < {}); frame discarded",
                new_args.len(),
                state.args.len()
            );
        }
        Ok(())
    }
}

/// Emit one native error event; used by the orchestrator for mid-stream
/// failures that originate outside the translator (timeouts, resets).
pub async fn send_error_event(tx: &mpsc::Sender<SseFrame>, message: &str) -> AppResult<()> {
    send(
        tx,
        "error",
        &json!({
            "type": "error",
            "error": { "type": "api_error", "message": message }
        }),
    )
    .await
}

async fn send(tx: &mpsc::Sender<SseFrame>, name: &str, payload: &Value) -> AppResult<()> {
    tx.send(SseFrame::named(name, payload))
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_GATEWAY,
                "stream_send_failed",
                err.to_string(),
            )
        })
}
