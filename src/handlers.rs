use crate::app::AppState;
use crate::config::ProxyMode;
use crate::error::{sanitize_message, AppError, AppResult};
use crate::sse::{SseFrame, SseParser};
use crate::store::{
    MergedContent, MergedToolCall, ObservationStore, ResponseSnapshot, TokenUsage,
};
use crate::translate::request::{build_chat_request, resolve_model};
use crate::translate::response::chat_completion_to_message;
use crate::translate::stream::{send_error_event, FrameOutcome, MessageStream, StreamSummary};
use crate::upstream;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const STREAM_CHANNEL_CAPACITY: usize = 64;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn service_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": "periscope",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": mode_label(state.config.mode),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

fn mode_label(mode: ProxyMode) -> &'static str {
    match mode {
        ProxyMode::Direct => "direct",
        ProxyMode::Translated => "translated",
    }
}

/// Core proxy entry. Records the request, routes it to the configured
/// upstream, and records how it ended.
pub async fn create_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let mode = mode_label(state.config.mode);
    metrics::counter!("periscope_requests_total", "mode" => mode).increment(1);

    let record_id = state.store.start(
        "POST",
        "/v1/messages",
        headers_to_value(&headers),
        body.clone(),
    );
    let streaming = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let result = match (state.config.mode, streaming) {
        (ProxyMode::Direct, false) => direct_buffered(&state, &record_id, &headers, &body).await,
        (ProxyMode::Direct, true) => direct_stream(&state, &record_id, &headers, &body).await,
        (ProxyMode::Translated, false) => translated_buffered(&state, &record_id, &body).await,
        (ProxyMode::Translated, true) => translated_stream(&state, &record_id, &body).await,
    };

    match result {
        Ok(response) => Ok(response),
        Err(err) => {
            metrics::counter!("periscope_request_errors_total", "mode" => mode).increment(1);
            state
                .store
                .set_error(&record_id, &err.message, Some(&err.code));
            Err(err.sanitized())
        }
    }
}

/// Token counting has no translated equivalent; both modes forward it to the
/// Anthropic upstream verbatim.
pub async fn count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let record_id = state.store.start(
        "POST",
        "/v1/messages/count_tokens",
        headers_to_value(&headers),
        body.clone(),
    );
    let resp = upstream::post_anthropic(
        &state.http,
        &state.config.anthropic_base_url,
        "/v1/messages/count_tokens",
        &headers,
        &body,
        Some(request_timeout(&state)),
    )
    .await
    .map_err(|err| {
        let app = err.to_app();
        state
            .store
            .set_error(&record_id, &app.message, Some(&app.code));
        app.sanitized()
    })?;

    let status = resp.status();
    let resp_headers = headers_to_value(resp.headers());
    let value = match read_json_body(resp).await {
        Ok(value) => value,
        Err(err) => {
            state
                .store
                .set_error(&record_id, &err.message, Some(&err.code));
            return Err(err.sanitized());
        }
    };
    state.store.end(
        &record_id,
        ResponseSnapshot {
            status: status.as_u16(),
            headers: resp_headers,
            body: value.clone(),
        },
    );
    Ok((status, Json(value)).into_response())
}

fn request_timeout(state: &AppState) -> Duration {
    Duration::from_secs(state.config.request_timeout_secs)
}

async fn read_json_body(resp: reqwest::Response) -> AppResult<Value> {
    let text = resp.text().await.map_err(|err| {
        AppError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_stream_error",
            err.to_string(),
        )
    })?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

// ---------------------------------------------------------------------------
// Direct mode
// ---------------------------------------------------------------------------

async fn direct_buffered(
    state: &AppState,
    record_id: &str,
    headers: &HeaderMap,
    body: &Value,
) -> AppResult<Response> {
    let resp = upstream::post_anthropic(
        &state.http,
        &state.config.anthropic_base_url,
        "/v1/messages",
        headers,
        body,
        Some(request_timeout(state)),
    )
    .await
    .map_err(|err| err.to_app())?;

    let status = resp.status();
    let resp_headers = headers_to_value(resp.headers());
    let mut value = read_json_body(resp).await?;
    if !status.is_success() {
        sanitize_error_body(&mut value);
    }
    state.store.end(
        record_id,
        ResponseSnapshot {
            status: status.as_u16(),
            headers: resp_headers,
            body: value.clone(),
        },
    );
    Ok((status, Json(value)).into_response())
}

async fn direct_stream(
    state: &AppState,
    record_id: &str,
    headers: &HeaderMap,
    body: &Value,
) -> AppResult<Response> {
    let resp = upstream::post_anthropic(
        &state.http,
        &state.config.anthropic_base_url,
        "/v1/messages",
        headers,
        body,
        None,
    )
    .await
    .map_err(|err| err.to_app())?;

    let status = resp.status();
    if !status.is_success() {
        let mut value = read_json_body(resp).await?;
        sanitize_error_body(&mut value);
        state.store.end(
            record_id,
            ResponseSnapshot {
                status: status.as_u16(),
                headers: json!({}),
                body: value.clone(),
            },
        );
        return Ok((status, Json(value)).into_response());
    }

    let (tx, rx) = mpsc::channel::<SseFrame>(STREAM_CHANNEL_CAPACITY);
    let store = state.store.clone();
    let record_id = record_id.to_string();
    let timeout = request_timeout(state);
    tokio::spawn(async move {
        drive_direct_stream(store, record_id, resp, tx, timeout).await;
    });
    Ok(sse_response(rx))
}

/// Relay the upstream event stream verbatim while observing it: each frame
/// is re-emitted unchanged, recorded as a chunk, and folded into the merged
/// summary.
async fn drive_direct_stream(
    store: Arc<ObservationStore>,
    record_id: String,
    resp: reqwest::Response,
    tx: mpsc::Sender<SseFrame>,
    timeout: Duration,
) {
    let mut parser = SseParser::new();
    let mut merge = DirectMerge::default();
    let mut bytes = resp.bytes_stream();
    let mut chunks_sent = 0u64;
    let mut client_gone = false;

    'read: loop {
        match tokio::time::timeout(timeout, bytes.next()).await {
            Err(_) => {
                store.set_error(
                    &record_id,
                    "upstream timed out mid-stream",
                    Some("upstream_timeout"),
                );
                let _ = send_error_event(&tx, "upstream timed out").await;
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                store.set_error(
                    &record_id,
                    &sanitize_message(&err.to_string()),
                    Some("upstream_stream_error"),
                );
                let _ = send_error_event(&tx, "upstream connection lost").await;
                return;
            }
            Ok(Some(Ok(chunk))) => {
                for frame in parser.push(&chunk) {
                    store.add_chunk(&record_id, &frame.data);
                    chunks_sent += 1;
                    merge.observe(&frame);
                    if tx.send(frame).await.is_err() {
                        client_gone = true;
                        break 'read;
                    }
                }
            }
        }
    }

    if !client_gone {
        if let Some(frame) = parser.finish() {
            store.add_chunk(&record_id, &frame.data);
            chunks_sent += 1;
            merge.observe(&frame);
            let _ = tx.send(frame).await;
        }
    }

    if client_gone && chunks_sent == 0 {
        store.set_error(
            &record_id,
            "client disconnected before the first chunk",
            Some("client_disconnect"),
        );
        return;
    }

    let (merged, body) = merge.into_parts();
    store.set_merged(&record_id, merged);
    store.end(
        &record_id,
        ResponseSnapshot {
            status: 200,
            headers: json!({}),
            body,
        },
    );
}

// ---------------------------------------------------------------------------
// Translated mode
// ---------------------------------------------------------------------------

fn openrouter_key() -> AppResult<String> {
    std::env::var("OPENROUTER_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "openrouter_key_missing",
                "OPENROUTER_API_KEY is not set",
            )
        })
}

async fn translated_buffered(
    state: &AppState,
    record_id: &str,
    body: &Value,
) -> AppResult<Response> {
    let foreign = build_chat_request(body, &state.config)
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err))?;
    let api_key = openrouter_key()?;
    let resp = upstream::post_openrouter(
        &state.http,
        &state.config.openrouter_base_url,
        &api_key,
        &foreign,
        Some(request_timeout(state)),
    )
    .await
    .map_err(|err| err.to_app())?;

    let value = read_json_body(resp).await?;
    let model = resolve_model(
        body.get("model").and_then(|v| v.as_str()),
        &state.config.models,
    );
    let native = chat_completion_to_message(&value, &model);
    state.store.end(
        record_id,
        ResponseSnapshot {
            status: 200,
            headers: json!({}),
            body: native.clone(),
        },
    );
    Ok(Json(native).into_response())
}

async fn translated_stream(
    state: &AppState,
    record_id: &str,
    body: &Value,
) -> AppResult<Response> {
    let foreign = build_chat_request(body, &state.config)
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err))?;
    let api_key = openrouter_key()?;
    let resp = upstream::post_openrouter(
        &state.http,
        &state.config.openrouter_base_url,
        &api_key,
        &foreign,
        None,
    )
    .await
    .map_err(|err| err.to_app())?;

    let model = foreign
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let (tx, rx) = mpsc::channel::<SseFrame>(STREAM_CHANNEL_CAPACITY);
    let store = state.store.clone();
    let record_id = record_id.to_string();
    let timeout = request_timeout(state);
    tokio::spawn(async move {
        drive_translated_stream(store, record_id, model, resp, tx, timeout).await;
    });
    Ok(sse_response(rx))
}

/// Pull foreign delta frames off the upstream, push native events to the
/// client, and keep the observation record in step.
async fn drive_translated_stream(
    store: Arc<ObservationStore>,
    record_id: String,
    model: String,
    resp: reqwest::Response,
    tx: mpsc::Sender<SseFrame>,
    timeout: Duration,
) {
    let mut machine = MessageStream::new(&model);
    let mut events = resp.bytes_stream().eventsource();
    let mut chunks_sent = 0u64;

    loop {
        match tokio::time::timeout(timeout, events.next()).await {
            Err(_) => {
                // Missing [DONE] must not hang the request forever.
                store.set_error(
                    &record_id,
                    "upstream timed out mid-stream",
                    Some("upstream_timeout"),
                );
                if machine.started() {
                    let _ = send_error_event(&tx, "upstream timed out").await;
                }
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                store.set_error(
                    &record_id,
                    &sanitize_message(&err.to_string()),
                    Some("upstream_stream_error"),
                );
                if machine.started() {
                    let _ = send_error_event(&tx, "upstream connection lost").await;
                }
                return;
            }
            Ok(Some(Ok(event))) => {
                if event.data.trim() == "[DONE]" {
                    break;
                }
                store.add_chunk(&record_id, &event.data);
                chunks_sent += 1;
                let Some(payload) = SseFrame::data_only(event.data).json() else {
                    continue;
                };
                match machine.handle_frame(&payload, &tx).await {
                    Ok(FrameOutcome::Continue) => {}
                    Ok(FrameOutcome::Terminated) => {
                        store.set_error(
                            &record_id,
                            "upstream reported an error mid-stream",
                            Some("upstream_stream_error"),
                        );
                        return;
                    }
                    Err(err) if err.code == "stream_send_failed" => {
                        finish_disconnected(&store, &record_id, &machine, chunks_sent);
                        return;
                    }
                    Err(err) => {
                        // Pre-preamble upstream error; the SSE response is
                        // already committed, so surface it as an event.
                        store.set_error(&record_id, &err.message, Some(&err.code));
                        let _ = send_error_event(&tx, &sanitize_message(&err.message)).await;
                        return;
                    }
                }
            }
        }
    }

    match machine.finish(&tx).await {
        Ok(summary) => {
            store.set_merged(&record_id, merged_from_summary(&summary, true));
            store.end(
                &record_id,
                ResponseSnapshot {
                    status: 200,
                    headers: json!({}),
                    body: summary.to_message_body(),
                },
            );
        }
        Err(_) => finish_disconnected(&store, &record_id, &machine, chunks_sent),
    }
}

/// The inbound connection closed. Content already relayed still counts as a
/// success; a disconnect before anything flowed is recorded as an error.
fn finish_disconnected(
    store: &ObservationStore,
    record_id: &str,
    machine: &MessageStream,
    chunks_sent: u64,
) {
    if chunks_sent == 0 {
        store.set_error(
            record_id,
            "client disconnected before the first chunk",
            Some("client_disconnect"),
        );
        return;
    }
    let summary = machine.summary();
    store.set_merged(record_id, merged_from_summary(&summary, false));
    store.end(
        record_id,
        ResponseSnapshot {
            status: 200,
            headers: json!({}),
            body: summary.to_message_body(),
        },
    );
}

fn merged_from_summary(summary: &StreamSummary, complete: bool) -> MergedContent {
    MergedContent {
        complete_text: summary.text.clone(),
        thinking: if summary.thinking.is_empty() {
            None
        } else {
            Some(summary.thinking.clone())
        },
        tool_calls: summary
            .tool_calls
            .iter()
            .map(|call| MergedToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            })
            .collect(),
        message_complete: complete,
        total_characters: summary.text.chars().count() as u64,
        timestamp: Utc::now(),
        usage: Some(TokenUsage {
            input_tokens: summary.input_tokens,
            output_tokens: summary.output_tokens,
        }),
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

fn sse_response(rx: mpsc::Receiver<SseFrame>) -> Response {
    Sse::new(ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.into_sse())))
        .into_response()
}

fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let text = value.to_str().unwrap_or("<binary>").to_string();
        match map.get_mut(name.as_str()) {
            None => {
                map.insert(name.as_str().to_string(), Value::String(text));
            }
            Some(Value::String(existing)) => {
                let first = Value::String(existing.clone());
                map.insert(
                    name.as_str().to_string(),
                    Value::Array(vec![first, Value::String(text)]),
                );
            }
            Some(Value::Array(items)) => items.push(Value::String(text)),
            Some(_) => {}
        }
    }
    Value::Object(map)
}

fn sanitize_error_body(body: &mut Value) {
    let sanitized = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(sanitize_message);
    if let Some(message) = sanitized {
        body["error"]["message"] = Value::String(message);
    }
}

/// Rebuilds the non-streaming view of a directly relayed native event
/// stream, so the record carries the assistant message and not just bytes.
#[derive(Default)]
struct DirectMerge {
    message_id: Option<String>,
    model: Option<String>,
    text: String,
    thinking: String,
    tools: Vec<DirectMergeTool>,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    saw_usage: bool,
    complete: bool,
}

struct DirectMergeTool {
    index: u64,
    id: String,
    name: Option<String>,
    args: String,
}

impl DirectMerge {
    fn observe(&mut self, frame: &SseFrame) {
        if frame.is_done() {
            return;
        }
        let Some(payload) = frame.json() else {
            return;
        };
        match payload.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "message_start" => {
                let message = payload.get("message").cloned().unwrap_or(Value::Null);
                self.message_id = message
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                self.model = message
                    .get("model")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                if let Some(tokens) = message
                    .get("usage")
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    self.input_tokens = tokens;
                    self.saw_usage = true;
                }
            }
            "content_block_start" => {
                let block = payload.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    self.tools.push(DirectMergeTool {
                        index: payload.get("index").and_then(|v| v.as_u64()).unwrap_or(0),
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                        args: String::new(),
                    });
                }
            }
            "content_block_delta" => {
                let index = payload.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let delta = payload.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            self.text.push_str(text);
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            self.thinking.push_str(text);
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) =
                            delta.get("partial_json").and_then(|v| v.as_str())
                        {
                            if let Some(tool) =
                                self.tools.iter_mut().find(|t| t.index == index)
                            {
                                tool.args.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = payload
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(tokens) = payload
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    self.output_tokens = tokens;
                    self.saw_usage = true;
                }
            }
            "message_stop" => self.complete = true,
            _ => {}
        }
    }

    fn into_parts(self) -> (MergedContent, Value) {
        let mut content: Vec<Value> = Vec::new();
        if !self.text.is_empty() {
            content.push(json!({ "type": "text", "text": self.text.as_str() }));
        }
        let mut tool_calls = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            let input = if tool.args.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tool.args).unwrap_or_else(|err| {
                    tracing::warn!(
                        "tool call {} closed with invalid JSON arguments: {err}",
                        tool.id
                    );
                    json!({})
                })
            };
            content.push(json!({
                "type": "tool_use",
                "id": tool.id.as_str(),
                "name": tool.name.clone(),
                "input": input.clone(),
            }));
            tool_calls.push(MergedToolCall {
                id: tool.id.clone(),
                name: tool.name.clone(),
                input,
            });
        }

        let body = json!({
            "id": self
                .message_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4())),
            "type": "message",
            "role": "assistant",
            "model": self.model.clone().unwrap_or_default(),
            "content": content,
            "stop_reason": self.stop_reason.clone(),
            "stop_sequence": Value::Null,
            "usage": {
                "input_tokens": self.input_tokens,
                "output_tokens": self.output_tokens,
            }
        });
        let merged = MergedContent {
            complete_text: self.text.clone(),
            thinking: if self.thinking.is_empty() {
                None
            } else {
                Some(self.thinking.clone())
            },
            tool_calls,
            message_complete: self.complete,
            total_characters: self.text.chars().count() as u64,
            timestamp: Utc::now(),
            usage: if self.saw_usage {
                Some(TokenUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                })
            } else {
                None
            },
        };
        (merged, body)
    }
}
