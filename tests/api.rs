use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use axum::Json;
use http_body_util::BodyExt;
use periscope::config::{ProxyConfig, ProxyMode};
use periscope::sse::{SseFrame, SseParser};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

#[derive(Default)]
struct Captured {
    bodies: Vec<Value>,
    headers: Vec<(String, String)>,
}

type Shared = Arc<Mutex<Captured>>;

struct TestContext {
    router: axum::Router,
    state: periscope::app::AppState,
    anthropic: Shared,
    openrouter: Shared,
}

impl TestContext {
    async fn new(mode: ProxyMode) -> Self {
        std::env::set_var("OPENROUTER_API_KEY", "test-openrouter-key");
        let (anthropic_addr, anthropic) = start_anthropic_upstream().await;
        let (openrouter_addr, openrouter) = start_openrouter_upstream().await;

        let mut config = ProxyConfig::default();
        config.mode = mode;
        config.anthropic_base_url = format!("http://{anthropic_addr}");
        config.openrouter_base_url = format!("http://{openrouter_addr}");
        config.request_timeout_secs = 5;
        config.models.sonnet = Some("mock/sonnet-equivalent".to_string());

        let state = periscope::app::load_state_with_config(config).expect("state");
        let router = periscope::app::build_app(state.clone());
        Self {
            router,
            state,
            anthropic,
            openrouter,
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .header("x-api-key", "sk-ant-REDACTED")
            .body(Body::from(serde_json::to_vec(body).expect("encode body")))
            .expect("request");
        self.router.clone().oneshot(request).await.expect("response")
    }

    async fn get(&self, path: &str) -> Response {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("request");
        self.router.clone().oneshot(request).await.expect("response")
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

async fn body_frames(response: Response) -> Vec<SseFrame> {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    let mut parser = SseParser::new();
    let mut frames = parser.push(&bytes);
    if let Some(frame) = parser.finish() {
        frames.push(frame);
    }
    frames
}

fn sse_events(events: Vec<Event>) -> Response {
    let stream = futures_util::stream::iter(events.into_iter().map(Ok::<_, Infallible>));
    Sse::new(stream).into_response()
}

// ---------------------------------------------------------------------------
// Mock upstreams
// ---------------------------------------------------------------------------

async fn start_anthropic_upstream() -> (SocketAddr, Shared) {
    let captured: Shared = Arc::new(Mutex::new(Captured::default()));

    async fn messages(
        State(captured): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        {
            let mut lock = captured.lock().expect("captured lock");
            for name in ["anthropic-version", "x-api-key", "authorization"] {
                if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                    lock.headers.push((name.to_string(), value.to_string()));
                }
            }
            lock.bodies.push(body.clone());
        }

        if let Some(status) = body.get("force_status").and_then(|v| v.as_u64()) {
            let status = StatusCode::from_u16(status as u16).expect("status");
            return (
                status,
                Json(json!({
                    "error": {
                        "type": "authentication_error",
                        "message": "invalid key sk-ant-REDACTED"
                    }
                })),
            )
                .into_response();
        }

        if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
            let events = vec![
                Event::default().event("message_start").data(
                    json!({
                        "type": "message_start",
                        "message": {
                            "id": "msg_upstream", "type": "message", "role": "assistant",
                            "model": "claude-3-5-sonnet", "content": [],
                            "stop_reason": null, "stop_sequence": null,
                            "usage": { "input_tokens": 9, "output_tokens": 0 }
                        }
                    })
                    .to_string(),
                ),
                Event::default()
                    .event("ping")
                    .data(json!({ "type": "ping" }).to_string()),
                Event::default().event("content_block_start").data(
                    json!({
                        "type": "content_block_start", "index": 0,
                        "content_block": { "type": "text", "text": "" }
                    })
                    .to_string(),
                ),
                Event::default().event("content_block_delta").data(
                    json!({
                        "type": "content_block_delta", "index": 0,
                        "delta": { "type": "text_delta", "text": "direct " }
                    })
                    .to_string(),
                ),
                Event::default().event("content_block_delta").data(
                    json!({
                        "type": "content_block_delta", "index": 0,
                        "delta": { "type": "text_delta", "text": "reply" }
                    })
                    .to_string(),
                ),
                Event::default().event("content_block_stop").data(
                    json!({ "type": "content_block_stop", "index": 0 }).to_string(),
                ),
                Event::default().event("message_delta").data(
                    json!({
                        "type": "message_delta",
                        "delta": { "stop_reason": "end_turn", "stop_sequence": null },
                        "usage": { "output_tokens": 2 }
                    })
                    .to_string(),
                ),
                Event::default()
                    .event("message_stop")
                    .data(json!({ "type": "message_stop" }).to_string()),
            ];
            return sse_events(events);
        }

        Json(json!({
            "id": "msg_upstream",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet",
            "content": [{ "type": "text", "text": "direct reply" }],
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": { "input_tokens": 9, "output_tokens": 2 }
        }))
        .into_response()
    }

    async fn count_tokens(Json(_body): Json<Value>) -> Json<Value> {
        Json(json!({ "input_tokens": 42 }))
    }

    let router = axum::Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .with_state(captured.clone());
    let addr = serve(router).await;
    (addr, captured)
}

async fn start_openrouter_upstream() -> (SocketAddr, Shared) {
    let captured: Shared = Arc::new(Mutex::new(Captured::default()));

    async fn chat(
        State(captured): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        {
            let mut lock = captured.lock().expect("captured lock");
            if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
                lock.headers
                    .push(("authorization".to_string(), value.to_string()));
            }
            lock.bodies.push(body.clone());
        }

        let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("");
        if model == "err/429" {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": { "code": "rate_limited", "message": "slow down" } })),
            )
                .into_response();
        }

        let wants_tool = body.to_string().contains("use-tool");
        if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
            let frames: Vec<Value> = if wants_tool {
                vec![
                    json!({ "choices": [{ "delta": { "tool_calls": [
                        { "index": 0, "id": "call_1",
                          "function": { "name": "lookup", "arguments": "" } }
                    ] } }] }),
                    json!({ "choices": [{ "delta": { "tool_calls": [
                        { "index": 0, "function": { "arguments": "{\"q\"" } }
                    ] } }] }),
                    json!({ "choices": [{ "delta": { "tool_calls": [
                        { "index": 0, "function": { "arguments": "{\"q\":\"x\"" } }
                    ] } }] }),
                    json!({ "choices": [{ "delta": { "tool_calls": [
                        { "index": 0, "function": { "arguments": "{\"q\":\"x\"}" } }
                    ] } }] }),
                    json!({ "choices": [{ "finish_reason": "tool_calls", "delta": {} }] }),
                ]
            } else {
                vec![
                    json!({ "choices": [{ "delta": { "content": "Hi" } }] }),
                    json!({
                        "choices": [{ "delta": { "content": " world" } }],
                        "usage": { "prompt_tokens": 4, "completion_tokens": 2 }
                    }),
                    json!({ "choices": [{ "finish_reason": "stop", "delta": {} }] }),
                ]
            };
            let mut events: Vec<Event> = frames
                .into_iter()
                .map(|f| Event::default().data(f.to_string()))
                .collect();
            events.push(Event::default().data("[DONE]"));
            return sse_events(events);
        }

        Json(json!({
            "id": "chatcmpl-mock1",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "translated reply" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 4, "completion_tokens": 2 }
        }))
        .into_response()
    }

    let router = axum::Router::new()
        .route("/v1/chat/completions", post(chat))
        .with_state(captured.clone());
    let addr = serve(router).await;
    (addr, captured)
}

async fn serve(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve mock");
    });
    addr
}

// ---------------------------------------------------------------------------
// Direct mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_endpoint_responds() {
    let ctx = TestContext::new(ProxyMode::Direct).await;
    let response = ctx.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn direct_buffered_request_is_relayed_and_recorded() {
    let ctx = TestContext::new(ProxyMode::Direct).await;
    let body = json!({
        "model": "claude-3-5-sonnet",
        "max_tokens": 100,
        "messages": [{ "role": "user", "content": "hello" }]
    });
    let response = ctx.post("/v1/messages", &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let reply = body_json(response).await;
    assert_eq!(reply["content"][0]["text"], "direct reply");

    // The upstream saw the default anthropic-version and the client's key.
    let captured = ctx.anthropic.lock().expect("lock");
    assert!(captured
        .headers
        .iter()
        .any(|(k, v)| k == "anthropic-version" && v == "2023-06-01"));
    assert!(captured
        .headers
        .iter()
        .any(|(k, v)| k == "x-api-key" && v.starts_with("sk-ant")));
    drop(captured);

    let page = ctx.state.store.query(&Default::default());
    assert_eq!(page.total, 1);
    let record = &page.data[0];
    assert_eq!(record.status, periscope::store::RecordStatus::Success);
    assert_eq!(record.metrics.input_tokens, 9);
    assert_eq!(record.metrics.output_tokens, 2);
    // The client's key is masked in the recorded snapshot.
    let masked = record.request.headers["x-api-key"].as_str().unwrap();
    assert!(masked.contains("..."));
    assert!(!masked.contains("abcdefghijklmnop"));
}

#[tokio::test]
async fn direct_stream_is_relayed_verbatim_and_merged() {
    let ctx = TestContext::new(ProxyMode::Direct).await;
    let body = json!({
        "model": "claude-3-5-sonnet",
        "max_tokens": 100,
        "stream": true,
        "messages": [{ "role": "user", "content": "hello" }]
    });
    let response = ctx.post("/v1/messages", &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let frames = body_frames(response).await;
    let names: Vec<&str> = frames
        .iter()
        .map(|f| f.event.as_deref().unwrap_or(""))
        .collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let page = ctx.state.store.query(&Default::default());
    let record = &page.data[0];
    assert_eq!(record.status, periscope::store::RecordStatus::Success);
    assert_eq!(record.metrics.chunks_count, 8);
    assert!(record.metrics.first_chunk_ms.is_some());
    let merged = record.merged_content.as_ref().expect("merged");
    assert_eq!(merged.complete_text, "direct reply");
    assert!(merged.message_complete);
    let response_body = &record.response.as_ref().expect("response").body;
    assert_eq!(response_body["content"][0]["text"], "direct reply");
}

#[tokio::test]
async fn direct_upstream_error_status_is_relayed_sanitized() {
    let ctx = TestContext::new(ProxyMode::Direct).await;
    let body = json!({
        "model": "claude-3-5-sonnet",
        "force_status": 401,
        "messages": []
    });
    let response = ctx.post("/v1/messages", &body).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let reply = body_json(response).await;
    let message = reply["error"]["message"].as_str().unwrap();
    assert!(!message.contains("sk-ant-api03"));

    let page = ctx.state.store.query(&Default::default());
    assert_eq!(
        page.data[0].status,
        periscope::store::RecordStatus::Error
    );
}

#[tokio::test]
async fn count_tokens_is_forwarded() {
    let ctx = TestContext::new(ProxyMode::Direct).await;
    let response = ctx
        .post(
            "/v1/messages/count_tokens",
            &json!({ "model": "claude-3-5-sonnet", "messages": [] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["input_tokens"], 42);
}

// ---------------------------------------------------------------------------
// Translated mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn translated_buffered_request_maps_both_directions() {
    let ctx = TestContext::new(ProxyMode::Translated).await;
    let body = json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 256,
        "system": "be helpful",
        "messages": [{ "role": "user", "content": "hello" }],
        "tools": [{
            "name": "fetch",
            "description": "get a url",
            "input_schema": {
                "type": "object",
                "properties": { "url": { "type": "string", "format": "uri" } }
            }
        }]
    });
    let response = ctx.post("/v1/messages", &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let reply = body_json(response).await;
    assert_eq!(reply["type"], "message");
    assert_eq!(reply["role"], "assistant");
    assert_eq!(reply["content"][0]["text"], "translated reply");
    assert_eq!(reply["stop_reason"], "end_turn");
    assert_eq!(reply["usage"]["input_tokens"], 4);

    let captured = ctx.openrouter.lock().expect("lock");
    let foreign = &captured.bodies[0];
    assert_eq!(foreign["model"], "mock/sonnet-equivalent");
    assert_eq!(foreign["messages"][0]["role"], "system");
    assert_eq!(foreign["messages"][0]["content"], "be helpful");
    assert_eq!(foreign["max_tokens"], 256);
    assert!(foreign["tools"][0]["function"]["parameters"]["properties"]["url"]
        .get("format")
        .is_none());
    assert!(captured
        .headers
        .iter()
        .any(|(k, v)| k == "authorization" && v == "Bearer test-openrouter-key"));
}

#[tokio::test]
async fn translated_text_stream_produces_native_events() {
    let ctx = TestContext::new(ProxyMode::Translated).await;
    let body = json!({
        "model": "claude-3-5-sonnet",
        "max_tokens": 64,
        "stream": true,
        "messages": [{ "role": "user", "content": "hello" }]
    });
    let response = ctx.post("/v1/messages", &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let frames = body_frames(response).await;
    let names: Vec<&str> = frames
        .iter()
        .map(|f| f.event.as_deref().unwrap_or(""))
        .collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    let payloads: Vec<Value> = frames.iter().map(|f| f.json().expect("json")).collect();
    assert_eq!(payloads[0]["message"]["model"], "mock/sonnet-equivalent");
    assert_eq!(payloads[3]["delta"]["text"], "Hi");
    assert_eq!(payloads[4]["delta"]["text"], " world");
    assert_eq!(payloads[6]["delta"]["stop_reason"], "end_turn");
    assert_eq!(payloads[6]["usage"]["output_tokens"], 2);
    // The foreign [DONE] sentinel is never forwarded.
    assert!(!frames.iter().any(|f| f.is_done()));

    let page = ctx.state.store.query(&Default::default());
    let record = &page.data[0];
    assert_eq!(record.status, periscope::store::RecordStatus::Success);
    let merged = record.merged_content.as_ref().expect("merged");
    assert_eq!(merged.complete_text, "Hi world");
    assert_eq!(merged.usage.expect("usage").output_tokens, 2);
}

#[tokio::test]
async fn translated_tool_stream_reconstructs_the_call() {
    let ctx = TestContext::new(ProxyMode::Translated).await;
    let body = json!({
        "model": "claude-3-5-sonnet",
        "max_tokens": 64,
        "stream": true,
        "messages": [{ "role": "user", "content": "please use-tool now" }]
    });
    let response = ctx.post("/v1/messages", &body).await;
    let frames = body_frames(response).await;
    let payloads: Vec<Value> = frames.iter().map(|f| f.json().expect("json")).collect();

    let start = payloads
        .iter()
        .find(|p| p["type"] == "content_block_start")
        .expect("block start");
    assert_eq!(start["content_block"]["type"], "tool_use");
    assert_eq!(start["content_block"]["id"], "call_1");
    assert_eq!(start["content_block"]["name"], "lookup");

    let partials: String = payloads
        .iter()
        .filter(|p| p["type"] == "content_block_delta")
        .map(|p| p["delta"]["partial_json"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(partials, "{\"q\":\"x\"}");
    let trailer = payloads
        .iter()
        .find(|p| p["type"] == "message_delta")
        .expect("message delta");
    assert_eq!(trailer["delta"]["stop_reason"], "tool_use");

    let page = ctx.state.store.query(&Default::default());
    let merged = page.data[0].merged_content.as_ref().expect("merged");
    assert_eq!(merged.tool_calls.len(), 1);
    assert_eq!(merged.tool_calls[0].input, json!({ "q": "x" }));
}

#[tokio::test]
async fn translated_upstream_error_surfaces_with_status() {
    let ctx = TestContext::new(ProxyMode::Translated).await;
    let body = json!({
        "model": "err/429",
        "max_tokens": 64,
        "messages": [{ "role": "user", "content": "hello" }]
    });
    let response = ctx.post("/v1/messages", &body).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let reply = body_json(response).await;
    assert_eq!(reply["error"]["code"], "upstream_http_error");

    let page = ctx.state.store.query(&Default::default());
    assert_eq!(
        page.data[0].status,
        periscope::store::RecordStatus::Error
    );
}

// ---------------------------------------------------------------------------
// Monitoring surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn monitor_endpoints_expose_the_store() {
    let ctx = TestContext::new(ProxyMode::Direct).await;
    for _ in 0..3 {
        let body = json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 10,
            "messages": [{ "role": "user", "content": "hello" }]
        });
        ctx.post("/v1/messages", &body).await;
    }

    let response = ctx.get("/api/monitor/requests?limit=2").await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_json(response).await;
    assert_eq!(page["total"], 3);
    assert_eq!(page["data"].as_array().unwrap().len(), 2);

    let id = page["data"][0]["id"].as_str().unwrap().to_string();
    let response = ctx.get(&format!("/api/monitor/requests/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let record = body_json(response).await;
    assert_eq!(record["id"], id.as_str());
    assert_eq!(record["method"], "POST");

    let response = ctx.get("/api/monitor/requests/req_missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = ctx.get("/api/monitor/stats").await;
    let stats = body_json(response).await;
    assert_eq!(stats["totalRequests"], 3);
    assert_eq!(stats["successCount"], 3);

    let response = ctx.get("/api/monitor/stats?status=error").await;
    let stats = body_json(response).await;
    assert_eq!(stats["totalRequests"], 0);

    let response = ctx.get("/api/monitor/export").await;
    let export = body_json(response).await;
    assert_eq!(export["requests"].as_array().unwrap().len(), 3);

    let response = ctx
        .post("/api/monitor/clear", &json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = ctx.get("/api/monitor/stats").await;
    let stats = body_json(response).await;
    assert_eq!(stats["totalRequests"], 0);
}

#[tokio::test]
async fn monitor_stream_is_server_sent_events() {
    let ctx = TestContext::new(ProxyMode::Direct).await;
    let response = ctx.get("/api/monitor/stream").await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(content_type.starts_with("text/event-stream"));
}

#[tokio::test]
async fn query_filters_are_honored_over_http() {
    let ctx = TestContext::new(ProxyMode::Direct).await;
    ctx.post(
        "/v1/messages",
        &json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 10,
            "messages": [{ "role": "user", "content": "ok" }]
        }),
    )
    .await;
    ctx.post(
        "/v1/messages",
        &json!({
            "model": "claude-3-haiku",
            "force_status": 500,
            "messages": []
        }),
    )
    .await;

    let page = body_json(ctx.get("/api/monitor/requests?status=error").await).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["data"][0]["request"]["body"]["model"], "claude-3-haiku");

    let page = body_json(ctx.get("/api/monitor/requests?model=sonnet").await).await;
    assert_eq!(page["total"], 1);

    let page = body_json(ctx.get("/api/monitor/requests?timeRange=1h").await).await;
    assert_eq!(page["total"], 2);
}
