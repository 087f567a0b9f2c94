use crate::error::AppError;
use axum::http::{HeaderMap, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Inbound headers relayed to the Anthropic upstream in direct mode; nothing
/// else crosses.
const FORWARDED_HEADERS: &[&str] = &[
    "x-api-key",
    "authorization",
    "anthropic-version",
    "anthropic-beta",
    "user-agent",
];

pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn to_app(&self) -> AppError {
        let (status, code) = match self.kind {
            UpstreamErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            UpstreamErrorKind::Network => (StatusCode::BAD_GATEWAY, "upstream_network_error"),
            UpstreamErrorKind::Http => (
                self.status.unwrap_or(StatusCode::BAD_GATEWAY),
                "upstream_http_error",
            ),
        };
        AppError::new(status, code, self.message.clone()).with_type("api_error")
    }
}

fn classify_send_error(err: reqwest::Error) -> UpstreamError {
    let kind = if err.is_timeout() {
        UpstreamErrorKind::Timeout
    } else {
        UpstreamErrorKind::Network
    };
    UpstreamError::new(kind, None, err.to_string())
}

/// POST a body to the Anthropic upstream, relaying the selected inbound
/// headers. Returns the response whatever its status; direct mode passes
/// upstream failures through to the client.
pub async fn post_anthropic(
    client: &reqwest::Client,
    base: &str,
    path: &str,
    inbound: &HeaderMap,
    body: &Value,
    timeout: Option<Duration>,
) -> Result<reqwest::Response, UpstreamError> {
    let url = endpoint_url(base, path);
    let mut req = client.post(url).json(body);
    if let Some(timeout) = timeout {
        req = req.timeout(timeout);
    }
    for name in FORWARDED_HEADERS {
        if let Some(value) = inbound.get(*name).and_then(|v| v.to_str().ok()) {
            req = req.header(*name, value);
        }
    }
    if !inbound.contains_key("anthropic-version") {
        req = req.header("anthropic-version", DEFAULT_ANTHROPIC_VERSION);
    }
    req.send().await.map_err(classify_send_error)
}

/// POST a chat-completions body to the translated upstream. The bearer key
/// is taken fresh from the environment by the caller on every request. A
/// non-2xx status is an error here; translated mode never relays foreign
/// error bodies verbatim.
pub async fn post_openrouter(
    client: &reqwest::Client,
    base: &str,
    api_key: &str,
    body: &Value,
    timeout: Option<Duration>,
) -> Result<reqwest::Response, UpstreamError> {
    let url = endpoint_url(base, "/v1/chat/completions");
    let mut req = client.post(url).bearer_auth(api_key).json(body);
    if let Some(timeout) = timeout {
        req = req.timeout(timeout);
    }
    let resp = req.send().await.map_err(classify_send_error)?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = upstream_error_code(&text);
        return Err(UpstreamError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

/// Join a configured base URL with an endpoint path. Users paste bases both
/// with and without the `/v1` segment; a duplicated segment is collapsed so
/// either form reaches the same endpoint.
pub fn endpoint_url(base: &str, endpoint: &str) -> String {
    let root = base.trim_end_matches('/');
    let mut tail = endpoint.trim_start_matches('/');
    if root.ends_with("/v1") {
        match tail.strip_prefix("v1") {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                tail = rest.trim_start_matches('/');
            }
            _ => {}
        }
    }
    if tail.is_empty() {
        root.to_string()
    } else {
        format!("{root}/{tail}")
    }
}

/// Pull the machine-readable code out of an upstream error body, when the
/// body is JSON of the usual `{"error":{"code":...}}` shape.
fn upstream_error_code(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    match parsed.get("error")?.get("code")? {
        Value::String(code) => Some(code.clone()),
        _ => None,
    }
}
