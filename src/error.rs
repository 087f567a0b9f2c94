use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message,
        )
        .with_type("api_error")
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Scrub the message of key material and host paths before it can reach a
    /// client. Applied at the response boundary, not at construction, so logs
    /// keep the full text.
    pub fn sanitized(mut self) -> Self {
        self.message = sanitize_message(&self.message);
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: sanitize_message(&self.message),
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

const SANITIZED_MAX_LEN: usize = 200;

fn api_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"sk-[A-Za-z0-9_\-]{20,}").expect("api key regex"))
}

fn bearer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Bearer\s+[A-Za-z0-9_\-]{20,}").expect("bearer regex"))
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:/[A-Za-z0-9._\-]+){2,}").expect("path regex"))
}

/// Remove API-key-like and bearer-token-like substrings, filesystem paths,
/// and truncate to a bounded length.
pub fn sanitize_message(message: &str) -> String {
    let out = api_key_re().replace_all(message, "[redacted]");
    let out = bearer_re().replace_all(&out, "[redacted]");
    let out = path_re().replace_all(&out, "[path]");
    let mut out = out.into_owned();
    if out.chars().count() > SANITIZED_MAX_LEN {
        out = out.chars().take(SANITIZED_MAX_LEN).collect();
    }
    out
}
