pub mod request;
pub mod response;
pub mod stream;

/// Map an OpenAI-style `finish_reason` onto the native `stop_reason`
/// vocabulary. Unknown values land on `end_turn`.
pub fn map_stop_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("stop") => "end_turn",
        Some("length") => "max_tokens",
        Some("tool_calls") | Some("function_call") => "tool_use",
        Some("content_filter") | Some("safety") => "stop_sequence",
        Some(other) => {
            tracing::warn!("unknown finish_reason {other:?}, defaulting to end_turn");
            "end_turn"
        }
        None => "end_turn",
    }
}

/// Whitespace-group count, used only when the upstream omits usage. This has
/// no relationship to true tokenizer counts; callers that care pass the
/// upstream-reported value instead.
pub fn approx_token_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}
