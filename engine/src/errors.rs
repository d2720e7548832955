//! Formatting of stream errors into user-facing message bodies.
//!
//! Provider errors arrive as raw strings, often wrapping a JSON error body
//! from the API. These helpers pull out the human-readable part so the
//! synthetic assistant message shows something better than a JSON blob.

use serde_json::Value;

use tether_types::truncate_with_ellipsis;

const STREAM_ERROR_BADGE: &str = "[Stream error]";

const MAX_DETAIL_CHARS: usize = 200;

/// Split a `"API error <status>: <body>"` string into status and body.
#[must_use]
pub fn split_api_error(raw: &str) -> Option<(String, String)> {
    let rest = raw.strip_prefix("API error ")?;
    let (status, body) = rest.split_once(": ")?;
    Some((status.trim().to_string(), body.trim().to_string()))
}

/// Extract the human-readable message from an API error payload.
pub fn extract_error_message(raw: &str) -> Option<String> {
    let body = split_api_error(raw).map_or_else(|| raw.trim().to_string(), |(_, body)| body);
    let payload: Value = serde_json::from_str(&body).ok()?;
    payload
        .pointer("/error/message")
        .and_then(Value::as_str)
        .or_else(|| payload.pointer("/message").and_then(Value::as_str))
        .or_else(|| payload.as_str())
        .map(ToString::to_string)
}

/// Format a stream error into the body of the synthetic assistant message.
#[must_use]
pub fn format_stream_error(model: &str, err: &str) -> String {
    let trimmed = err.trim();
    let (status, body) =
        split_api_error(trimmed).unwrap_or_else(|| (String::new(), trimmed.to_string()));
    let extracted = extract_error_message(&body).unwrap_or(body);

    let detail = if extracted.trim().is_empty() {
        "unknown error".to_string()
    } else {
        extracted.trim().to_string()
    };
    let detail = truncate_with_ellipsis(&detail, MAX_DETAIL_CHARS);

    let mut content = String::new();
    content.push_str(STREAM_ERROR_BADGE);
    content.push_str("\n\n");
    if status.is_empty() {
        content.push_str(&format!("Request to {model} failed."));
    } else {
        content.push_str(&format!("Request to {model} failed ({status})."));
    }
    content.push_str("\n\nDetails: ");
    content.push_str(&detail);
    content
}
