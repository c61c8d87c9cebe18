//! Wire decoding from raw exchange bytes to structured turns.
//!
//! Stateless and free of I/O: the interceptor hands it a captured
//! request/response byte pair (or one SSE payload at a time) and gets back
//! either a `ConversationTurn`, a `FrameEvent`, or a `DecodeError`. The
//! exchange already completed on the wire by the time decoding runs, so a
//! failure here only means the exchange is dropped and logged.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use memtap_core::models::{ConversationTurn, Message, Role, TurnSource};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed request body: {0}")]
    Request(String),

    #[error("malformed response body: {0}")]
    Response(String),

    #[error("malformed stream frame: {0}")]
    Frame(String),

    #[error("exchange produced no eligible turn")]
    IncompleteTurn,
}

/// One parsed SSE `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// First envelope of a streamed response; carries role and model.
    Start { role: Role, model: Option<String> },
    /// Incremental text delta.
    Delta { text: String },
    /// Distinguished terminal frame.
    Terminal,
    /// Ancillary envelope (ping, block boundaries) with no content.
    Ignored,
}

/// Decode a complete (non-streamed) exchange into one turn.
///
/// Deterministic for a fixed `observed_at`: decoding the same byte pair
/// twice yields identical turns.
pub fn decode_direct(
    request_body: &[u8],
    response_body: &[u8],
    user_id: &str,
    observed_at: DateTime<Utc>,
) -> Result<ConversationTurn, DecodeError> {
    let mut messages = request_messages(request_body)?;

    let response: Value = serde_json::from_slice(response_body)
        .map_err(|e| DecodeError::Response(e.to_string()))?;

    let model = response
        .get("model")
        .and_then(|v| v.as_str())
        .map(String::from);

    let assistant_content = content_text(response.get("content").unwrap_or(&Value::Null));
    if assistant_content.is_empty() {
        return Err(DecodeError::IncompleteTurn);
    }
    messages.push(Message::new(Role::Assistant, assistant_content));

    let turn = ConversationTurn::new(user_id, messages, observed_at, TurnSource::Direct, model);
    if !turn.is_eligible() {
        return Err(DecodeError::IncompleteTurn);
    }
    Ok(turn)
}

/// The request-side half of an exchange: the ordered user/system messages.
/// Assistant entries in the request history are skipped; they were already
/// captured when their own exchange completed.
pub fn request_messages(request_body: &[u8]) -> Result<Vec<Message>, DecodeError> {
    let request: Value = serde_json::from_slice(request_body)
        .map_err(|e| DecodeError::Request(e.to_string()))?;

    let entries = request
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| DecodeError::Request("missing 'messages' array".to_string()))?;

    let mut messages = Vec::new();
    for entry in entries {
        let role = match entry.get("role").and_then(|v| v.as_str()) {
            Some("user") => Role::User,
            Some("system") => Role::System,
            _ => continue,
        };
        let content = content_text(entry.get("content").unwrap_or(&Value::Null));
        if content.is_empty() {
            continue;
        }
        messages.push(Message::new(role, content));
    }
    Ok(messages)
}

/// Parse one SSE `data:` payload into a frame event.
pub fn parse_frame(payload: &str) -> Result<FrameEvent, DecodeError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(FrameEvent::Ignored);
    }
    if payload == "[DONE]" {
        return Ok(FrameEvent::Terminal);
    }

    let envelope: Value =
        serde_json::from_str(payload).map_err(|e| DecodeError::Frame(e.to_string()))?;

    match envelope.get("type").and_then(|v| v.as_str()) {
        Some("message_start") => {
            let message = envelope.get("message").unwrap_or(&Value::Null);
            let role = match message.get("role").and_then(|v| v.as_str()) {
                Some("user") => Role::User,
                Some("system") => Role::System,
                _ => Role::Assistant,
            };
            let model = message
                .get("model")
                .and_then(|v| v.as_str())
                .map(String::from);
            Ok(FrameEvent::Start { role, model })
        }
        Some("content_block_delta") => {
            let text = envelope
                .pointer("/delta/text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Ok(FrameEvent::Delta { text })
        }
        Some("message_stop") => Ok(FrameEvent::Terminal),
        Some(_) => Ok(FrameEvent::Ignored),
        None => Err(DecodeError::Frame("envelope missing 'type'".to_string())),
    }
}

/// Split one raw SSE chunk into its `data:` payloads, in order. A single
/// network chunk may carry several events.
pub fn sse_data_payloads(chunk: &str) -> Vec<String> {
    chunk
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|payload| payload.trim().to_string())
        .filter(|payload| !payload.is_empty())
        .collect()
}

/// Content may be a bare string or an array of typed blocks; only text
/// blocks contribute.
fn content_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}
