use serde::{Deserialize, Serialize};

use crate::models::Message;

/// One observation from the proxy host at the interception boundary.
/// Delivered as 4-byte Little Endian length prefix + MessagePack payload,
/// one frame per event, over the boundary TCP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExchangeEvent {
    /// Request side of an exchange completed. `connection_id` identifies the
    /// proxied exchange for all subsequent events.
    RequestCaptured {
        connection_id: u64,
        host: String,
        path: String,
        body: Vec<u8>,
    },
    /// The response arrived as a single complete body.
    ResponseComplete {
        connection_id: u64,
        content_type: String,
        body: Vec<u8>,
    },
    /// One incremental chunk of an event-stream response.
    ResponseFrame {
        connection_id: u64,
        payload: Vec<u8>,
    },
    /// The proxied connection closed. In-flight assembly is abandoned.
    StreamClosed { connection_id: u64 },
}

/// Requests accepted by the IPC façade.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MemtapRequest {
    Ping,
    Health,
    Add {
        messages: Vec<Message>,
        user_id: Option<String>,
        metadata: Option<serde_json::Value>,
    },
    Search {
        query: String,
        user_id: Option<String>,
        limit: Option<u32>,
    },
    List {
        user_id: Option<String>,
    },
    Delete {
        memory_id: String,
    },
    DeleteAll {
        user_id: Option<String>,
    },
    Reflect {
        user_id: Option<String>,
        reason: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MemtapResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl MemtapResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_event_roundtrips_through_messagepack() {
        let event = ExchangeEvent::RequestCaptured {
            connection_id: 7,
            host: "api.example.com".to_string(),
            path: "/v1/chat".to_string(),
            body: b"{\"messages\":[]}".to_vec(),
        };
        let bytes = rmp_serde::to_vec_named(&event).unwrap();
        let back: ExchangeEvent = rmp_serde::from_slice(&bytes).unwrap();
        match back {
            ExchangeEvent::RequestCaptured {
                connection_id,
                host,
                ..
            } => {
                assert_eq!(connection_id, 7);
                assert_eq!(host, "api.example.com");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn request_tag_matches_wire_contract() {
        let req = MemtapRequest::Search {
            query: "lifetimes".to_string(),
            user_id: None,
            limit: Some(5),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["action"], "search");
        assert_eq!(value["query"], "lifetimes");
    }
}
