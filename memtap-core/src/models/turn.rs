use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// How the assistant side of the exchange reached the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnSource {
    Streamed,
    Direct,
}

impl TurnSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnSource::Streamed => "streamed",
            TurnSource::Direct => "direct",
        }
    }
}

/// One complete user+assistant exchange. Immutable once emitted by the
/// interceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: String,
    pub user_id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub source: TurnSource,
    pub model: Option<String>,
}

impl ConversationTurn {
    pub fn new(
        user_id: impl Into<String>,
        messages: Vec<Message>,
        created_at: DateTime<Utc>,
        source: TurnSource,
        model: Option<String>,
    ) -> Self {
        let user_id = user_id.into();
        let turn_id = derive_turn_id(&user_id, &messages, created_at);
        Self {
            turn_id,
            user_id,
            messages,
            created_at,
            source,
            model,
        }
    }

    /// A turn must carry at least one user and one assistant message before
    /// it may be synchronized to the store.
    pub fn is_eligible(&self) -> bool {
        let has_user = self.messages.iter().any(|m| m.role == Role::User);
        let has_assistant = self.messages.iter().any(|m| m.role == Role::Assistant);
        !self.messages.is_empty() && has_user && has_assistant
    }

    /// Content-derived de-duplication key: hash of ordered message contents
    /// plus the user id. Deliberately excludes the timestamp so an upstream
    /// retransmission of the same exchange collides.
    pub fn content_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_bytes());
        for msg in &self.messages {
            hasher.update(msg.role.as_str().as_bytes());
            hasher.update(b"\x1f");
            hasher.update(msg.content.as_bytes());
            hasher.update(b"\x1e");
        }
        hex_prefix(&hasher.finalize(), 16)
    }

    /// Metadata attached to the store record for this turn.
    pub fn metadata(&self) -> serde_json::Value {
        let mut meta = serde_json::json!({
            "source": self.source.as_str(),
            "turn_id": self.turn_id,
        });
        if let Some(model) = &self.model {
            meta["model"] = serde_json::Value::String(model.clone());
        }
        meta
    }
}

/// Stable turn id: hash of user id, ordered message contents and the
/// minute-bucketed timestamp. Re-decoding the same exchange yields the
/// same id.
pub fn derive_turn_id(
    user_id: &str,
    messages: &[Message],
    created_at: DateTime<Utc>,
) -> String {
    let bucket = created_at.timestamp() / 60;
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(bucket.to_le_bytes());
    for msg in messages {
        hasher.update(msg.role.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(msg.content.as_bytes());
        hasher.update(b"\x1e");
    }
    hex_prefix(&hasher.finalize(), 12)
}

fn hex_prefix(digest: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}
