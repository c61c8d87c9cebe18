use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::turn::{Message, Role};

/// A memory as the external store represents it after persistence.
/// `id` is assigned by the store and treated as opaque; ordering is never
/// inferred from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    #[serde(rename = "memory")]
    pub content: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn kind(&self) -> Option<&str> {
        self.metadata.get("kind").and_then(|v| v.as_str())
    }

    pub fn is_reflection(&self) -> bool {
        self.kind() == Some("reflection")
    }
}

/// Which accumulated threshold fired a reflection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    TurnCount,
    ErrorCount,
    ActionCount,
    Manual,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::TurnCount => "turn_count",
            TriggerReason::ErrorCount => "error_count",
            TriggerReason::ActionCount => "action_count",
            TriggerReason::Manual => "manual",
        }
    }
}

/// A derived insight produced by a reflection pass. Append-only: insights
/// are never mutated after submission, and `evidence_turn_ids` only names
/// records that were part of the analyzed window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRecord {
    pub user_id: String,
    pub pattern_summary: String,
    pub evidence_turn_ids: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub trigger_reason: TriggerReason,
}

impl InsightRecord {
    /// Insight content goes through the same submit path as a turn, so it is
    /// rendered as a message pair.
    pub fn to_messages(&self) -> Vec<Message> {
        vec![
            Message::new(Role::System, "Reflection analysis"),
            Message::new(Role::Assistant, self.pattern_summary.clone()),
        ]
    }

    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "reflection",
            "evidence_turn_ids": self.evidence_turn_ids,
            "generated_at": self.generated_at.to_rfc3339(),
            "trigger_reason": self.trigger_reason.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_kind_reads_metadata() {
        let record = MemoryRecord {
            id: "m1".to_string(),
            content: "summary".to_string(),
            user_id: Some("u1".to_string()),
            metadata: serde_json::json!({"kind": "reflection"}),
            created_at: Utc::now(),
        };
        assert!(record.is_reflection());

        let plain = MemoryRecord {
            metadata: serde_json::json!({}),
            ..record
        };
        assert!(!plain.is_reflection());
    }

    #[test]
    fn insight_metadata_is_tagged_as_reflection() {
        let insight = InsightRecord {
            user_id: "u1".to_string(),
            pattern_summary: "## Analysis".to_string(),
            evidence_turn_ids: vec!["t1".to_string(), "t2".to_string()],
            generated_at: Utc::now(),
            trigger_reason: TriggerReason::TurnCount,
        };
        let meta = insight.metadata();
        assert_eq!(meta["kind"], "reflection");
        assert_eq!(meta["trigger_reason"], "turn_count");
        assert_eq!(meta["evidence_turn_ids"], serde_json::json!(["t1", "t2"]));

        let messages = insight.to_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
    }
}
