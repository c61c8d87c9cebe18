//! Reflection engine: periodic pattern analysis over accumulated turns.
//!
//! Runs as its own task, never inline on the interception hot path. Trigger
//! counters (turns, error patterns, tool/action mentions) are owned solely
//! by this engine; the sync loop only notifies it of durably submitted
//! turns. A pass fetches a recency window plus semantically relevant
//! records from the store, buckets recurring topics, matches repeated error
//! signatures against previously stored insights, and submits the result
//! through the same submit/retry contract every turn uses. Counters reset
//! only after the insight is durably acknowledged.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use memtap_core::config::ReflectionConfig;
use memtap_core::models::{ConversationTurn, InsightRecord, MemoryRecord, TriggerReason};
use memtap_core::store::{MemoryStore, StoreError};

use super::sync::SyncHandle;

/// How many recent message snippets feed the relevance query.
const QUERY_SNIPPETS: usize = 5;
/// Characters kept per snippet when synthesizing the search query.
const SNIPPET_CHARS: usize = 100;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("store fetch failed: {0}")]
    Fetch(StoreError),

    #[error("no records available for analysis")]
    EmptyWindow,

    #[error("insight submission failed: {0}")]
    Submit(StoreError),
}

#[derive(Debug)]
pub enum ReflectionEvent {
    /// A turn reached the store; counters may advance.
    TurnSubmitted(ConversationTurn),
    /// Manual pass requested through the IPC façade.
    Trigger {
        user_id: String,
        ack: oneshot::Sender<Result<String, String>>,
    },
}

#[derive(Clone)]
pub struct ReflectionHandle {
    tx: mpsc::Sender<ReflectionEvent>,
}

impl ReflectionHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ReflectionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Fire-and-forget notification from the sync loop. Dropping under
    /// backpressure is acceptable; the next turn advances the counters.
    pub fn notify_turn(&self, turn: ConversationTurn) {
        if let Err(e) = self.tx.try_send(ReflectionEvent::TurnSubmitted(turn)) {
            tracing::debug!(error = %e, "reflection notification dropped");
        }
    }

    pub async fn trigger(&self, user_id: String) -> Result<String, String> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(ReflectionEvent::Trigger { user_id, ack })
            .await
            .map_err(|_| "reflection engine unavailable".to_string())?;
        rx.await
            .map_err(|_| "reflection engine unavailable".to_string())?
    }
}

#[derive(Debug, Default)]
struct UserState {
    turns: u32,
    errors: u32,
    actions: u32,
    recent_content: VecDeque<String>,
}

impl UserState {
    fn reset(&mut self) {
        self.turns = 0;
        self.errors = 0;
        self.actions = 0;
        self.recent_content.clear();
    }
}

pub struct ReflectionEngine {
    store: Arc<dyn MemoryStore>,
    sync: SyncHandle,
    config: ReflectionConfig,
    users: HashMap<String, UserState>,
    error_re: Option<Regex>,
    action_re: Option<Regex>,
    digits_re: Option<Regex>,
}

fn pattern_matches(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().map_or(false, |re| re.is_match(text))
}

impl ReflectionEngine {
    pub fn new(store: Arc<dyn MemoryStore>, sync: SyncHandle, config: ReflectionConfig) -> Self {
        Self {
            store,
            sync,
            config,
            users: HashMap::new(),
            error_re: Regex::new(r"(?i)\b(error|failed|failure|exception|panic|traceback)\b").ok(),
            action_re: Regex::new(r"(?i)\b(tool_use|tool_result|command|script|deploy|execute)\b")
                .ok(),
            digits_re: Regex::new(r"\d+").ok(),
        }
    }

    /// Advance counters for one submitted turn and report a crossed
    /// threshold, if any. Turn count takes precedence when several cross
    /// at once.
    pub fn note_turn(&mut self, turn: &ConversationTurn) -> Option<TriggerReason> {
        let state = self.users.entry(turn.user_id.clone()).or_default();
        state.turns += 1;
        for msg in &turn.messages {
            if pattern_matches(&self.error_re, &msg.content) {
                state.errors += 1;
            }
            if pattern_matches(&self.action_re, &msg.content) {
                state.actions += 1;
            }
            let snippet: String = msg.content.chars().take(SNIPPET_CHARS).collect();
            state.recent_content.push_back(snippet);
            while state.recent_content.len() > QUERY_SNIPPETS {
                state.recent_content.pop_front();
            }
        }

        if state.turns >= self.config.turn_threshold {
            Some(TriggerReason::TurnCount)
        } else if state.errors >= self.config.error_threshold {
            Some(TriggerReason::ErrorCount)
        } else if state.actions >= self.config.action_threshold {
            Some(TriggerReason::ActionCount)
        } else {
            None
        }
    }

    #[cfg(test)]
    fn counters(&self, user_id: &str) -> (u32, u32, u32) {
        self.users
            .get(user_id)
            .map(|s| (s.turns, s.errors, s.actions))
            .unwrap_or((0, 0, 0))
    }

    /// One full analysis pass. Fetch failure or submission failure aborts
    /// the pass with counters untouched, so the next trigger retries over
    /// at least the same accumulated evidence.
    pub async fn run_pass(
        &mut self,
        user_id: &str,
        reason: TriggerReason,
    ) -> Result<String, AnalysisError> {
        let query = self.synthesize_query(user_id);

        let mut records = self
            .store
            .list(user_id)
            .await
            .map_err(AnalysisError::Fetch)?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let mut window: Vec<MemoryRecord> =
            records.into_iter().take(self.config.recency_window).collect();

        let relevant = self
            .store
            .search(&query, user_id, self.config.relevance_window as u32)
            .await
            .map_err(AnalysisError::Fetch)?;

        // Recency wins on id conflict: recent records were inserted first.
        let mut seen: HashSet<String> = window.iter().map(|r| r.id.clone()).collect();
        for record in relevant {
            if seen.insert(record.id.clone()) {
                window.push(record);
            }
        }

        if window.is_empty() {
            return Err(AnalysisError::EmptyWindow);
        }

        let (pattern_summary, evidence_turn_ids) = self.analyze(&window, reason);
        let insight = InsightRecord {
            user_id: user_id.to_string(),
            pattern_summary,
            evidence_turn_ids,
            generated_at: Utc::now(),
            trigger_reason: reason,
        };

        let memory_id = self
            .sync
            .submit_insight(insight)
            .await
            .map_err(AnalysisError::Submit)?;

        if let Some(state) = self.users.get_mut(user_id) {
            state.reset();
        }
        Ok(memory_id)
    }

    fn synthesize_query(&self, user_id: &str) -> String {
        let joined = self
            .users
            .get(user_id)
            .map(|s| {
                s.recent_content
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        if joined.trim().is_empty() {
            "recent conversation topics".to_string()
        } else {
            joined
        }
    }

    /// Keyword/category bucketing over the fetched window. Always yields at
    /// least the dominant-focus section, so a non-empty window produces a
    /// non-empty summary.
    fn analyze(&self, window: &[MemoryRecord], reason: TriggerReason) -> (String, Vec<String>) {
        const BUCKETS: &[(&str, &[&str])] = &[
            (
                "coding",
                &["function", "class", "implement", "code", "debug", "compile", "borrow"],
            ),
            (
                "infrastructure",
                &["docker", "deploy", "server", "database", "config", "network"],
            ),
            (
                "troubleshooting",
                &["error", "failed", "exception", "panic", "bug", "fix"],
            ),
            (
                "learning",
                &["how", "what", "why", "explain", "understand"],
            ),
        ];

        let conversations: Vec<&MemoryRecord> =
            window.iter().filter(|r| !r.is_reflection()).collect();
        let prior_insights: Vec<&MemoryRecord> =
            window.iter().filter(|r| r.is_reflection()).collect();

        let mut topic_counts: HashMap<&str, usize> = HashMap::new();
        let mut questions: Vec<&str> = Vec::new();
        let mut error_signatures: HashMap<String, usize> = HashMap::new();

        for record in &conversations {
            let lower = record.content.to_lowercase();
            for (topic, keywords) in BUCKETS {
                if keywords.iter().any(|k| lower.contains(k)) {
                    *topic_counts.entry(topic).or_insert(0) += 1;
                }
            }
            if record.content.contains('?') {
                questions.push(record.content.as_str());
            }
            if pattern_matches(&self.error_re, &record.content) {
                let signature = self.error_signature(&record.content);
                *error_signatures.entry(signature).or_insert(0) += 1;
            }
        }

        let dominant = topic_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(topic, count)| (*topic, *count))
            .unwrap_or(("general", conversations.len()));

        let mut summary = String::from("## Conversation Analysis\n\n");
        summary.push_str(&format!(
            "Trigger: {} over {} analyzed records.\n\n",
            reason.as_str(),
            window.len()
        ));
        summary.push_str(&format!(
            "### Focus Area\nPrimary focus appears to be {} ({} of {} conversations).\n\n",
            dominant.0,
            dominant.1,
            conversations.len()
        ));

        if questions.len() > 3 {
            summary.push_str(&format!(
                "### Frequent Questions\n{} questions asked in the analyzed window. Recent examples:\n",
                questions.len()
            ));
            for q in questions.iter().rev().take(3) {
                let snippet: String = q.chars().take(SNIPPET_CHARS).collect();
                summary.push_str(&format!("- {}\n", snippet));
            }
            summary.push('\n');
        }

        let repeated: Vec<(&String, &usize)> = error_signatures
            .iter()
            .filter(|(_, count)| **count > 1)
            .collect();
        if !repeated.is_empty() {
            summary.push_str("### Repeated Errors\n");
            for (signature, count) in &repeated {
                let known = prior_insights
                    .iter()
                    .any(|r| r.content.to_lowercase().contains(signature.as_str()));
                if known {
                    summary.push_str(&format!(
                        "- `{}` seen {} times; a prior insight already covers it\n",
                        signature, count
                    ));
                } else {
                    summary.push_str(&format!(
                        "- `{}` seen {} times; consider documenting a resolution\n",
                        signature, count
                    ));
                }
            }
            summary.push('\n');
        }

        // Evidence only names records that were part of the analyzed window.
        let evidence = window
            .iter()
            .map(|r| {
                r.metadata
                    .get("turn_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&r.id)
                    .to_string()
            })
            .collect();

        (summary, evidence)
    }

    /// Normalized error signature: lowercased, digits collapsed, truncated.
    fn error_signature(&self, content: &str) -> String {
        let line = content
            .lines()
            .find(|l| pattern_matches(&self.error_re, l))
            .unwrap_or(content);
        let lowered = line.to_lowercase();
        let collapsed = match &self.digits_re {
            Some(re) => re.replace_all(&lowered, "#").into_owned(),
            None => lowered,
        };
        collapsed.chars().take(80).collect()
    }
}

/// Drives the engine from submitted-turn notifications and manual triggers.
pub async fn run_reflection_loop(
    mut engine: ReflectionEngine,
    mut rx: mpsc::Receiver<ReflectionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(
        turn_threshold = engine.config.turn_threshold,
        error_threshold = engine.config.error_threshold,
        action_threshold = engine.config.action_threshold,
        "Reflection loop started"
    );

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                None => break,
                Some(ReflectionEvent::TurnSubmitted(turn)) => {
                    let user_id = turn.user_id.clone();
                    if let Some(reason) = engine.note_turn(&turn) {
                        match engine.run_pass(&user_id, reason).await {
                            Ok(memory_id) => tracing::info!(
                                user_id = %user_id,
                                memory_id = %memory_id,
                                reason = reason.as_str(),
                                "Reflection insight submitted"
                            ),
                            Err(e) => tracing::warn!(
                                user_id = %user_id,
                                error = %e,
                                "Reflection pass aborted; counters preserved"
                            ),
                        }
                    }
                }
                Some(ReflectionEvent::Trigger { user_id, ack }) => {
                    let result = engine
                        .run_pass(&user_id, TriggerReason::Manual)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = ack.send(result);
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("Reflection loop shutting down");
                break;
            }
        }
    }
}
