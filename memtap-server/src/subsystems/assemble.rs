//! Per-exchange reassembly of event-stream responses.
//!
//! State machine: `Idle → Accumulating → Complete | Aborted`. The assembler
//! produces the same turn shape as the direct decode path, so downstream
//! consumers never learn whether a response was streamed. Frames arrive in
//! transport order on a single connection; no reordering is handled.

use chrono::{DateTime, Utc};

use memtap_core::models::{ConversationTurn, Message, Role, TurnSource};

use super::decode::FrameEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Terminal marker arrived before any content frame.
    EarlyTerminal,
    /// The connection closed without a terminal marker.
    ConnectionClosed,
    /// Assembled messages did not form an eligible turn.
    IncompleteTurn,
    /// Process shutdown abandoned the in-flight state.
    Shutdown,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::EarlyTerminal => "early_terminal",
            AbortReason::ConnectionClosed => "connection_closed",
            AbortReason::IncompleteTurn => "incomplete_turn",
            AbortReason::Shutdown => "shutdown",
        }
    }
}

/// Record of a discarded stream. Partial content is dropped, never promoted
/// to a turn; only the shape of the loss is reported for logging.
#[derive(Debug, Clone)]
pub struct AssemblyAbort {
    pub connection_id: u64,
    pub reason: AbortReason,
    pub buffered_bytes: usize,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Accumulating,
    Complete,
}

/// Accumulates one in-flight streamed exchange. Owned exclusively by the
/// interceptor for the exchange's lifetime and destroyed on completion or
/// teardown.
#[derive(Debug)]
pub struct StreamAssembler {
    connection_id: u64,
    user_id: String,
    request_messages: Vec<Message>,
    role: Role,
    model: Option<String>,
    fragments: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    phase: Phase,
}

impl StreamAssembler {
    pub fn new(connection_id: u64, user_id: impl Into<String>, request_messages: Vec<Message>) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
            request_messages,
            role: Role::Assistant,
            model: None,
            fragments: Vec::new(),
            started_at: None,
            phase: Phase::Idle,
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.phase == Phase::Accumulating
    }

    fn buffered_bytes(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    fn abort_record(&self, reason: AbortReason) -> AssemblyAbort {
        AssemblyAbort {
            connection_id: self.connection_id,
            reason,
            buffered_bytes: self.buffered_bytes(),
            started_at: self.started_at,
        }
    }

    /// Abandon the in-flight state on teardown or shutdown.
    pub fn abort(&self, reason: AbortReason) -> AssemblyAbort {
        self.abort_record(reason)
    }

    /// Feed one parsed frame. Returns `Ok(Some(turn))` exactly once, on the
    /// terminal marker of a well-formed stream.
    pub fn on_frame(
        &mut self,
        frame: FrameEvent,
    ) -> Result<Option<ConversationTurn>, AssemblyAbort> {
        if self.phase == Phase::Complete {
            // Trailing frames after the terminal marker carry nothing.
            return Ok(None);
        }

        match frame {
            FrameEvent::Ignored => Ok(None),
            FrameEvent::Start { role, model } => {
                if self.phase == Phase::Idle {
                    self.role = role;
                    self.model = model;
                    self.started_at = Some(Utc::now());
                    self.phase = Phase::Accumulating;
                }
                // A duplicate start envelope mid-stream is ignored.
                Ok(None)
            }
            FrameEvent::Delta { text } => {
                if self.phase == Phase::Idle {
                    self.started_at = Some(Utc::now());
                    self.phase = Phase::Accumulating;
                }
                if !text.is_empty() {
                    self.fragments.push(text);
                }
                Ok(None)
            }
            FrameEvent::Terminal => self.complete(),
        }
    }

    fn complete(&mut self) -> Result<Option<ConversationTurn>, AssemblyAbort> {
        let content: String = self.fragments.concat();
        if self.phase == Phase::Idle || content.is_empty() {
            return Err(self.abort_record(AbortReason::EarlyTerminal));
        }

        let mut messages = self.request_messages.clone();
        messages.push(Message::new(self.role, content));

        let turn = ConversationTurn::new(
            self.user_id.clone(),
            messages,
            Utc::now(),
            TurnSource::Streamed,
            self.model.clone(),
        );
        if !turn.is_eligible() {
            return Err(self.abort_record(AbortReason::IncompleteTurn));
        }

        self.phase = Phase::Complete;
        self.fragments.clear();
        Ok(Some(turn))
    }
}
