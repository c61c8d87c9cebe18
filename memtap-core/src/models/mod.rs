pub mod record;
pub mod turn;

pub use record::{InsightRecord, MemoryRecord, TriggerReason};
pub use turn::{ConversationTurn, Message, Role, TurnSource};
