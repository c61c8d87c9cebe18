pub mod config;
pub mod error;
pub mod ipc;
pub mod models;
pub mod store;

pub use config::MemtapConfig;
pub use error::MemtapError;
pub use models::{ConversationTurn, InsightRecord, MemoryRecord, Message, Role, TurnSource};
pub use store::{DeleteOutcome, HttpMemoryStoreClient, MemoryStore, RetryPolicy, StoreError};
