// src/lib.rs

pub mod api;
pub mod archive;
pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;
pub mod models;
pub mod session;
pub mod storage;
pub mod store;
pub mod transport;

pub use api::{ChatCompletionRequest, ChatMessage, CompletionClient, CompletionSource};
pub use errors::{ChatError, ChatResult};
pub use models::{ChatConfig, Conversation, ConversationMap, Message, Role};
pub use session::{ChatSession, CheckpointPolicy, TurnEvent, TurnOutcome, TurnState, TurnStatus};
pub use store::ConversationStore;
