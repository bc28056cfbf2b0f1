pub mod auth;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod llm;
pub mod memory;
pub mod models;
pub mod relay;
pub mod service;
pub mod store;

pub use auth::SessionGate;
pub use config::RebeccaConfig;
pub use context::ContextAssembler;
pub use error::{ChatError, RebeccaError};
pub use llm::{BackendError, ChatBackend, ChatMessage, Chunk, ChunkStream, OllamaChatClient, Role};
pub use memory::MemoryStore;
pub use relay::{RelayEvent, RelayState, RelayStream, StreamRelay, StreamSession};
pub use service::ChatService;
pub use store::{ConversationStore, PgStore, StoreError, UserStore};
