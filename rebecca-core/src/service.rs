use std::sync::Arc;

use crate::config::ChatConfig;
use crate::context::ContextAssembler;
use crate::error::ChatError;
use crate::llm::ChatBackend;
use crate::relay::{RelayStream, StreamRelay};
use crate::store::{ConversationStore, UserStore};

/// One chat exchange for an already-resolved user: assemble, then relay.
#[derive(Clone)]
pub struct ChatService {
    assembler: ContextAssembler,
    relay: StreamRelay,
}

impl ChatService {
    pub fn new(assembler: ContextAssembler, relay: StreamRelay) -> Self {
        Self { assembler, relay }
    }

    pub fn from_parts(
        config: &ChatConfig,
        users: Arc<dyn UserStore>,
        turns: Arc<dyn ConversationStore>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            assembler: ContextAssembler::from_config(config, users, turns.clone()),
            relay: StreamRelay::new(backend, turns),
        }
    }

    /// Everything that can fail before the first event fails here.
    pub async fn start(&self, user_id: i64, user_input: &str) -> Result<RelayStream, ChatError> {
        if user_input.trim().is_empty() {
            return Err(ChatError::InvalidInput("user_input must not be empty".to_string()));
        }

        let context = self.assembler.build(user_id, user_input).await?;
        self.relay
            .start(user_id, context, user_input.to_string())
            .await
    }
}
