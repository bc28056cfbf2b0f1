//! Conversation context assembly.
//!
//! Builds the message list for one request: persona, then the user's most
//! recent turns in chronological order as user/assistant pairs, then the new
//! input. Read-only.

use std::sync::Arc;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::llm::ChatMessage;
use crate::models::Turn;
use crate::store::{ConversationStore, UserStore};

/// Expand turns fetched most-recent-first into the ordered context.
pub fn expand_history(persona_text: &str, recent_first: Vec<Turn>, new_input: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(recent_first.len() * 2 + 2);
    messages.push(ChatMessage::system(persona_text));

    for turn in recent_first.into_iter().rev() {
        messages.push(ChatMessage::user(turn.prompt));
        messages.push(ChatMessage::assistant(turn.response));
    }

    messages.push(ChatMessage::user(new_input));
    messages
}

pub async fn assemble(
    users: &dyn UserStore,
    turns: &dyn ConversationStore,
    user_id: i64,
    persona_text: &str,
    new_input: &str,
    history_limit: u32,
) -> Result<Vec<ChatMessage>, ChatError> {
    let user = users
        .find_by_id(user_id)
        .await
        .map_err(|e| ChatError::StorageUnavailable(e.to_string()))?;
    if user.is_none() {
        tracing::warn!(user_id, "Context requested for unknown user");
        return Err(ChatError::UserNotFound);
    }

    let recent = if history_limit == 0 {
        Vec::new()
    } else {
        turns
            .fetch_recent(user_id, history_limit)
            .await
            .map_err(|e| ChatError::StorageUnavailable(e.to_string()))?
    };

    tracing::debug!(user_id, history = recent.len(), "Assembled conversation context");
    Ok(expand_history(persona_text, recent, new_input))
}

/// `assemble` bound to the configured persona and history window.
#[derive(Clone)]
pub struct ContextAssembler {
    users: Arc<dyn UserStore>,
    turns: Arc<dyn ConversationStore>,
    persona: String,
    history_limit: u32,
}

impl ContextAssembler {
    pub fn new(
        users: Arc<dyn UserStore>,
        turns: Arc<dyn ConversationStore>,
        persona: impl Into<String>,
        history_limit: u32,
    ) -> Self {
        Self {
            users,
            turns,
            persona: persona.into(),
            history_limit,
        }
    }

    pub fn from_config(
        config: &ChatConfig,
        users: Arc<dyn UserStore>,
        turns: Arc<dyn ConversationStore>,
    ) -> Self {
        Self::new(users, turns, config.persona.clone(), config.history_limit)
    }

    pub async fn build(&self, user_id: i64, new_input: &str) -> Result<Vec<ChatMessage>, ChatError> {
        assemble(
            self.users.as_ref(),
            self.turns.as_ref(),
            user_id,
            &self.persona,
            new_input,
            self.history_limit,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::memory::MemoryStore;
    use crate::store::StoreError;

    async fn seeded(turns: &[(&str, &str)]) -> (Arc<MemoryStore>, i64) {
        let store = Arc::new(MemoryStore::new());
        let user = store.create_user("ada", "hash").await.unwrap();
        for (prompt, response) in turns {
            store.append(user.id, prompt, response, None).await.unwrap();
        }
        (store, user.id)
    }

    fn pairs(messages: &[ChatMessage]) -> Vec<(Role, &str)> {
        messages.iter().map(|m| (m.role, m.content.as_str())).collect()
    }

    #[tokio::test]
    async fn history_is_chronological_and_paired() {
        let (store, user_id) = seeded(&[("q1", "a1."), ("q2", "a2.")]).await;
        let messages = assemble(store.as_ref(), store.as_ref(), user_id, "persona", "q3", 10)
            .await
            .unwrap();

        assert_eq!(
            pairs(&messages),
            vec![
                (Role::System, "persona"),
                (Role::User, "q1"),
                (Role::Assistant, "a1."),
                (Role::User, "q2"),
                (Role::Assistant, "a2."),
                (Role::User, "q3"),
            ]
        );
    }

    #[tokio::test]
    async fn history_limit_keeps_most_recent_turns_oldest_first() {
        let (store, user_id) = seeded(&[("q1", "a1."), ("q2", "a2."), ("q3", "a3.")]).await;
        let messages = assemble(store.as_ref(), store.as_ref(), user_id, "p", "new", 2)
            .await
            .unwrap();

        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["p", "q2", "a2.", "q3", "a3.", "new"]);
    }

    #[tokio::test]
    async fn zero_limit_skips_history_fetch() {
        let (store, user_id) = seeded(&[("q1", "a1.")]).await;
        let reads_before = store.reads();
        let messages = assemble(store.as_ref(), store.as_ref(), user_id, "p", "new", 0)
            .await
            .unwrap();

        assert_eq!(messages.len(), 2);
        // Only the user lookup.
        assert_eq!(store.reads(), reads_before + 1);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let store = MemoryStore::new();
        let result = assemble(&store, &store, 99, "p", "hi", 5).await;
        assert_eq!(result, Err(ChatError::UserNotFound));
    }

    #[tokio::test]
    async fn assembler_uses_configured_persona() {
        let (store, user_id) = seeded(&[]).await;
        let config = ChatConfig {
            persona: "You are Rebecca.".to_string(),
            history_limit: 3,
        };
        let assembler = ContextAssembler::from_config(&config, store.clone(), store.clone());
        let messages = assembler.build(user_id, "hello").await.unwrap();
        assert_eq!(messages[0], ChatMessage::system("You are Rebecca."));
        assert_eq!(messages[1], ChatMessage::user("hello"));
    }

    #[test]
    fn expand_history_reverses_fetch_order() {
        let now = chrono::Utc::now();
        let turn = |id: i64, p: &str, r: &str| Turn {
            id,
            user_id: 1,
            timestamp: now,
            prompt: p.into(),
            response: r.into(),
            metadata: None,
        };
        let recent_first = vec![turn(2, "newer", "N."), turn(1, "older", "O.")];
        let messages = expand_history("p", recent_first, "x");
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["p", "older", "O.", "newer", "N.", "x"]);
    }

    /// Every read fails, as with a dropped database connection.
    struct UnreachableStore;

    #[async_trait::async_trait]
    impl UserStore for UnreachableStore {
        async fn find_by_id(&self, _id: i64) -> Result<Option<crate::models::User>, StoreError> {
            Err(StoreError::Unavailable("connection reset".into()))
        }

        async fn find_by_username(
            &self,
            _username: &str,
        ) -> Result<Option<crate::models::User>, StoreError> {
            Err(StoreError::Unavailable("connection reset".into()))
        }

        async fn create_user(
            &self,
            _username: &str,
            _password_hash: &str,
        ) -> Result<crate::models::User, StoreError> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn read_failure_is_storage_unavailable_not_storage_failure() {
        let (turns, user_id) = seeded(&[]).await;
        let result = assemble(&UnreachableStore, &*turns, user_id, "p", "hi", 5).await;
        match result {
            Err(e) => {
                assert_eq!(e, ChatError::StorageUnavailable("Store unavailable: connection reset".into()));
                assert_eq!(e.kind(), "storage_unavailable");
            }
            Ok(_) => panic!("Expected StorageUnavailable"),
        }
    }
}
