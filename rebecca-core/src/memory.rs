//! In-process store used by `rebecca-server --ephemeral` and by tests.
//!
//! Keeps call counters so callers can assert that a request never touched
//! storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{Turn, User};
use crate::store::{ConversationStore, StoreError, UserStore};

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    turns: Vec<Turn>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_appends: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `append` always fails, for exercising storage failures.
    pub fn failing_appends() -> Self {
        Self {
            fail_appends: true,
            ..Self::default()
        }
    }

    /// Number of read calls (turn fetches and user lookups).
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of write calls (turn appends and user creation), failed ones included.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.lock().turns.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock only means a panicking test thread; the data is still usable.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn fetch_recent(&self, user_id: i64, limit: u32) -> Result<Vec<Turn>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.lock();
        Ok(tables
            .turns
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn append(
        &self,
        user_id: i64,
        prompt: &str,
        response: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Turn, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_appends {
            return Err(StoreError::Unavailable("append rejected".to_string()));
        }

        let mut tables = self.lock();
        let turn = Turn {
            id: tables.turns.len() as i64 + 1,
            user_id,
            timestamp: Utc::now(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            metadata: metadata.cloned(),
        };
        tables.turns.push(turn.clone());
        Ok(turn)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .lock()
            .users
            .iter()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.lock();
        if tables.users.iter().any(|u| u.username == username) {
            return Err(StoreError::Conflict(format!(
                "username '{}' is already taken",
                username
            )));
        }
        let user = User {
            id: tables.users.len() as i64 + 1,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        tables.users.push(user.clone());
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_recent_is_newest_first_and_per_user() {
        let store = MemoryStore::new();
        store.append(1, "a", "A.", None).await.unwrap();
        store.append(2, "other", "O.", None).await.unwrap();
        store.append(1, "b", "B.", None).await.unwrap();
        store.append(1, "c", "C.", None).await.unwrap();

        let recent = store.fetch_recent(1, 2).await.unwrap();
        let prompts: Vec<&str> = recent.iter().map(|t| t.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["c", "b"]);
        assert_eq!(store.reads(), 1);
        assert_eq!(store.writes(), 4);
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let store = MemoryStore::new();
        store.create_user("ada", "h").await.unwrap();
        let err = store.create_user("ada", "h").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn failing_store_counts_but_keeps_nothing() {
        let store = MemoryStore::failing_appends();
        assert!(store.append(1, "p", "r", None).await.is_err());
        assert_eq!(store.writes(), 1);
        assert!(store.turns().is_empty());
    }
}
