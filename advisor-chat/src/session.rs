//! Session transcripts.
//!
//! A session is a client-chosen key mapping to an ordered list of turns. The
//! store only ever replaces a transcript wholesale; the turn coordinator owns
//! the rules about what a valid transcript looks like.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedMutexGuard, RwLock};

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Error from a session store backend.
#[derive(Debug, thiserror::Error)]
#[error("session store error: {0}")]
pub struct StoreError(pub String);

/// Storage for session transcripts.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Transcript for a session, empty if the session is unknown.
    async fn get(&self, session_id: &str) -> Result<Vec<Turn>, StoreError>;

    /// Replace the stored transcript.
    async fn set(&self, session_id: &str, turns: Vec<Turn>) -> Result<(), StoreError>;

    /// Number of known sessions.
    async fn session_count(&self) -> usize;
}

/// Process-lifetime store. Sessions are never evicted.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<Turn>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn set(&self, session_id: &str, turns: Vec<Turn>) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.to_string(), turns);
        Ok(())
    }

    async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Per-session write locks.
///
/// Holding the guard for a session id from history read to commit makes turns
/// for the same session run one at a time. Other sessions are unaffected.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unknown_session_is_empty() {
        let store = InMemorySessionStore::new();
        assert!(store.get("nope").await.unwrap().is_empty());
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn set_replaces_wholesale() {
        let store = InMemorySessionStore::new();
        store
            .set("s1", vec![Turn::user("a"), Turn::assistant("b")])
            .await
            .unwrap();
        store.set("s1", vec![Turn::user("c")]).await.unwrap();

        assert_eq!(store.get("s1").await.unwrap(), vec![Turn::user("c")]);
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let store = InMemorySessionStore::new();
        store.set("a", vec![Turn::user("one")]).await.unwrap();
        store.set("b", vec![Turn::user("two")]).await.unwrap();

        assert_eq!(store.get("a").await.unwrap()[0].text, "one");
        assert_eq!(store.get("b").await.unwrap()[0].text, "two");
    }

    #[test]
    fn turn_serializes_with_lowercase_role() {
        let json = serde_json::to_value(Turn::assistant("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "assistant", "text": "hi"}));
    }

    #[tokio::test]
    async fn same_session_lock_is_exclusive() {
        let locks = Arc::new(SessionLocks::new());
        let guard = locks.acquire("s1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("s1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_sessions_do_not_block() {
        let locks = SessionLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
    }
}
