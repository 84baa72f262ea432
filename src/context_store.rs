//! Carried context between generations.
//!
//! Prompts flagged `saveLastAsContext` leave a `{prompt, response}` pair
//! behind for the *next* generation of the same user. The pairs are
//! consumed exactly once: [`ContextStore::take_and_clear`] at generation
//! start, [`ContextStore::replace`] at generation end.
//!
//! Callers must keep at most one generation per user in flight;
//! [`ResponseSession`](crate::session::ResponseSession) does this with a
//! per-user lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// A prompt/response pair carried into the next generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedContextEntry {
    pub prompt: String,
    pub response: String,
}

/// Per-user, single-use storage of carried context.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Remove and return the entries stored for `user_id` (possibly empty).
    async fn take_and_clear(&self, user_id: &str) -> Vec<SavedContextEntry>;

    /// Store `entries` for `user_id`. Empty `entries` store nothing.
    async fn replace(&self, user_id: &str, entries: Vec<SavedContextEntry>);

    /// Read without clearing.
    async fn peek(&self, user_id: &str) -> Vec<SavedContextEntry>;
}

/// Process-local [`ContextStore`]. Not persisted.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    entries: Mutex<HashMap<String, Vec<SavedContextEntry>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users with unread carried context.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn take_and_clear(&self, user_id: &str) -> Vec<SavedContextEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id)
            .unwrap_or_default()
    }

    async fn replace(&self, user_id: &str, entries: Vec<SavedContextEntry>) {
        if entries.is_empty() {
            return;
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), entries);
    }

    async fn peek(&self, user_id: &str) -> Vec<SavedContextEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}
