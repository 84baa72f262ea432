//! Source of a user's active pipeline definition.
//!
//! The scheduler reads the active definition fresh on every generation via
//! [`ConfigSource`]; nothing is cached across requests. Definitions come back
//! raw and are validated by the scheduler.

use crate::config::{self, ConfigError};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{error, info};

/// Provides the active pipeline definition of a user.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// The raw active definition, or `None` when the user has none.
    async fn active_config(&self, user_id: &str) -> Result<Option<Value>>;
}

/// A named definition owned by one user.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConfig {
    pub name: String,
    /// Either a JSON object or a JSON document held as a string.
    pub data: Value,
    pub active: bool,
}

/// Process-local [`ConfigSource`] with per-user named definitions.
///
/// At most one definition per user is active.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    configs: Mutex<HashMap<String, Vec<StoredConfig>>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition, inactive. A definition with the same
    /// name is overwritten.
    ///
    /// `raw` may be an object or a string holding a JSON document; strings
    /// are kept as-is and parsed again on every read.
    pub fn create(
        &self,
        user_id: &str,
        name: &str,
        raw: Value,
    ) -> std::result::Result<(), ConfigError> {
        match &raw {
            Value::String(text) => {
                config::parse_str(text)?;
            }
            other => {
                config::validate(other)?;
            }
        }
        self.insert_unchecked(user_id, name, raw);
        Ok(())
    }

    /// Store a definition without validating it.
    pub fn insert_unchecked(&self, user_id: &str, name: &str, raw: Value) {
        let mut guard = self.configs.lock().unwrap_or_else(PoisonError::into_inner);
        let configs = guard.entry(user_id.to_string()).or_default();
        configs.retain(|c| c.name != name);
        configs.push(StoredConfig {
            name: name.to_string(),
            data: raw,
            active: false,
        });
    }

    /// Make `name` the user's only active definition. `false` when no such
    /// definition exists.
    pub fn activate(&self, user_id: &str, name: &str) -> bool {
        let mut guard = self.configs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(configs) = guard.get_mut(user_id) else {
            return false;
        };
        if !configs.iter().any(|c| c.name == name) {
            return false;
        }
        for c in configs.iter_mut() {
            c.active = c.name == name;
        }
        true
    }

    pub fn deactivate_all(&self, user_id: &str) {
        let mut guard = self.configs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(configs) = guard.get_mut(user_id) {
            for c in configs.iter_mut() {
                c.active = false;
            }
        }
    }

    /// Names of the user's definitions, in creation order.
    pub fn names(&self, user_id: &str) -> Vec<String> {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|cs| cs.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Name of the active definition, if any.
    pub fn active_name(&self, user_id: &str) -> Option<String> {
        self.configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)?
            .iter()
            .find(|c| c.active)
            .map(|c| c.name.clone())
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigStore {
    async fn active_config(&self, user_id: &str) -> Result<Option<Value>> {
        let active = self
            .configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .and_then(|cs| cs.iter().find(|c| c.active).cloned());

        let Some(stored) = active else {
            return Ok(None);
        };
        info!(user_id, config = %stored.name, "active config found");

        match stored.data {
            Value::String(text) => match serde_json::from_str(&text) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    error!(user_id, config = %stored.name, error = %e, "stored config is not valid JSON");
                    Ok(None)
                }
            },
            value => Ok(Some(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({"s": [{"prompt": "P"}]})
    }

    #[tokio::test]
    async fn test_created_config_is_inactive() {
        let store = InMemoryConfigStore::new();
        store.create("u1", "main", sample()).unwrap();
        assert_eq!(store.active_config("u1").await.unwrap(), None);
        assert_eq!(store.names("u1"), vec!["main"]);
    }

    #[test]
    fn test_create_rejects_invalid() {
        let store = InMemoryConfigStore::new();
        assert_eq!(store.create("u1", "bad", json!({})), Err(ConfigError::Empty));
        assert!(matches!(
            store.create("u1", "bad", json!("{oops")),
            Err(ConfigError::Parse(_))
        ));
        assert!(store.names("u1").is_empty());
    }

    #[tokio::test]
    async fn test_activate_is_exclusive() {
        let store = InMemoryConfigStore::new();
        store.create("u1", "one", sample()).unwrap();
        store
            .create("u1", "two", json!({"t": [{"prompt": "Q"}]}))
            .unwrap();

        assert!(store.activate("u1", "one"));
        assert!(store.activate("u1", "two"));
        assert_eq!(store.active_name("u1").as_deref(), Some("two"));
        assert_eq!(
            store.active_config("u1").await.unwrap(),
            Some(json!({"t": [{"prompt": "Q"}]}))
        );
        assert!(!store.activate("u1", "missing"));
        assert!(!store.activate("nobody", "one"));
    }

    #[tokio::test]
    async fn test_deactivate_all() {
        let store = InMemoryConfigStore::new();
        store.create("u1", "one", sample()).unwrap();
        store.activate("u1", "one");
        store.deactivate_all("u1");
        assert_eq!(store.active_config("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_string_config_parsed_on_read() {
        let store = InMemoryConfigStore::new();
        store
            .create("u1", "text", json!(r#"{"b": [{"prompt": "B"}], "a": [{"prompt": "A"}]}"#))
            .unwrap();
        store.activate("u1", "text");

        let value = store.active_config("u1").await.unwrap().unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_unparseable_string_reads_as_none() {
        let store = InMemoryConfigStore::new();
        store.insert_unchecked("u1", "broken", json!("{not json"));
        store.activate("u1", "broken");
        assert_eq!(store.active_config("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_users_do_not_share_configs() {
        let store = InMemoryConfigStore::new();
        store.create("alice", "main", sample()).unwrap();
        store.activate("alice", "main");
        assert_eq!(store.active_config("bob").await.unwrap(), None);
    }
}
