//! Secret lookup for connect-time credential resolution.
//!
//! Secrets are looked up in a per-process cache, then the OS keychain, and
//! finally obtained from an interactive `SecretPrompt`. Invalidating a
//! connection forgets every secret that was resolved for it.

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use keyring::Entry;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const SERVICE_NAME: &str = "sshdeck";

/// Supplies secrets interactively (terminal, dialog, ...)
pub trait SecretPrompt: Send + Sync {
    /// `Ok(None)` means the user declined to answer
    fn prompt(&self, message: &str) -> EngineResult<Option<String>>;
}

/// Where connect-time secrets come from
pub trait CredentialStore: Send + Sync {
    fn get_secret(&self, connection_id: &str, credential_id: &str) -> EngineResult<Option<String>>;

    fn prompt_for_secret(
        &self,
        connection_id: &str,
        credential_id: &str,
        prompt: &str,
    ) -> EngineResult<Option<String>>;

    /// Forget everything resolved for `connection_id` so the next attempt re-prompts
    fn invalidate(&self, connection_id: &str);
}

fn account(connection_id: &str, credential_id: &str) -> String {
    format!("{}/{}", connection_id, credential_id)
}

/// OS keychain backed store with a session cache
pub struct KeychainStore {
    cache: DashMap<String, String>,
    /// Credential ids resolved per connection, for invalidation
    resolved: DashMap<String, HashSet<String>>,
    prompt: Option<Arc<dyn SecretPrompt>>,
    persist_prompted: bool,
}

impl KeychainStore {
    pub fn new(prompt: Option<Arc<dyn SecretPrompt>>) -> Self {
        Self {
            cache: DashMap::new(),
            resolved: DashMap::new(),
            prompt,
            persist_prompted: true,
        }
    }

    /// Keep prompted secrets in the session cache only
    pub fn without_persistence(mut self) -> Self {
        self.persist_prompted = false;
        self
    }

    /// Save a secret for a connection in the OS keychain
    pub fn store_secret(&self, connection_id: &str, credential_id: &str, secret: &str) -> EngineResult<()> {
        let key = account(connection_id, credential_id);
        let entry = Entry::new(SERVICE_NAME, &key)?;
        entry.set_password(secret)?;
        self.cache.insert(key, secret.to_string());
        tracing::debug!("Stored secret in OS keychain: {}", credential_id);
        Ok(())
    }

    pub fn delete_secret(&self, connection_id: &str, credential_id: &str) -> EngineResult<()> {
        let key = account(connection_id, credential_id);
        self.cache.remove(&key);
        let entry = Entry::new(SERVICE_NAME, &key)?;
        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remember(&self, connection_id: &str, credential_id: &str) {
        self.resolved
            .entry(connection_id.to_string())
            .or_default()
            .insert(credential_id.to_string());
    }

    fn keychain_lookup(key: &str) -> Option<String> {
        let entry = match Entry::new(SERVICE_NAME, key) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("OS keychain unavailable: {}", e);
                return None;
            }
        };
        match entry.get_password() {
            Ok(secret) => Some(secret),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                tracing::debug!("OS keychain lookup failed: {}", e);
                None
            }
        }
    }
}

impl CredentialStore for KeychainStore {
    fn get_secret(&self, connection_id: &str, credential_id: &str) -> EngineResult<Option<String>> {
        let key = account(connection_id, credential_id);
        if let Some(secret) = self.cache.get(&key) {
            return Ok(Some(secret.clone()));
        }

        let found = Self::keychain_lookup(&key);
        if let Some(ref secret) = found {
            self.cache.insert(key, secret.clone());
            self.remember(connection_id, credential_id);
        }
        Ok(found)
    }

    fn prompt_for_secret(
        &self,
        connection_id: &str,
        credential_id: &str,
        prompt: &str,
    ) -> EngineResult<Option<String>> {
        let Some(ref prompter) = self.prompt else {
            return Ok(None);
        };
        let Some(secret) = prompter.prompt(prompt)? else {
            return Ok(None);
        };

        self.cache
            .insert(account(connection_id, credential_id), secret.clone());
        self.remember(connection_id, credential_id);

        if self.persist_prompted {
            if let Err(e) = self.store_secret(connection_id, credential_id, &secret) {
                tracing::warn!("Could not save secret to OS keychain: {}", e);
            }
        }
        Ok(Some(secret))
    }

    fn invalidate(&self, connection_id: &str) {
        let Some((_, ids)) = self.resolved.remove(connection_id) else {
            return;
        };
        for credential_id in ids {
            if let Err(e) = self.delete_secret(connection_id, &credential_id) {
                tracing::debug!("Failed to delete {} from OS keychain: {}", credential_id, e);
            }
        }
        tracing::info!("Invalidated cached credentials for {}", connection_id);
    }
}

/// In-process store for tests and embedders that manage secrets themselves
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<(String, String), String>>,
    prompt_answer: Option<String>,
    prompts: Mutex<usize>,
    invalidated: Mutex<Vec<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every prompt with `answer`
    pub fn with_prompt_answer(mut self, answer: impl Into<String>) -> Self {
        self.prompt_answer = Some(answer.into());
        self
    }

    pub fn insert(&self, connection_id: &str, credential_id: &str, secret: &str) {
        self.secrets.lock().insert(
            (connection_id.to_string(), credential_id.to_string()),
            secret.to_string(),
        );
    }

    pub fn prompt_count(&self) -> usize {
        *self.prompts.lock()
    }

    /// Connection ids passed to `invalidate`, in call order
    pub fn invalidated(&self) -> Vec<String> {
        self.invalidated.lock().clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_secret(&self, connection_id: &str, credential_id: &str) -> EngineResult<Option<String>> {
        Ok(self
            .secrets
            .lock()
            .get(&(connection_id.to_string(), credential_id.to_string()))
            .cloned())
    }

    fn prompt_for_secret(
        &self,
        connection_id: &str,
        credential_id: &str,
        _prompt: &str,
    ) -> EngineResult<Option<String>> {
        *self.prompts.lock() += 1;
        if let Some(ref answer) = self.prompt_answer {
            self.insert(connection_id, credential_id, answer);
        }
        Ok(self.prompt_answer.clone())
    }

    fn invalidate(&self, connection_id: &str) {
        self.secrets.lock().retain(|(conn, _), _| conn != connection_id);
        self.invalidated.lock().push(connection_id.to_string());
    }
}

/// Prompt that always fails; for non-interactive embedders that want a hard error
pub struct NoPrompt;

impl SecretPrompt for NoPrompt {
    fn prompt(&self, message: &str) -> EngineResult<Option<String>> {
        Err(EngineError::Keychain(format!(
            "Interactive input required but unavailable: {}",
            message
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPrompt(&'static str);

    impl SecretPrompt for FixedPrompt {
        fn prompt(&self, _message: &str) -> EngineResult<Option<String>> {
            Ok(Some(self.0.to_string()))
        }
    }

    #[test]
    fn test_memory_store_invalidate_only_touches_connection() {
        let store = MemoryCredentialStore::new();
        store.insert("a:22:u", "pw", "one");
        store.insert("b:22:u", "pw", "two");

        store.invalidate("a:22:u");
        assert_eq!(store.get_secret("a:22:u", "pw").unwrap(), None);
        assert_eq!(store.get_secret("b:22:u", "pw").unwrap().as_deref(), Some("two"));
        assert_eq!(store.invalidated(), vec!["a:22:u".to_string()]);
    }

    #[test]
    fn test_memory_store_prompt_is_remembered() {
        let store = MemoryCredentialStore::new().with_prompt_answer("typed");
        assert_eq!(
            store.prompt_for_secret("c", "pw", "Password").unwrap().as_deref(),
            Some("typed")
        );
        assert_eq!(store.get_secret("c", "pw").unwrap().as_deref(), Some("typed"));
        assert_eq!(store.prompt_count(), 1);
    }

    #[test]
    fn test_keychain_store_prompt_without_prompter() {
        let store = KeychainStore::new(None);
        assert_eq!(store.prompt_for_secret("c", "pw", "Password").unwrap(), None);
    }

    #[test]
    fn test_keychain_store_caches_prompted_secret_and_invalidates() {
        let store = KeychainStore::new(Some(Arc::new(FixedPrompt("s3cret")))).without_persistence();
        let conn = "cache-test.invalid:22:nobody";

        let secret = store.prompt_for_secret(conn, "pw", "Password").unwrap();
        assert_eq!(secret.as_deref(), Some("s3cret"));
        assert_eq!(store.get_secret(conn, "pw").unwrap().as_deref(), Some("s3cret"));

        store.invalidate(conn);
        assert!(store.cache.get(&account(conn, "pw")).is_none());
        assert!(!store.resolved.contains_key(conn));
    }

    #[test]
    fn test_no_prompt_errors() {
        assert!(NoPrompt.prompt("Password").is_err());
    }
}
