//! Credential descriptors and their resolution into authentication material

use crate::config::{expand_home, AuthSettings, HostConfig};
use crate::error::{EngineError, EngineResult};
use crate::keychain::CredentialStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Credential id used for the catch-all password when no descriptor is given
pub const DEFAULT_PASSWORD_ID: &str = "password";

/// Reference to a stored secret, resolved at connect time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    Password {
        credential_id: String,
    },
    PrivateKey {
        path: String,
        #[serde(default)]
        passphrase_id: Option<String>,
    },
}

/// A private key file plus its passphrase, if any
#[derive(Clone)]
pub struct PrivateKeyMaterial {
    pub path: PathBuf,
    pub passphrase: Option<String>,
}

/// Resolved authentication material for one connect attempt
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub username: String,
    pub password: Option<String>,
    pub private_keys: Vec<PrivateKeyMaterial>,
    /// Agent socket from `SSH_AUTH_SOCK`. libssh2 always connects through
    /// that variable, so this only records that a live agent was found.
    pub agent_socket: Option<String>,
    /// Answer keyboard-interactive prompts by replaying `password`
    pub keyboard_interactive: bool,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("methods", &self.methods())
            .finish()
    }
}

impl AuthConfig {
    pub fn has_material(&self) -> bool {
        self.password.is_some() || !self.private_keys.is_empty() || self.agent_socket.is_some()
    }

    /// Method names in the order they are attempted
    pub fn methods(&self) -> Vec<&'static str> {
        let mut methods = Vec::new();
        if self.agent_socket.is_some() {
            methods.push("agent");
        }
        if !self.private_keys.is_empty() {
            methods.push("publickey");
        }
        if self.password.is_some() {
            methods.push("password");
            if self.keyboard_interactive {
                methods.push("keyboard-interactive");
            }
        }
        methods
    }
}

fn lookup_or_prompt(
    store: &dyn CredentialStore,
    connection_id: &str,
    credential_id: &str,
    prompt: &str,
) -> EngineResult<Option<String>> {
    if let Some(secret) = store.get_secret(connection_id, credential_id)? {
        return Ok(Some(secret));
    }
    store.prompt_for_secret(connection_id, credential_id, prompt)
}

/// `SSH_AUTH_SOCK` value, if it names a socket that exists
fn live_agent_socket(raw: Option<String>) -> Option<String> {
    raw.filter(|s| !s.is_empty() && Path::new(s).exists())
}

/// Build the auth configuration for a connect attempt.
///
/// An explicit credential is used exactly. Without one every available
/// method is enabled at once: default keys, the agent, and a password.
pub fn build_auth_config(
    connection_id: &str,
    host: &HostConfig,
    credential: Option<&Credential>,
    settings: &AuthSettings,
    store: &dyn CredentialStore,
) -> EngineResult<AuthConfig> {
    let agent_env = std::env::var("SSH_AUTH_SOCK").ok();
    resolve_auth(connection_id, host, credential, settings, store, agent_env)
}

fn resolve_auth(
    connection_id: &str,
    host: &HostConfig,
    credential: Option<&Credential>,
    settings: &AuthSettings,
    store: &dyn CredentialStore,
    agent_env: Option<String>,
) -> EngineResult<AuthConfig> {
    let mut auth = AuthConfig {
        username: host.username.clone(),
        ..AuthConfig::default()
    };

    match credential {
        Some(Credential::Password { credential_id }) => {
            let prompt = format!("Password for {}@{}", host.username, host.host);
            let password = lookup_or_prompt(store, connection_id, credential_id, &prompt)?
                .ok_or_else(|| {
                    EngineError::Authentication(format!("No password available for {}", connection_id))
                })?;
            auth.password = Some(password);
            auth.keyboard_interactive = true;
        }
        Some(Credential::PrivateKey {
            path,
            passphrase_id,
        }) => {
            let key_path = expand_home(path);
            if !key_path.is_file() {
                return Err(EngineError::Authentication(format!(
                    "Private key not found: {}",
                    key_path.display()
                )));
            }
            let passphrase = match passphrase_id {
                Some(id) => {
                    let prompt = format!("Passphrase for {}", key_path.display());
                    lookup_or_prompt(store, connection_id, id, &prompt)?
                }
                None => None,
            };
            auth.private_keys.push(PrivateKeyMaterial {
                path: key_path,
                passphrase,
            });
        }
        None => {
            auth.private_keys = settings
                .default_key_paths
                .iter()
                .map(|p| expand_home(p))
                .filter(|p| p.is_file())
                .map(|path| PrivateKeyMaterial {
                    path,
                    passphrase: None,
                })
                .collect();
            auth.agent_socket = live_agent_socket(agent_env);
            if auth.agent_socket.is_none() {
                tracing::debug!("No running SSH agent for {}", connection_id);
            }

            let prompt = format!("Password for {}@{}", host.username, host.host);
            auth.password = lookup_or_prompt(store, connection_id, DEFAULT_PASSWORD_ID, &prompt)?;
            auth.keyboard_interactive = auth.password.is_some();
        }
    }

    if !auth.has_material() {
        return Err(EngineError::Authentication(format!(
            "No authentication method available for {}",
            connection_id
        )));
    }

    tracing::debug!(
        "Auth methods for {}: {}",
        connection_id,
        auth.methods().join(", ")
    );
    Ok(auth)
}
