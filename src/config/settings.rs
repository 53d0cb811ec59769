use crate::error::EngineResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Engine settings, persisted as `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub search: SearchSettings,
}

/// What to do with host keys that are not in `known_hosts`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownHostsPolicy {
    Strict,
    #[default]
    AcceptNew,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u32,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    #[serde(default)]
    pub known_hosts_policy: KnownHostsPolicy,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keepalive() -> u32 {
    20
}

fn default_operation_timeout() -> u64 {
    30
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive(),
            operation_timeout_secs: default_operation_timeout(),
            known_hosts_policy: KnownHostsPolicy::default(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Private keys probed when a host has no explicit credential
    #[serde(default = "default_key_paths")]
    pub default_key_paths: Vec<String>,
}

fn default_key_paths() -> Vec<String> {
    vec![
        "~/.ssh/id_ed25519".to_string(),
        "~/.ssh/id_ecdsa".to_string(),
        "~/.ssh/id_rsa".to_string(),
    ]
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            default_key_paths: default_key_paths(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-connection ceilings keyed by connection id
    #[serde(default)]
    pub per_host: HashMap<String, usize>,
}

fn default_max_concurrent() -> usize {
    5
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            per_host: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

fn default_max_results() -> u32 {
    2000
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
        }
    }
}

impl EngineSettings {
    pub fn load(config_dir: &Path) -> EngineResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: EngineSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = EngineSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> EngineResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}
