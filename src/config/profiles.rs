use crate::error::{EngineError, EngineResult};
use crate::ssh::auth::Credential;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Alias used by the host book and the CLI
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub credential: Option<Credential>,
}

fn default_port() -> u16 {
    22
}

impl HostConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            name: host.clone(),
            host,
            port,
            username: username.into(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// `host:port:username`, the key for registry and scheduler lookups
    pub fn connection_id(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.username)
    }

    /// Parse `user@host[:port]`. The user part is required.
    pub fn parse_target(target: &str) -> EngineResult<Self> {
        let (username, rest) = target
            .split_once('@')
            .ok_or_else(|| EngineError::Config(format!("Expected user@host[:port], got '{}'", target)))?;
        if username.is_empty() || rest.is_empty() {
            return Err(EngineError::Config(format!("Invalid target '{}'", target)));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EngineError::Config(format!("Invalid port in '{}'", target)))?;
                (host, port)
            }
            None => (rest, default_port()),
        };

        Ok(Self::new(host, port, username))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HostsFile {
    #[serde(default)]
    hosts: Vec<HostConfig>,
}

/// Named hosts, persisted as `hosts.toml`
pub struct HostBook {
    hosts: BTreeMap<String, HostConfig>,
    path: PathBuf,
}

impl HostBook {
    pub fn load(config_dir: &Path) -> EngineResult<Self> {
        let path = config_dir.join("hosts.toml");
        let hosts = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: HostsFile = toml::from_str(&content)?;
            file.hosts.into_iter().map(|h| (h.name.clone(), h)).collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self { hosts, path })
    }

    pub fn save(&self) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = HostsFile {
            hosts: self.hosts.values().cloned().collect(),
        };
        std::fs::write(&self.path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<HostConfig> {
        self.hosts.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<HostConfig> {
        self.hosts.get(name).cloned()
    }

    /// Insert or replace by name
    pub fn add(&mut self, host: HostConfig) -> EngineResult<()> {
        self.hosts.insert(host.name.clone(), host);
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> EngineResult<()> {
        self.hosts
            .remove(name)
            .ok_or_else(|| EngineError::Config(format!("Unknown host: {}", name)))?;
        self.save()
    }

    /// Resolve a CLI target: a book alias first, then `user@host[:port]`
    pub fn resolve(&self, target: &str) -> EngineResult<HostConfig> {
        match self.get(target) {
            Some(host) => Ok(host),
            None => HostConfig::parse_target(target),
        }
    }
}

/// Import hosts from an OpenSSH client config.
///
/// Wildcard patterns and entries without a HostName are skipped.
pub fn parse_openssh_config(content: &str) -> Vec<HostConfig> {
    let mut hosts = Vec::new();
    let mut current: Option<HostConfig> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once(|c: char| c.is_whitespace() || c == '=') else {
            continue;
        };
        let value = value.trim_start_matches(|c: char| c.is_whitespace() || c == '=').trim();

        match key.to_lowercase().as_str() {
            "host" => {
                hosts.extend(current.take());
                current = Some(HostConfig {
                    name: value.to_string(),
                    host: String::new(),
                    port: default_port(),
                    username: String::new(),
                    credential: None,
                });
            }
            "hostname" => {
                if let Some(ref mut host) = current {
                    host.host = value.to_string();
                }
            }
            "user" => {
                if let Some(ref mut host) = current {
                    host.username = value.to_string();
                }
            }
            "port" => {
                if let Some(ref mut host) = current {
                    if let Ok(port) = value.parse() {
                        host.port = port;
                    }
                }
            }
            "identityfile" => {
                if let Some(ref mut host) = current {
                    host.credential = Some(Credential::PrivateKey {
                        path: value.to_string(),
                        passphrase_id: None,
                    });
                }
            }
            _ => {}
        }
    }
    hosts.extend(current);

    hosts
        .into_iter()
        .filter(|h| !h.host.is_empty() && !h.name.contains('*') && !h.name.contains('?'))
        .collect()
}
