use crate::config::{get_config_dir, EngineSettings, HostBook, HostConfig};
use crate::error::EngineResult;
use crate::keychain::{CredentialStore, KeychainStore, SecretPrompt};
use crate::logging::{LogLevel, LogLine, LogSubsystem, OutputLog};
use crate::scheduler::Scheduler;
use crate::ssh::{Connection, ConnectionDeps, ConnectionRegistry, Credential, Ssh2Connector};
use crate::ssh::transport::Connector;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How to build an `Engine`. Every `None` falls back to the real thing.
#[derive(Default)]
pub struct EngineOptions {
    /// Defaults to the platform config dir
    pub config_dir: Option<PathBuf>,
    /// Use these settings instead of loading `config.toml`
    pub settings: Option<EngineSettings>,
    pub credentials: Option<Arc<dyn CredentialStore>>,
    /// Prompt handed to the default keychain store
    pub prompt: Option<Arc<dyn SecretPrompt>>,
    pub connector: Option<Arc<dyn Connector>>,
    /// Persist the output log under `<config>/logs`
    pub log_to_file: bool,
}

/// Engine context: owns every shared service
pub struct Engine {
    config_dir: PathBuf,
    settings: Arc<EngineSettings>,
    output: Arc<OutputLog>,
    credentials: Arc<dyn CredentialStore>,
    scheduler: Scheduler,
    registry: ConnectionRegistry,
    hosts: RwLock<HostBook>,
}

impl Engine {
    pub fn init(options: EngineOptions) -> EngineResult<Self> {
        let config_dir = match options.config_dir {
            Some(dir) => dir,
            None => get_config_dir()?,
        };
        std::fs::create_dir_all(&config_dir)?;
        tracing::info!("sshdeck config dir: {:?}", config_dir);

        let settings = match options.settings {
            Some(settings) => settings,
            None => EngineSettings::load(&config_dir)?,
        };
        let settings = Arc::new(settings);

        let output = if options.log_to_file {
            OutputLog::with_file(&config_dir)?
        } else {
            OutputLog::in_memory()
        };

        let credentials = options
            .credentials
            .unwrap_or_else(|| Arc::new(KeychainStore::new(options.prompt)));
        let connector = options
            .connector
            .unwrap_or_else(|| Arc::new(Ssh2Connector));

        let scheduler = Scheduler::new(&settings.scheduler);
        let deps = ConnectionDeps {
            connector,
            credentials: Arc::clone(&credentials),
            settings: Arc::clone(&settings),
            output: Arc::clone(&output),
            config_dir: Some(config_dir.clone()),
        };
        let registry = ConnectionRegistry::new(deps, scheduler.clone());
        let hosts = HostBook::load(&config_dir)?;

        output.log(LogLine::new(LogLevel::Info, LogSubsystem::Engine, "Engine initialized"));
        tracing::info!("sshdeck engine initialized");

        Ok(Self {
            config_dir,
            settings,
            output,
            credentials,
            scheduler,
            registry,
            hosts: RwLock::new(hosts),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn output(&self) -> &Arc<OutputLog> {
        &self.output
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn hosts(&self) -> &RwLock<HostBook> {
        &self.hosts
    }

    /// Connect to a saved alias or a `user@host[:port]` target
    pub async fn connect_target(&self, target: &str, credential: Option<Credential>) -> EngineResult<Connection> {
        let host: HostConfig = self.hosts.read().resolve(target)?;
        self.registry.connect(&host, credential).await
    }

    /// Cancel speculative work and close every connection
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.registry.disconnect_all().await;
        self.output
            .log(LogLine::new(LogLevel::Info, LogSubsystem::Engine, "Engine shut down"));
        tracing::info!("sshdeck engine shut down");
    }
}
