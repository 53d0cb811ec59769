//! One authenticated remote session and every operation built on it.

use crate::command::{
    content_search_command, filename_search_command, head_command, parse_content_matches,
    parse_filename_matches, remove_recursive_command, tail_command, SearchMatch, SearchOptions,
    SearchPaths,
};
use crate::config::{EngineSettings, HostConfig};
use crate::error::{EngineError, EngineResult};
use crate::keychain::CredentialStore;
use crate::logging::{LogLevel, LogSubsystem, OutputLog};
use crate::sftp::{file_name, join_path, sort_listing, RemoteFile};
use crate::ssh::auth::{build_auth_config, Credential};
use crate::ssh::forward::{ForwardInfo, PortForward};
use crate::ssh::state::{ConnectionState, StateChange, StateObservers, Subscription};
use crate::ssh::transport::{ConnectRequest, Connector, SftpChannel, Transport};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Collaborators every connection needs
#[derive(Clone)]
pub struct ConnectionDeps {
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub settings: Arc<EngineSettings>,
    pub output: Arc<OutputLog>,
    /// Directory holding `known_hosts`
    pub config_dir: Option<PathBuf>,
}

/// Cooperative cancellation flag for long-running searches
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Snapshot of a connection for listings
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: ConnectionState,
    pub connected_at: Option<i64>,
    pub forwards: usize,
}

struct ConnectionInner {
    id: String,
    host: HostConfig,
    credential: Option<Credential>,
    deps: ConnectionDeps,
    state: RwLock<ConnectionState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    sftp: Mutex<Option<Arc<dyn SftpChannel>>>,
    /// Serializes lazy SFTP channel creation
    sftp_init: tokio::sync::Mutex<()>,
    forwards: Mutex<HashMap<u16, PortForward>>,
    observers: StateObservers,
    /// Bumped on every connect and disconnect; stale transports compare against it
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    connected_at: RwLock<Option<i64>>,
}

impl ConnectionInner {
    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous == next {
            return;
        }

        tracing::debug!("{}: {} -> {}", self.id, previous, next);
        let level = if next == ConnectionState::Error {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.deps
            .output
            .connection(level, LogSubsystem::Connection, &self.id, format!("State {}", next));

        self.observers.notify(&StateChange {
            connection_id: self.id.clone(),
            previous,
            current: next,
        });
    }

    /// The transport reported an unsolicited close
    fn handle_remote_close(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self.transport.write().take().is_none() {
            return;
        }

        tracing::warn!("Connection {} closed by remote", self.id);
        self.sftp.lock().take();
        let forwards = std::mem::take(&mut *self.forwards.lock());
        drop(forwards);
        *self.connected_at.write() = None;
        self.set_state(ConnectionState::Disconnected);
    }
}

/// A session to one `host:port:username`.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// `credential` overrides the one stored on `host`
    pub fn new(host: HostConfig, credential: Option<Credential>, deps: ConnectionDeps) -> Self {
        let credential = credential.or_else(|| host.credential.clone());
        Self {
            inner: Arc::new(ConnectionInner {
                id: host.connection_id(),
                host,
                credential,
                deps,
                state: RwLock::new(ConnectionState::Disconnected),
                transport: RwLock::new(None),
                sftp: Mutex::new(None),
                sftp_init: tokio::sync::Mutex::new(()),
                forwards: Mutex::new(HashMap::new()),
                observers: StateObservers::new(),
                generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                connected_at: RwLock::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn host(&self) -> &HostConfig {
        &self.inner.host
    }

    /// Credential used by `connect`, fixed at construction
    pub fn credential(&self) -> Option<&Credential> {
        self.inner.credential.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe every state transition until the handle is dropped
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(observer)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.inner.id.clone(),
            host: self.inner.host.host.clone(),
            port: self.inner.host.port,
            username: self.inner.host.username.clone(),
            state: self.state(),
            connected_at: *self.inner.connected_at.read(),
            forwards: self.inner.forwards.lock().len(),
        }
    }

    /// Connect and authenticate. A no-op when already connected.
    pub async fn connect(&self) -> EngineResult<()> {
        let inner = &self.inner;
        let _connecting = inner.connect_lock.lock().await;

        let alive = inner
            .transport
            .read()
            .as_ref()
            .map(|t| t.is_alive())
            .unwrap_or(false);
        if self.state() == ConnectionState::Connected && alive {
            return Ok(());
        }

        self.release_session();
        inner.set_state(ConnectionState::Connecting);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.open_transport().await {
            Ok(transport) => {
                if inner.generation.load(Ordering::SeqCst) != generation {
                    tokio::task::spawn_blocking(move || transport.close());
                    return Err(EngineError::Connection(format!(
                        "Connection to {} was cancelled",
                        inner.id
                    )));
                }

                *inner.transport.write() = Some(Arc::clone(&transport));
                *inner.connected_at.write() = Some(chrono::Utc::now().timestamp());
                inner.set_state(ConnectionState::Connected);
                tracing::info!("Connected to {}", inner.id);

                let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
                transport.on_close(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_remote_close(generation);
                    }
                }));
                if !transport.is_alive() {
                    inner.handle_remote_close(generation);
                }
                Ok(())
            }
            Err(e) => {
                if e.is_authentication() {
                    tracing::warn!("Authentication failed for {}", inner.id);
                    inner.deps.output.connection(
                        LogLevel::Error,
                        LogSubsystem::Credentials,
                        &inner.id,
                        "Authentication failed; cached credentials cleared",
                    );
                    inner.deps.credentials.invalidate(&inner.id);
                } else {
                    tracing::error!("Connection to {} failed: {}", inner.id, e);
                    inner.deps.output.connection(
                        LogLevel::Error,
                        LogSubsystem::Connection,
                        &inner.id,
                        e.to_string(),
                    );
                }

                if inner.generation.load(Ordering::SeqCst) == generation {
                    inner.set_state(ConnectionState::Error);
                }
                Err(e)
            }
        }
    }

    async fn open_transport(&self) -> EngineResult<Arc<dyn Transport>> {
        let inner = Arc::clone(&self.inner);

        // Resolving may block on an interactive prompt, so it is not timed
        let auth = {
            let inner = Arc::clone(&inner);
            tokio::task::spawn_blocking(move || {
                build_auth_config(
                    &inner.id,
                    &inner.host,
                    inner.credential.as_ref(),
                    &inner.deps.settings.auth,
                    inner.deps.credentials.as_ref(),
                )
            })
            .await
            .map_err(|e| EngineError::Connection(format!("Credential task failed: {}", e)))??
        };

        let timeout = inner.deps.settings.connection.connect_timeout();
        let handshake = tokio::task::spawn_blocking(move || {
            inner.deps.connector.connect(ConnectRequest {
                connection_id: &inner.id,
                host: &inner.host,
                auth: &auth,
                settings: &inner.deps.settings.connection,
                config_dir: inner.deps.config_dir.clone(),
            })
        });

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::Connection(format!("Connect task failed: {}", e))),
            Err(_) => Err(EngineError::Connection(format!(
                "Connection to {} timed out after {}s",
                self.inner.id,
                timeout.as_secs()
            ))),
        }
    }

    /// Drop session handles without touching the state
    fn release_session(&self) {
        let inner = &self.inner;
        let forwards = std::mem::take(&mut *inner.forwards.lock());
        for (port, forward) in forwards {
            tracing::debug!("Stopping forward on local port {} for {}", port, inner.id);
            forward.stop();
        }

        let sftp = inner.sftp.lock().take();
        let transport = inner.transport.write().take();
        *inner.connected_at.write() = None;

        if sftp.is_some() || transport.is_some() {
            let teardown = move || {
                if let Some(sftp) = sftp {
                    sftp.close();
                }
                if let Some(transport) = transport {
                    transport.close();
                }
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(teardown);
                }
                Err(_) => teardown(),
            }
        }
    }

    /// Tear everything down. Safe to call in any state.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        self.release_session();
        if self.state() != ConnectionState::Disconnected {
            tracing::info!("Disconnected from {}", inner.id);
        }
        inner.set_state(ConnectionState::Disconnected);
    }

    fn transport(&self) -> EngineResult<Arc<dyn Transport>> {
        let not_connected = || EngineError::Connection(format!("Not connected: {}", self.inner.id));
        if self.state() != ConnectionState::Connected {
            return Err(not_connected());
        }
        self.inner.transport.read().clone().ok_or_else(not_connected)
    }

    /// The cached SFTP channel, opened on first use
    async fn sftp(&self) -> EngineResult<Arc<dyn SftpChannel>> {
        let transport = self.transport()?;
        let cached = self.inner.sftp.lock().clone();
        if let Some(sftp) = cached {
            return Ok(sftp);
        }

        let _init = self.inner.sftp_init.lock().await;
        let cached = self.inner.sftp.lock().clone();
        if let Some(sftp) = cached {
            return Ok(sftp);
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let sftp = self
            .run_blocking("open SFTP channel", move || transport.open_sftp())
            .await?;
        if self.inner.generation.load(Ordering::SeqCst) != generation || !self.is_connected() {
            tokio::task::spawn_blocking(move || sftp.close());
            return Err(EngineError::Connection(format!("Not connected: {}", self.inner.id)));
        }

        *self.inner.sftp.lock() = Some(Arc::clone(&sftp));
        tracing::debug!("SFTP channel opened for {}", self.inner.id);
        Ok(sftp)
    }

    /// Run a blocking transport call, racing it against the operation timeout.
    /// A result that arrives after the timeout is dropped.
    async fn run_blocking<T, F>(&self, operation: &str, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> EngineResult<T> + Send + 'static,
    {
        let timeout = self.inner.deps.settings.connection.operation_timeout();
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::Connection(format!("{} task failed: {}", operation, e))),
            Err(_) => {
                tracing::warn!("{} on {} timed out", operation, self.inner.id);
                Err(EngineError::timeout(operation, timeout.as_secs()))
            }
        }
    }

    /// Run a command through the remote shell and return its stdout.
    ///
    /// A non-zero exit only fails when stderr is non-empty; tools like
    /// `grep` exit 1 with no stderr for "nothing found".
    pub async fn exec(&self, command: &str) -> EngineResult<String> {
        let transport = self.transport()?;
        let command = command.to_string();
        let output = self
            .run_blocking("exec", move || transport.exec(&command))
            .await?;

        if output.exit_code != 0 && !output.stderr.is_empty() {
            return Err(EngineError::command_failed(output.exit_code, &output.stderr));
        }
        Ok(output.stdout)
    }

    /// Expand `~` and `~/...` against the remote home directory
    fn resolve_home(sftp: &dyn SftpChannel, path: &str) -> EngineResult<String> {
        if path == "~" {
            return sftp.realpath(".");
        }
        match path.strip_prefix("~/") {
            Some(rest) => Ok(join_path(&sftp.realpath(".")?, rest)),
            None => Ok(path.to_string()),
        }
    }

    /// Directory entries, directories first, each group sorted by name
    pub async fn list_files(&self, path: &str) -> EngineResult<Vec<RemoteFile>> {
        let sftp = self.sftp().await?;
        let connection_id = self.inner.id.clone();
        let path = path.to_string();

        self.run_blocking("list", move || {
            let dir = Self::resolve_home(sftp.as_ref(), &path)?;
            let mut files: Vec<RemoteFile> = sftp
                .readdir(&dir)?
                .into_iter()
                .filter(|(name, _)| name != "." && name != "..")
                .map(|(name, attrs)| {
                    RemoteFile::from_listing(&name, &join_path(&dir, &name), &attrs, &connection_id)
                })
                .collect();
            sort_listing(&mut files);
            Ok(files)
        })
        .await
    }

    pub async fn read_file(&self, path: &str) -> EngineResult<Vec<u8>> {
        let sftp = self.sftp().await?;
        let path = path.to_string();
        self.run_blocking("read", move || sftp.read(&path)).await
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> EngineResult<()> {
        let sftp = self.sftp().await?;
        let path = path.to_string();
        let contents = contents.to_vec();
        self.run_blocking("write", move || sftp.write(&path, &contents))
            .await
    }

    /// Remove a file, or an empty directory. Never recursive.
    pub async fn delete_file(&self, path: &str) -> EngineResult<()> {
        let sftp = self.sftp().await?;
        let path = path.to_string();
        self.run_blocking("delete", move || {
            if sftp.stat(&path)?.is_dir() {
                sftp.rmdir(&path)
            } else {
                sftp.unlink(&path)
            }
        })
        .await
    }

    /// `rm -rf` through the shell
    pub async fn delete_recursive(&self, path: &str) -> EngineResult<()> {
        if matches!(path.trim_end_matches('/'), "" | "~" | ".") {
            return Err(EngineError::sftp(format!("Refusing to recursively delete '{}'", path)));
        }
        self.exec(&remove_recursive_command(path)).await?;
        tracing::info!("Recursively deleted {} on {}", path, self.inner.id);
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> EngineResult<()> {
        let sftp = self.sftp().await?;
        let path = path.to_string();
        self.run_blocking("mkdir", move || sftp.mkdir(&path)).await
    }

    /// Fails with a not-found error for missing paths
    pub async fn stat(&self, path: &str) -> EngineResult<RemoteFile> {
        let sftp = self.sftp().await?;
        let connection_id = self.inner.id.clone();
        let path = path.to_string();
        self.run_blocking("stat", move || {
            let attrs = sftp.stat(&path)?;
            Ok(RemoteFile::from_stat(&file_name(&path), &path, &attrs, &connection_id))
        })
        .await
    }

    pub async fn exists(&self, path: &str) -> EngineResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn rename(&self, from: &str, to: &str) -> EngineResult<()> {
        let sftp = self.sftp().await?;
        let from = from.to_string();
        let to = to.to_string();
        self.run_blocking("rename", move || sftp.rename(&from, &to))
            .await
    }

    /// Absolute path of the remote home directory
    pub async fn home_dir(&self) -> EngineResult<String> {
        let sftp = self.sftp().await?;
        self.run_blocking("resolve home", move || sftp.realpath("."))
            .await
    }

    /// Search file names, or contents with `options.search_content`.
    ///
    /// All base paths go into a single remote command. A token cancelled
    /// before the command is issued yields an empty result; one cancelled
    /// while it runs discards the output with `SftpErrorKind::Cancelled`.
    pub async fn search_files(
        &self,
        paths: impl Into<SearchPaths>,
        pattern: &str,
        options: &SearchOptions,
        cancel: Option<&CancelToken>,
    ) -> EngineResult<Vec<SearchMatch>> {
        let cancelled = || cancel.map(|c| c.is_cancelled()).unwrap_or(false);
        if cancelled() {
            return Ok(Vec::new());
        }

        let paths = paths.into();
        if paths.is_empty() || pattern.is_empty() {
            return Ok(Vec::new());
        }

        let command = if options.search_content {
            content_search_command(&paths, pattern, options)
        } else {
            filename_search_command(&paths, pattern, options)
        };
        tracing::debug!("Search on {}: {}", self.inner.id, command);

        let output = self.exec(&command).await?;
        if cancelled() {
            return Err(EngineError::cancelled("Search"));
        }

        let matches = if options.search_content {
            parse_content_matches(&output, &self.inner.id)
        } else {
            parse_filename_matches(&output, &self.inner.id)
        };
        self.inner.deps.output.connection(
            LogLevel::Debug,
            LogSubsystem::Search,
            &self.inner.id,
            format!("{} matches for search", matches.len()),
        );
        Ok(matches)
    }

    /// First `lines` lines of a file; the count is clamped to `[1, 100000]`
    pub async fn read_file_first_lines(&self, path: &str, lines: impl Into<f64>) -> EngineResult<String> {
        self.exec(&head_command(path, lines)).await
    }

    /// Last `lines` lines of a file; the count is clamped to `[1, 100000]`
    pub async fn read_file_last_lines(&self, path: &str, lines: impl Into<f64>) -> EngineResult<String> {
        self.exec(&tail_command(path, lines)).await
    }

    /// Forward `127.0.0.1:local_port` to `remote_host:remote_port`.
    /// Returns the bound local port, which differs from the request only for port 0.
    pub async fn forward_port(&self, local_port: u16, remote_host: &str, remote_port: u16) -> EngineResult<u16> {
        let transport = self.transport()?;
        if local_port != 0 && self.inner.forwards.lock().contains_key(&local_port) {
            return Err(EngineError::Connection(format!(
                "Local port {} is already forwarded",
                local_port
            )));
        }

        let forward = PortForward::start(transport, &self.inner.id, local_port, remote_host, remote_port).await?;
        let bound = forward.local_port();

        let mut forwards = self.inner.forwards.lock();
        if forwards.contains_key(&bound) {
            return Err(EngineError::Connection(format!(
                "Local port {} is already forwarded",
                bound
            )));
        }
        forwards.insert(bound, forward);
        drop(forwards);

        self.inner.deps.output.connection(
            LogLevel::Info,
            LogSubsystem::Forward,
            &self.inner.id,
            format!("Forwarding 127.0.0.1:{} -> {}:{}", bound, remote_host, remote_port),
        );
        Ok(bound)
    }

    /// Returns false when nothing was forwarded on `local_port`
    pub fn stop_forward(&self, local_port: u16) -> bool {
        let removed = self.inner.forwards.lock().remove(&local_port);
        match removed {
            Some(forward) => {
                forward.stop();
                tracing::info!("Stopped forward on local port {} for {}", local_port, self.inner.id);
                true
            }
            None => false,
        }
    }

    pub fn forwards(&self) -> Vec<ForwardInfo> {
        let mut forwards: Vec<ForwardInfo> = self
            .inner
            .forwards
            .lock()
            .values()
            .map(|f| f.info().clone())
            .collect();
        forwards.sort_by_key(|f| f.local_port);
        forwards
    }
}
