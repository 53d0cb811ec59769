//! libssh2-backed transport.
//!
//! Every libssh2 call on a session goes through `SessionLock`. Channel reads
//! (exec output, tunnels) switch the session to non-blocking mode for the
//! duration of one poll, so a quiet tunnel never stalls exec or SFTP.

use crate::config::{get_config_dir, KnownHostsPolicy};
use crate::error::{EngineError, EngineResult};
use crate::sftp::Ssh2Sftp;
use crate::ssh::auth::AuthConfig;
use crate::ssh::transport::{
    CloseCallback, ConnectRequest, Connector, ExecOutput, SftpChannel, Transport, Tunnel,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use ssh2::{
    Channel, CheckResult, ErrorCode, HostKeyType, KeyboardInteractivePrompt, KnownHostFileKind,
    Prompt, Session,
};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Serializes libssh2 calls on one session
pub type SessionLock = Arc<Mutex<()>>;

/// libssh2 error codes meaning the socket is gone
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const WATCHER_TICK: Duration = Duration::from_millis(500);

/// Compute the OpenSSH-style SHA256 fingerprint of a host key
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

fn key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

/// `known_hosts` host field; non-default ports use the bracketed form
fn known_hosts_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn is_socket_error(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV
        )
    )
}

/// Replays the password for every keyboard-interactive prompt
struct PasswordReplay<'a> {
    password: &'a str,
}

impl KeyboardInteractivePrompt for PasswordReplay<'_> {
    fn prompt<'a>(&mut self, _username: &str, _instructions: &str, prompts: &[Prompt<'a>]) -> Vec<String> {
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

/// Opens sessions with libssh2
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Connector;

impl Ssh2Connector {
    fn open_tcp(host: &str, port: u16, timeout: Duration) -> EngineResult<TcpStream> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| EngineError::Connection(format!("Failed to resolve {}: {}", host, e)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(EngineError::Connection(format!(
                        "Connection timed out after {}s",
                        timeout.as_secs()
                    )))
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(EngineError::Connection(match last_err {
            Some(e) => format!("TCP connect to {}:{} failed: {}", host, port, e),
            None => format!("No addresses found for {}", host),
        }))
    }

    fn verify_host_key(
        session: &Session,
        host: &str,
        port: u16,
        policy: KnownHostsPolicy,
        known_hosts_path: &Path,
    ) -> EngineResult<()> {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| EngineError::Connection("No host key received".to_string()))?;

        let fingerprint = compute_sha256_fingerprint(key);
        tracing::info!(
            "Host key for {}:{} is {} {}",
            host,
            port,
            key_type_name(key_type),
            fingerprint
        );

        if policy == KnownHostsPolicy::Off {
            return Ok(());
        }

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| EngineError::Connection(format!("Failed to create known_hosts: {}", e)))?;
        if known_hosts_path.exists() {
            let _ = known_hosts.read_file(known_hosts_path, KnownHostFileKind::OpenSSH);
        }

        match known_hosts.check_port(host, port, key) {
            CheckResult::Match => {
                tracing::debug!("Host key matched for {}:{}", host, port);
                Ok(())
            }
            CheckResult::NotFound if policy == KnownHostsPolicy::AcceptNew => {
                known_hosts
                    .add(
                        &known_hosts_name(host, port),
                        key,
                        &format!("added by sshdeck on {}", chrono::Utc::now().format("%Y-%m-%d")),
                        key_type.into(),
                    )
                    .map_err(|e| EngineError::Connection(format!("Failed to add known host: {}", e)))?;
                if let Some(parent) = known_hosts_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                known_hosts
                    .write_file(known_hosts_path, KnownHostFileKind::OpenSSH)
                    .map_err(|e| EngineError::Connection(format!("Failed to write known_hosts: {}", e)))?;
                tracing::info!("Added host key for {}:{} to known_hosts", host, port);
                Ok(())
            }
            CheckResult::NotFound => Err(EngineError::Connection(format!(
                "Unknown host key for {}:{} ({})",
                host, port, fingerprint
            ))),
            CheckResult::Mismatch => {
                tracing::error!("HOST KEY MISMATCH for {}:{}! Possible MITM attack!", host, port);
                Err(EngineError::Connection(format!(
                    "Host key mismatch for {}:{}. Remove the old key from known_hosts if the change is expected.",
                    host, port
                )))
            }
            CheckResult::Failure => Err(EngineError::Connection("Failed to check known hosts".to_string())),
        }
    }

    /// Try every configured method until the server accepts one
    fn authenticate(session: &Session, auth: &AuthConfig) -> EngineResult<()> {
        let username = auth.username.as_str();

        if let Some(ref socket) = auth.agent_socket {
            match session.userauth_agent(username) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => tracing::warn!("Agent authentication via {} failed: {}", socket, e),
            }
        }

        for key in &auth.private_keys {
            match session.userauth_pubkey_file(username, None, &key.path, key.passphrase.as_deref()) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => tracing::debug!("Key {} rejected: {}", key.path.display(), e),
            }
        }

        if let Some(ref password) = auth.password {
            match session.userauth_password(username, password) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => tracing::debug!("Password authentication failed: {:?}", e.code()),
            }

            if auth.keyboard_interactive {
                let mut replay = PasswordReplay { password };
                match session.userauth_keyboard_interactive(username, &mut replay) {
                    Ok(()) if session.authenticated() => return Ok(()),
                    Ok(()) => {}
                    Err(e) => tracing::debug!("Keyboard-interactive authentication failed: {:?}", e.code()),
                }
            }
        }

        Err(EngineError::Authentication(format!(
            "All authentication methods failed ({})",
            auth.methods().join(", ")
        )))
    }
}

impl Connector for Ssh2Connector {
    fn connect(&self, request: ConnectRequest<'_>) -> EngineResult<Arc<dyn Transport>> {
        let host = request.host;
        let settings = request.settings;

        tracing::info!(
            "Connecting to {}@{}:{}",
            host.username,
            host.host,
            host.port
        );

        let tcp = Self::open_tcp(&host.host, host.port, settings.connect_timeout())?;
        tcp.set_nodelay(true)?;

        let mut session = Session::new()
            .map_err(|e| EngineError::Connection(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(settings.connect_timeout().as_millis() as u32);
        session
            .handshake()
            .map_err(|e| EngineError::from_transport(format!("SSH handshake failed: {}", e)))?;

        let config_dir = match request.config_dir {
            Some(dir) => dir,
            None => get_config_dir()?,
        };
        Self::verify_host_key(
            &session,
            &host.host,
            host.port,
            settings.known_hosts_policy,
            &config_dir.join("known_hosts"),
        )?;

        Self::authenticate(&session, request.auth)?;
        tracing::info!("SSH authentication successful for {}", request.connection_id);

        session.set_timeout(settings.operation_timeout().as_millis() as u32);
        session.set_keepalive(true, settings.keepalive_interval_secs);

        let shared = Arc::new(Shared {
            connection_id: request.connection_id.to_string(),
            session,
            io: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        });
        spawn_keepalive_watcher(
            Arc::downgrade(&shared),
            Duration::from_secs(settings.keepalive_interval_secs.max(1) as u64),
        );

        Ok(Arc::new(Ssh2Transport { shared }))
    }
}

struct Shared {
    connection_id: String,
    session: Session,
    io: SessionLock,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
}

impl Shared {
    /// Mark closed and fire the close callback, once
    fn fire_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Connection {} closed by remote", self.connection_id);
        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Must not be called with `io` held; the close callback may take it
    fn check(&self, err: ssh2::Error) -> ssh2::Error {
        if is_socket_error(&err) {
            self.fire_close();
        }
        err
    }

    /// One non-blocking poll under the session lock
    fn poll<T>(&self, f: impl FnOnce() -> T) -> T {
        let _io = self.io.lock();
        self.session.set_blocking(false);
        let result = f();
        self.session.set_blocking(true);
        result
    }
}

fn spawn_keepalive_watcher(shared: Weak<Shared>, interval: Duration) {
    thread::spawn(move || {
        let mut last_sent = Instant::now();
        loop {
            thread::sleep(WATCHER_TICK);
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            if last_sent.elapsed() < interval {
                continue;
            }

            let result = {
                let _io = shared.io.lock();
                shared.session.keepalive_send()
            };
            last_sent = Instant::now();
            if let Err(e) = result {
                if e.code() == ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) {
                    continue;
                }
                tracing::debug!("Keepalive failed for {}: {}", shared.connection_id, e);
                shared.fire_close();
                break;
            }
        }
    });
}

/// Read until the reader would block or reaches EOF
fn drain(reader: &mut impl Read, out: &mut Vec<u8>, buf: &mut [u8]) -> io::Result<(bool, bool)> {
    let mut progress = false;
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok((progress, true)),
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                progress = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Ok((progress, false))
            }
            Err(e) => return Err(e),
        }
    }
}

/// A live libssh2 session
pub struct Ssh2Transport {
    shared: Arc<Shared>,
}

impl Ssh2Transport {
    fn closed_error(&self) -> EngineError {
        EngineError::Connection(format!("Connection {} is closed", self.shared.connection_id))
    }
}

impl Transport for Ssh2Transport {
    fn exec(&self, command: &str) -> EngineResult<ExecOutput> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        let opened = {
            let _io = shared.io.lock();
            shared.session.channel_session().and_then(|mut channel| {
                channel.exec(command)?;
                Ok(channel)
            })
        };
        let mut channel = opened
            .map_err(|e| EngineError::from_transport(format!("Failed to exec: {}", shared.check(e))))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(self.closed_error());
            }

            let polled = shared.poll(|| -> io::Result<(bool, bool)> {
                let (out_progress, out_eof) = drain(&mut channel, &mut stdout, &mut buf)?;
                let (err_progress, err_eof) = drain(&mut channel.stderr(), &mut stderr, &mut buf)?;
                Ok((out_progress || err_progress, out_eof && err_eof && channel.eof()))
            });

            match polled {
                Ok((_, true)) => break,
                Ok((true, false)) => {}
                Ok((false, false)) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(EngineError::Connection(format!("Failed to read command output: {}", e))),
            }
        }

        let status = {
            let _io = shared.io.lock();
            let _ = channel.wait_close();
            channel.exit_status()
        };
        let exit_code = status.map_err(|e| shared.check(e)).unwrap_or(-1);

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    fn open_sftp(&self) -> EngineResult<Arc<dyn SftpChannel>> {
        let shared = &self.shared;
        let opened = {
            let _io = shared.io.lock();
            shared.session.sftp()
        };
        let sftp = opened
            .map_err(|e| EngineError::sftp(format!("Failed to open SFTP subsystem: {}", shared.check(e))))?;
        Ok(Arc::new(Ssh2Sftp::new(sftp, Arc::clone(&shared.io))))
    }

    fn open_tunnel(&self, host: &str, port: u16) -> EngineResult<Box<dyn Tunnel>> {
        let shared = &self.shared;
        let opened = {
            let _io = shared.io.lock();
            shared.session.channel_direct_tcpip(host, port, None)
        };
        let channel = opened.map_err(|e| {
            EngineError::Connection(format!(
                "Failed to open tunnel to {}:{}: {}",
                host,
                port,
                shared.check(e)
            ))
        })?;
        Ok(Box::new(Ssh2Tunnel {
            shared: Arc::clone(shared),
            channel,
        }))
    }

    fn on_close(&self, callback: CloseCallback) {
        *self.shared.on_close.lock() = Some(callback);
    }

    fn is_alive(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.on_close.lock().take();
        let _io = shared.io.lock();
        let _ = shared.session.disconnect(None, "disconnect", None);
    }
}

impl Drop for Ssh2Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// A direct-tcpip channel
struct Ssh2Tunnel {
    shared: Arc<Shared>,
    channel: Channel,
}

impl Read for Ssh2Tunnel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let channel = &mut self.channel;
        self.shared.poll(|| channel.read(buf))
    }
}

impl Write for Ssh2Tunnel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _io = self.shared.io.lock();
        self.channel.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let _io = self.shared.io.lock();
        self.channel.flush()
    }
}

impl Tunnel for Ssh2Tunnel {
    fn eof(&self) -> bool {
        self.channel.eof()
    }

    fn shutdown(&mut self) {
        let _io = self.shared.io.lock();
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
    }
}
