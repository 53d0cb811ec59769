//! In-memory transport for tests: a fake filesystem, scripted exec output
//! and echoing tunnels.

use crate::error::{EngineError, EngineResult};
use crate::ssh::auth::AuthConfig;
use crate::ssh::transport::{
    CloseCallback, ConnectRequest, Connector, ExecOutput, FileAttributes, SftpChannel, Transport,
    Tunnel,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const HOME: &str = "/home/tester";

type Responder = Arc<dyn Fn(&str) -> ExecOutput + Send + Sync>;

enum Node {
    File(Vec<u8>),
    Dir,
}

/// Flat path -> node map
pub struct MockFs {
    nodes: Mutex<BTreeMap<String, Node>>,
}

impl MockFs {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        for dir in ["/", "/home", HOME, "/tmp"] {
            nodes.insert(dir.to_string(), Node::Dir);
        }
        Self {
            nodes: Mutex::new(nodes),
        }
    }

    fn parent(path: &str) -> String {
        match path.trim_end_matches('/').rsplit_once('/') {
            Some(("", _)) | None => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
        }
    }

    fn attrs(node: &Node) -> FileAttributes {
        match node {
            Node::File(data) => FileAttributes {
                size: data.len() as u64,
                mtime: Some(1_700_000_000),
                mode: Some(0o100644),
                uid: Some(1000),
                gid: Some(1000),
            },
            Node::Dir => FileAttributes {
                size: 4096,
                mtime: Some(1_700_000_000),
                mode: Some(0o040755),
                uid: Some(1000),
                gid: Some(1000),
            },
        }
    }

    fn require_parent_dir(nodes: &BTreeMap<String, Node>, path: &str) -> EngineResult<()> {
        match nodes.get(&Self::parent(path)) {
            Some(Node::Dir) => Ok(()),
            _ => Err(EngineError::not_found(path)),
        }
    }

    fn children(nodes: &BTreeMap<String, Node>, dir: &str) -> Vec<String> {
        nodes
            .keys()
            .filter(|p| p.as_str() != dir && Self::parent(p) == dir)
            .cloned()
            .collect()
    }
}

/// Behavior shared by a connector and every transport it hands out
struct Script {
    responder: Mutex<Responder>,
    exec_delay: Mutex<Duration>,
}

impl Script {
    fn new() -> Arc<Self> {
        let silent: Responder = Arc::new(|_: &str| ExecOutput::default());
        Arc::new(Self {
            responder: Mutex::new(silent),
            exec_delay: Mutex::new(Duration::ZERO),
        })
    }
}

pub struct MockTransport {
    fs: Arc<MockFs>,
    script: Arc<Script>,
    commands: Mutex<Vec<String>>,
    alive: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
    tunnels: Mutex<Vec<(String, u16)>>,
    sftp_opens: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_script(Script::new())
    }

    fn with_script(script: Arc<Script>) -> Arc<Self> {
        Arc::new(Self {
            fs: Arc::new(MockFs::new()),
            script,
            commands: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            on_close: Mutex::new(None),
            tunnels: Mutex::new(Vec::new()),
            sftp_opens: AtomicUsize::new(0),
        })
    }

    /// Simulate the server dropping the session
    pub fn close_remote(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn tunnels_opened(&self) -> Vec<(String, u16)> {
        self.tunnels.lock().clone()
    }

    pub fn sftp_opens(&self) -> usize {
        self.sftp_opens.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn exec(&self, command: &str) -> EngineResult<ExecOutput> {
        if !self.is_alive() {
            return Err(EngineError::Connection("Session closed".into()));
        }
        self.commands.lock().push(command.to_string());

        let delay = *self.script.exec_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let responder = Arc::clone(&*self.script.responder.lock());
        Ok(responder(command))
    }

    fn open_sftp(&self) -> EngineResult<Arc<dyn SftpChannel>> {
        if !self.is_alive() {
            return Err(EngineError::Connection("Session closed".into()));
        }
        self.sftp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSftp {
            fs: Arc::clone(&self.fs),
            open: AtomicBool::new(true),
        }))
    }

    fn open_tunnel(&self, host: &str, port: u16) -> EngineResult<Box<dyn Tunnel>> {
        self.tunnels.lock().push((host.to_string(), port));
        Ok(Box::new(EchoTunnel::default()))
    }

    fn on_close(&self, callback: CloseCallback) {
        *self.on_close.lock() = Some(callback);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.on_close.lock().take();
    }
}

struct MockSftp {
    fs: Arc<MockFs>,
    open: AtomicBool,
}

impl MockSftp {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::sftp("SFTP channel closed"))
        }
    }
}

impl SftpChannel for MockSftp {
    fn realpath(&self, path: &str) -> EngineResult<String> {
        self.ensure_open()?;
        Ok(if path == "." { HOME.to_string() } else { path.to_string() })
    }

    fn readdir(&self, path: &str) -> EngineResult<Vec<(String, FileAttributes)>> {
        self.ensure_open()?;
        let nodes = self.fs.nodes.lock();
        match nodes.get(path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(EngineError::sftp(format!("Not a directory: {}", path))),
            None => return Err(EngineError::not_found(path)),
        }

        let dir_attrs = MockFs::attrs(&Node::Dir);
        let mut entries = vec![(".".to_string(), dir_attrs.clone()), ("..".to_string(), dir_attrs)];
        for child in MockFs::children(&nodes, path) {
            let name = child.rsplit('/').next().unwrap_or(&child).to_string();
            entries.push((name, MockFs::attrs(&nodes[&child])));
        }
        Ok(entries)
    }

    fn stat(&self, path: &str) -> EngineResult<FileAttributes> {
        self.ensure_open()?;
        self.fs
            .nodes
            .lock()
            .get(path)
            .map(MockFs::attrs)
            .ok_or_else(|| EngineError::not_found(path))
    }

    fn read(&self, path: &str) -> EngineResult<Vec<u8>> {
        self.ensure_open()?;
        match self.fs.nodes.lock().get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(EngineError::sftp(format!("Is a directory: {}", path))),
            None => Err(EngineError::not_found(path)),
        }
    }

    fn write(&self, path: &str, contents: &[u8]) -> EngineResult<()> {
        self.ensure_open()?;
        let mut nodes = self.fs.nodes.lock();
        MockFs::require_parent_dir(&nodes, path)?;
        if matches!(nodes.get(path), Some(Node::Dir)) {
            return Err(EngineError::sftp(format!("Is a directory: {}", path)));
        }
        nodes.insert(path.to_string(), Node::File(contents.to_vec()));
        Ok(())
    }

    fn mkdir(&self, path: &str) -> EngineResult<()> {
        self.ensure_open()?;
        let mut nodes = self.fs.nodes.lock();
        MockFs::require_parent_dir(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(EngineError::sftp(format!("Failed to create directory {}: exists", path)));
        }
        nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    fn rmdir(&self, path: &str) -> EngineResult<()> {
        self.ensure_open()?;
        let mut nodes = self.fs.nodes.lock();
        match nodes.get(path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(EngineError::sftp(format!("Not a directory: {}", path))),
            None => return Err(EngineError::not_found(path)),
        }
        if !MockFs::children(&nodes, path).is_empty() {
            return Err(EngineError::sftp(format!("Failed to remove directory {}: not empty", path)));
        }
        nodes.remove(path);
        Ok(())
    }

    fn unlink(&self, path: &str) -> EngineResult<()> {
        self.ensure_open()?;
        let mut nodes = self.fs.nodes.lock();
        match nodes.get(path) {
            Some(Node::File(_)) => {
                nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir) => Err(EngineError::sftp(format!("Is a directory: {}", path))),
            None => Err(EngineError::not_found(path)),
        }
    }

    fn rename(&self, from: &str, to: &str) -> EngineResult<()> {
        self.ensure_open()?;
        let mut nodes = self.fs.nodes.lock();
        MockFs::require_parent_dir(&nodes, to)?;
        let node = nodes.remove(from).ok_or_else(|| EngineError::not_found(from))?;
        nodes.insert(to.to_string(), node);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Echoes written bytes back; reads return `WouldBlock` while empty
#[derive(Default)]
struct EchoTunnel {
    pending: VecDeque<u8>,
}

impl Read for EchoTunnel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for EchoTunnel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Tunnel for EchoTunnel {
    fn eof(&self) -> bool {
        false
    }

    fn shutdown(&mut self) {}
}

/// Connector handing out `MockTransport`s, with scripted failures
pub struct MockConnector {
    script: Arc<Script>,
    failures: Mutex<VecDeque<EngineError>>,
    connect_delay: Mutex<Duration>,
    connects: AtomicUsize,
    last_transport: Mutex<Option<Arc<MockTransport>>>,
    last_auth: Mutex<Option<AuthConfig>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Script::new(),
            failures: Mutex::new(VecDeque::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            connects: AtomicUsize::new(0),
            last_transport: Mutex::new(None),
            last_auth: Mutex::new(None),
        })
    }

    /// Make the next connect attempt fail with `error`
    pub fn fail_next(&self, error: EngineError) {
        self.failures.lock().push_back(error);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        *self.script.exec_delay.lock() = delay;
    }

    /// Answer every exec, on current and future transports
    pub fn on_exec<F>(&self, responder: F)
    where
        F: Fn(&str) -> ExecOutput + Send + Sync + 'static,
    {
        *self.script.responder.lock() = Arc::new(responder);
    }

    /// Connect attempts that reached the connector
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.last_transport.lock().clone()
    }

    pub fn last_auth(&self) -> Option<AuthConfig> {
        self.last_auth.lock().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, request: ConnectRequest<'_>) -> EngineResult<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_auth.lock() = Some(request.auth.clone());

        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let transport = MockTransport::with_script(Arc::clone(&self.script));
        *self.last_transport.lock() = Some(Arc::clone(&transport));
        Ok(transport)
    }
}
