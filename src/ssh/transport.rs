//! Transport seams between a `Connection` and the SSH library.
//!
//! All methods are blocking, matching libssh2. The connection layer moves
//! every call onto the blocking pool and races it against a timeout.

use crate::config::{ConnectionSettings, HostConfig};
use crate::error::EngineResult;
use crate::ssh::auth::AuthConfig;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Collected result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Unix mode bits for a directory
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;

/// Attributes reported by the SFTP server for one path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: u64,
    /// Seconds since the epoch
    pub mtime: Option<u64>,
    /// Full st_mode, including the file type bits
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl FileAttributes {
    pub fn is_dir(&self) -> bool {
        self.mode.map(|m| m & S_IFMT == S_IFDIR).unwrap_or(false)
    }
}

/// Everything needed to open a transport session
pub struct ConnectRequest<'a> {
    pub connection_id: &'a str,
    pub host: &'a HostConfig,
    pub auth: &'a AuthConfig,
    pub settings: &'a ConnectionSettings,
    /// Where `known_hosts` lives
    pub config_dir: Option<PathBuf>,
}

/// Callback fired once when the transport notices the remote end went away
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Opens authenticated transport sessions
pub trait Connector: Send + Sync {
    fn connect(&self, request: ConnectRequest<'_>) -> EngineResult<Arc<dyn Transport>>;
}

/// One authenticated SSH session
pub trait Transport: Send + Sync {
    /// Run a command through the remote shell and collect its output
    fn exec(&self, command: &str) -> EngineResult<ExecOutput>;

    /// Open a new SFTP subsystem channel
    fn open_sftp(&self) -> EngineResult<Arc<dyn SftpChannel>>;

    /// Open a direct-tcpip channel to `host:port` as seen from the remote side
    fn open_tunnel(&self, host: &str, port: u16) -> EngineResult<Box<dyn Tunnel>>;

    /// Register the unsolicited-close callback. Fired at most once.
    fn on_close(&self, callback: CloseCallback);

    fn is_alive(&self) -> bool;

    /// End the session. Does not fire the close callback.
    fn close(&self);
}

/// File-transfer sub-session
pub trait SftpChannel: Send + Sync {
    fn realpath(&self, path: &str) -> EngineResult<String>;
    /// Entries of `path` as (name, attributes), `.` and `..` included if the server sends them
    fn readdir(&self, path: &str) -> EngineResult<Vec<(String, FileAttributes)>>;
    fn stat(&self, path: &str) -> EngineResult<FileAttributes>;
    fn read(&self, path: &str) -> EngineResult<Vec<u8>>;
    fn write(&self, path: &str, contents: &[u8]) -> EngineResult<()>;
    fn mkdir(&self, path: &str) -> EngineResult<()>;
    fn rmdir(&self, path: &str) -> EngineResult<()>;
    fn unlink(&self, path: &str) -> EngineResult<()>;
    fn rename(&self, from: &str, to: &str) -> EngineResult<()>;
    fn close(&self);
}

/// A forwarded byte stream.
///
/// Reads return `WouldBlock`/`TimedOut` when no data is pending.
pub trait Tunnel: Read + Write + Send {
    fn eof(&self) -> bool;
    fn shutdown(&mut self);
}
