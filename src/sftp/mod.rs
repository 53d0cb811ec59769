//! SFTP file access
//!
//! `RemoteFile` is what consumers see for listings and stat results.
//! `Ssh2Sftp` adapts an `ssh2::Sftp` handle to the `SftpChannel` seam.

use crate::error::{EngineError, EngineResult};
use crate::ssh::session::SessionLock;
use crate::ssh::transport::{FileAttributes, SftpChannel};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ssh2::{ErrorCode, FileStat, Sftp};
use std::io::{Read, Write};
use std::path::Path;

/// SFTP status codes we branch on
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;

/// Remote file/directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    /// Milliseconds since the epoch
    pub modified: i64,
    pub connection_id: String,
    /// Numeric uid as text; SFTP v3 listings carry no user names
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Numeric gid as text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// `rwxr-xr-x` style, listings only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

impl RemoteFile {
    pub fn from_stat(name: &str, path: &str, attrs: &FileAttributes, connection_id: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            is_directory: attrs.is_dir(),
            size: attrs.size,
            modified: attrs.mtime.map(|t| t as i64 * 1000).unwrap_or(0),
            connection_id: connection_id.to_string(),
            owner: None,
            group: None,
            permissions: None,
        }
    }

    pub fn from_listing(name: &str, path: &str, attrs: &FileAttributes, connection_id: &str) -> Self {
        Self {
            owner: attrs.uid.map(|u| u.to_string()),
            group: attrs.gid.map(|g| g.to_string()),
            permissions: Some(format_permissions(attrs.mode.unwrap_or(0))),
            ..Self::from_stat(name, path, attrs, connection_id)
        }
    }
}

/// Join a directory and a child name without doubling the separator
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last path component, or the whole path for `/`
pub fn file_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return path.to_string();
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// Directories first, then by name within each group
pub fn sort_listing(entries: &mut [RemoteFile]) {
    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Format the permission bits of a mode as `rwxr-xr-x`
pub fn format_permissions(mode: u32) -> String {
    const FLAGS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];

    FLAGS
        .iter()
        .map(|(bit, ch)| if mode & bit != 0 { *ch } else { '-' })
        .collect()
}

fn attributes(stat: &FileStat) -> FileAttributes {
    FileAttributes {
        size: stat.size.unwrap_or(0),
        mtime: stat.mtime,
        mode: stat.perm,
        uid: stat.uid,
        gid: stat.gid,
    }
}

/// Map an ssh2 error for `path` into the engine taxonomy
pub fn map_sftp_error(err: ssh2::Error, operation: &str, path: &str) -> EngineError {
    match err.code() {
        ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE) => EngineError::not_found(path),
        ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => EngineError::permission_denied(path),
        _ => EngineError::sftp(format!("Failed to {} {}: {}", operation, path, err)),
    }
}

/// `SftpChannel` over libssh2
pub struct Ssh2Sftp {
    sftp: Mutex<Option<Sftp>>,
    io: SessionLock,
}

impl Ssh2Sftp {
    pub fn new(sftp: Sftp, io: SessionLock) -> Self {
        Self {
            sftp: Mutex::new(Some(sftp)),
            io,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&Sftp) -> EngineResult<T>) -> EngineResult<T> {
        let _io = self.io.lock();
        let guard = self.sftp.lock();
        let sftp = guard
            .as_ref()
            .ok_or_else(|| EngineError::sftp("SFTP channel closed"))?;
        f(sftp)
    }
}

impl SftpChannel for Ssh2Sftp {
    fn realpath(&self, path: &str) -> EngineResult<String> {
        self.with(|sftp| {
            sftp.realpath(Path::new(path))
                .map(|p| p.to_string_lossy().to_string())
                .map_err(|e| map_sftp_error(e, "resolve", path))
        })
    }

    fn readdir(&self, path: &str) -> EngineResult<Vec<(String, FileAttributes)>> {
        self.with(|sftp| {
            let entries = sftp
                .readdir(Path::new(path))
                .map_err(|e| map_sftp_error(e, "list", path))?;
            Ok(entries
                .into_iter()
                .map(|(entry_path, stat)| {
                    let name = entry_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    (name, attributes(&stat))
                })
                .collect())
        })
    }

    fn stat(&self, path: &str) -> EngineResult<FileAttributes> {
        self.with(|sftp| {
            sftp.stat(Path::new(path))
                .map(|s| attributes(&s))
                .map_err(|e| map_sftp_error(e, "stat", path))
        })
    }

    fn read(&self, path: &str) -> EngineResult<Vec<u8>> {
        self.with(|sftp| {
            let mut file = sftp
                .open(Path::new(path))
                .map_err(|e| map_sftp_error(e, "open", path))?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(|e| EngineError::sftp(format!("Failed to read {}: {}", path, e)))?;
            Ok(contents)
        })
    }

    fn write(&self, path: &str, contents: &[u8]) -> EngineResult<()> {
        self.with(|sftp| {
            let mut file = sftp
                .create(Path::new(path))
                .map_err(|e| map_sftp_error(e, "create", path))?;
            file.write_all(contents)
                .map_err(|e| EngineError::sftp(format!("Failed to write {}: {}", path, e)))?;
            Ok(())
        })
    }

    fn mkdir(&self, path: &str) -> EngineResult<()> {
        self.with(|sftp| {
            sftp.mkdir(Path::new(path), 0o755)
                .map_err(|e| map_sftp_error(e, "create directory", path))
        })
    }

    fn rmdir(&self, path: &str) -> EngineResult<()> {
        self.with(|sftp| {
            sftp.rmdir(Path::new(path))
                .map_err(|e| map_sftp_error(e, "remove directory", path))
        })
    }

    fn unlink(&self, path: &str) -> EngineResult<()> {
        self.with(|sftp| {
            sftp.unlink(Path::new(path))
                .map_err(|e| map_sftp_error(e, "delete", path))
        })
    }

    fn rename(&self, from: &str, to: &str) -> EngineResult<()> {
        self.with(|sftp| {
            sftp.rename(Path::new(from), Path::new(to), None)
                .map_err(|e| map_sftp_error(e, "rename", from))
        })
    }

    fn close(&self) {
        let _io = self.io.lock();
        self.sftp.lock().take();
    }
}
