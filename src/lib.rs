//! Remote-session engine: SSH connections, SFTP file access, injection-safe
//! remote search and a per-connection priority scheduler.

pub mod command;
pub mod config;
pub mod error;
pub mod keychain;
pub mod logging;
pub mod scheduler;
pub mod sftp;
pub mod ssh;
pub mod state;

pub use error::{EngineError, EngineResult, SftpErrorKind};
pub use scheduler::{Priority, Scheduler};
pub use ssh::{Connection, ConnectionRegistry, ConnectionState, Credential};
pub use state::{Engine, EngineOptions};
