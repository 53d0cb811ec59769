use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum lines to keep in memory ring buffer
const MAX_RING_BUFFER_LINES: usize = 10_000;

/// Maximum line length before truncation
const MAX_LINE_LENGTH: usize = 2048;

/// Maximum log file size before rotation (5 MB)
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

const LOG_FILE_NAME: &str = "sshdeck.log";

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        r"(?s)-----BEGIN[^-]*KEY-----.*?-----END[^-]*KEY-----",
        // Authorization headers
        r"(?i)authorization\s*:\s*(bearer|basic)\s+[^\s]+",
        // key=value secrets
        r#"(?i)(password|passwd|pwd|secret|token|api[_-]?key|private[_-]?key|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#,
        // Long base64 blobs
        r"[A-Za-z0-9+/]{64,}={0,2}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Redact secrets and truncate overly long lines
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result = format!("{}... [truncated]", &result[..cut]);
    }

    result
}

/// Sanitize a JSON value recursively, blanking secret-looking keys
fn sanitize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(sanitize(s)),
        serde_json::Value::Object(map) => {
            let mut new_map = serde_json::Map::new();
            for (k, v) in map {
                let key_lower = k.to_lowercase();
                let secret = ["password", "secret", "token", "passphrase", "credential", "key"]
                    .iter()
                    .any(|needle| key_lower.contains(needle));
                if secret {
                    new_map.insert(k.clone(), serde_json::Value::String("[REDACTED]".to_string()));
                } else {
                    new_map.insert(k.clone(), sanitize_json(v));
                }
            }
            serde_json::Value::Object(new_map)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sanitize_json).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSubsystem {
    Connection,
    Sftp,
    Search,
    Forward,
    Scheduler,
    Credentials,
    Engine,
}

impl std::fmt::Display for LogSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogSubsystem::Connection => "connection",
            LogSubsystem::Sftp => "sftp",
            LogSubsystem::Search => "search",
            LogSubsystem::Forward => "forward",
            LogSubsystem::Scheduler => "scheduler",
            LogSubsystem::Credentials => "credentials",
            LogSubsystem::Engine => "engine",
        };
        write!(f, "{}", name)
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub level: LogLevel,
    pub subsystem: LogSubsystem,
    pub connection_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogLine {
    pub fn new(level: LogLevel, subsystem: LogSubsystem, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level,
            subsystem,
            connection_id: None,
            message: sanitize(&message.into()),
            details: None,
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(sanitize_json(&details));
        self
    }
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let time = chrono::DateTime::from_timestamp_millis(self.timestamp)
            .map(|t| t.format("%H:%M:%S%.3f").to_string())
            .unwrap_or_default();
        match self.connection_id {
            Some(ref id) => write!(f, "{} {:5} [{}] {}: {}", time, self.level, self.subsystem, id, self.message),
            None => write!(f, "{} {:5} [{}] {}", time, self.level, self.subsystem, self.message),
        }
    }
}

/// Filter for `OutputLog::recent`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Minimum level
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub subsystem: Option<LogSubsystem>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub since: Option<i64>,
}

impl LogFilter {
    fn matches(&self, line: &LogLine) -> bool {
        if let Some(ref id) = self.connection_id {
            if line.connection_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(level) = self.level {
            if line.level < level {
                return false;
            }
        }
        if let Some(subsystem) = self.subsystem {
            if line.subsystem != subsystem {
                return false;
            }
        }
        if let Some(ref search) = self.search {
            if !line.message.to_lowercase().contains(&search.to_lowercase()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if line.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Diagnostic output sink: ring buffer plus optional JSONL file
pub struct OutputLog {
    ring_buffer: RwLock<VecDeque<LogLine>>,
    log_file_path: Option<PathBuf>,
}

impl OutputLog {
    /// Memory-only sink
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            ring_buffer: RwLock::new(VecDeque::new()),
            log_file_path: None,
        })
    }

    /// Sink persisted under `<config_dir>/logs`, preloaded with the existing file
    pub fn with_file(config_dir: &Path) -> std::io::Result<Arc<Self>> {
        let logs_dir = config_dir.join("logs");
        fs::create_dir_all(&logs_dir)?;

        let log = Self {
            ring_buffer: RwLock::new(VecDeque::new()),
            log_file_path: Some(logs_dir.join(LOG_FILE_NAME)),
        };
        log.load_existing_logs();
        Ok(Arc::new(log))
    }

    fn load_existing_logs(&self) {
        let Some(ref path) = self.log_file_path else {
            return;
        };
        let Ok(file) = File::open(path) else {
            return;
        };

        let mut buffer = self.ring_buffer.write();
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            if let Ok(log_line) = serde_json::from_str::<LogLine>(&line) {
                if buffer.len() >= MAX_RING_BUFFER_LINES {
                    buffer.pop_front();
                }
                buffer.push_back(log_line);
            }
        }
    }

    pub fn log(&self, entry: LogLine) {
        {
            let mut buffer = self.ring_buffer.write();
            if buffer.len() >= MAX_RING_BUFFER_LINES {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }

        self.write_to_file(&entry);
    }

    /// Log a message about one connection
    pub fn connection(
        &self,
        level: LogLevel,
        subsystem: LogSubsystem,
        connection_id: &str,
        message: impl Into<String>,
    ) {
        self.log(LogLine::new(level, subsystem, message).with_connection(connection_id));
    }

    fn write_to_file(&self, entry: &LogLine) {
        let Some(ref path) = self.log_file_path else {
            return;
        };

        if let Ok(metadata) = fs::metadata(path) {
            if metadata.len() > MAX_LOG_FILE_SIZE {
                let rotated = path.with_extension("log.1");
                let _ = fs::remove_file(&rotated);
                let _ = fs::rename(path, &rotated);
            }
        }

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            if let Ok(json) = serde_json::to_string(entry) {
                let _ = writeln!(file, "{}", json);
            }
        }
    }

    /// Last `max_lines` entries matching `filter`, oldest first
    pub fn recent(&self, max_lines: usize, filter: Option<&LogFilter>) -> Vec<LogLine> {
        let buffer = self.ring_buffer.read();
        let mut logs: Vec<LogLine> = buffer
            .iter()
            .filter(|line| filter.map(|f| f.matches(line)).unwrap_or(true))
            .cloned()
            .collect();

        if logs.len() > max_lines {
            logs = logs.split_off(logs.len() - max_lines);
        }
        logs
    }

    pub fn len(&self) -> usize {
        self.ring_buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the ring buffer (does not delete file logs)
    pub fn clear_view(&self) {
        self.ring_buffer.write().clear();
    }

    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file_path.as_deref()
    }
}
