//! Durable event logs
//!
//! Publishing `log.<channel>` appends the payload to a per-channel file of
//! the current log session: `<log_root>/<session>/<channel>.log`. A session is
//! just a subdirectory; rotating switches to a new one and forgets the open
//! files of the previous session.

use chrono::{Local, SecondsFormat};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum LogSinkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid log pattern '{0}'")]
    BadPattern(String),
    #[error("No such logs: {0}")]
    NoSuchLogs(String),
    #[error("Refusing path outside the log directory: {0}")]
    Traversal(String),
}

/// Destination of `log.*` events
///
/// Called synchronously from the publishing session's task, after the broker
/// lock is released, so a record is on disk before the next frame of that
/// session is handled and a following `get-logs` sees it.
pub trait LogSink: Send + Sync + std::fmt::Debug {
    /// Append one record to `channel`. Never fails: errors are logged.
    ///
    /// May block the calling worker for the duration of a small file append.
    fn log_event(&self, channel: &str, payload: &[u8]);

    /// Switch to a new session directory.
    fn rotate(&self, session: &str) -> Result<(), LogSinkError>;

    /// Concatenated content of the current session's channels matching `pattern`.
    fn read_logs(&self, pattern: &str) -> Result<Vec<u8>, LogSinkError>;

    fn session(&self) -> String;
}

/// Session name derived from the current local time
pub fn session_name_now() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

fn check_component(name: &str) -> Result<(), LogSinkError> {
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains(['/', '\\', '\0'])
    {
        return Err(LogSinkError::Traversal(name.to_string()));
    }
    Ok(())
}

#[derive(Debug)]
struct SessionState {
    name: String,
    files: HashMap<String, File>,
}

#[derive(Debug)]
pub struct FileLogSink {
    root: PathBuf,
    state: Mutex<SessionState>,
}

impl FileLogSink {
    /// Open a sink under `root`, starting a session named after the current time.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_session(root, session_name_now())
    }

    pub fn with_session(root: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        let sink = Self {
            root: root.into(),
            state: Mutex::new(SessionState {
                name: session.into(),
                files: HashMap::new(),
            }),
        };
        let dir = sink.session_dir(&sink.state.lock().name);
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("[Log] Could not create log directory {}: {}", dir.display(), e);
        }
        sink
    }

    fn session_dir(&self, session: &str) -> PathBuf {
        self.root.join(session)
    }

    fn open_channel(&self, session: &str, channel: &str) -> io::Result<File> {
        let path = self.session_dir(session).join(format!("{}.log", channel));
        debug!("[Log] Opening {}", path.display());
        OpenOptions::new().create(true).append(true).open(path)
    }
}

impl LogSink for FileLogSink {
    fn log_event(&self, channel: &str, payload: &[u8]) {
        if let Err(e) = check_component(channel) {
            error!("[Log] {}", e);
            return;
        }

        let mut state = self.state.lock();
        let SessionState { name, files } = &mut *state;

        let file = match files.get_mut(channel) {
            Some(file) => file,
            None => match self.open_channel(name, channel) {
                Ok(file) => files.entry(channel.to_string()).or_insert(file),
                Err(e) => {
                    error!("[Log] Could not create log file for {}: {}", channel, e);
                    return;
                }
            },
        };

        let mut line = Vec::with_capacity(payload.len() + 40);
        line.extend_from_slice(
            Local::now()
                .to_rfc3339_opts(SecondsFormat::Millis, false)
                .as_bytes(),
        );
        line.push(b' ');
        line.extend_from_slice(payload);
        line.push(b'\n');

        if let Err(e) = file.write_all(&line) {
            error!("[Log] Could not write to {}: {}", channel, e);
        }
    }

    fn rotate(&self, session: &str) -> Result<(), LogSinkError> {
        check_component(session)?;
        debug!("[Log] Rotating to \"{}\"", session);

        fs::create_dir_all(self.session_dir(session))?;
        let mut state = self.state.lock();
        state.name = session.to_string();
        state.files.clear();
        Ok(())
    }

    fn read_logs(&self, pattern: &str) -> Result<Vec<u8>, LogSinkError> {
        if pattern.contains("..") || pattern.contains(['/', '\\']) {
            return Err(LogSinkError::Traversal(pattern.to_string()));
        }

        let session = self.session();
        let dir = glob::Pattern::escape(&self.session_dir(&session).to_string_lossy());
        let full = format!("{}/{}.log", dir, pattern);

        let paths = glob::glob(&full).map_err(|_| LogSinkError::BadPattern(pattern.to_string()))?;
        let mut files: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
        if files.is_empty() {
            return Err(LogSinkError::NoSuchLogs(pattern.to_string()));
        }
        files.sort();

        let mut content = Vec::new();
        for path in files {
            content.extend(fs::read(&path)?);
        }
        Ok(content)
    }

    fn session(&self) -> String {
        self.state.lock().name.clone()
    }
}
