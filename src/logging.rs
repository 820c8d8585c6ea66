//! Per-request audit log: a bounded in-memory ring mirrored to a JSONL file.
//!
//! Records never contain message bodies or keys, only sizes and outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    ChatCompletion,
    TextCompletion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed { processing_ms: u64 },
    Failed { code: String, stage: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub request_type: RequestKind,
    pub model_alias: String,
    pub stream: bool,
    /// Serialized size of the inbound request in bytes.
    pub request_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_length: Option<usize>,
    pub outcome: RequestOutcome,
}

struct RequestLogFile {
    entries: VecDeque<RequestRecord>,
    writer: Option<BufWriter<File>>,
}

impl RequestLogFile {
    fn open(file_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<RequestRecord>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            entries,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            writer: None,
        }
    }

    fn record(&mut self, entry: RequestRecord) {
        if let Some(ref mut writer) = self.writer {
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    if let Err(e) = writeln!(writer, "{json}").and_then(|()| writer.flush()) {
                        tracing::warn!(error = %e, "failed to append request log");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize request record"),
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

/// Shared handle to the request log.
#[derive(Clone)]
pub struct RequestLog {
    inner: Arc<Mutex<RequestLogFile>>,
    path: Option<PathBuf>,
}

impl RequestLog {
    /// Open (or create) a JSONL log, replaying existing records into the ring.
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = file_path.as_ref().to_path_buf();
        Ok(Self {
            inner: Arc::new(Mutex::new(RequestLogFile::open(&path)?)),
            path: Some(path),
        })
    }

    /// A log that only keeps the in-memory ring.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RequestLogFile::in_memory())),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, entry: RequestRecord) {
        if let Ok(mut log) = self.inner.lock() {
            log.record(entry);
        }
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        self.inner
            .lock()
            .map(|log| log.recent(limit))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for RequestLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLog").field("path", &self.path).finish()
    }
}

/// Render a key as its first and last four characters with the middle starred.
/// Keys shorter than eight characters are hidden entirely.
pub fn mask_api_key(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}
