//! Stream event log: a bounded ring buffer, optionally persisted as JSONL.
//!
//! Records what happened to each stream (endpoint chosen, lines skipped,
//! retries, terminal outcome) so it can be inspected after the fact through
//! `GET /v1/logs`. Every entry is also forwarded to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_key: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            model_key: None,
            message: message.into(),
            context: None,
        }
    }

    pub fn for_model(mut self, key: impl Into<String>) -> Self {
        self.model_key = Some(key.into());
        self
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

pub struct Logger {
    entries: VecDeque<LogEntry>,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    /// Memory-only logger.
    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            writer: None,
        }
    }

    /// Logger appending to `file_path`, preloaded with the newest entries already in it.
    pub fn with_file(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut logger = Self::in_memory();

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<LogEntry>(&line) {
                    logger.remember(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        logger.writer = Some(BufWriter::new(file));
        Ok(logger)
    }

    pub fn log(&mut self, entry: LogEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{json}");
                let _ = writer.flush();
            }
        }
        self.remember(entry);
    }

    fn remember(&mut self, entry: LogEntry) {
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::with_file(file_path)?))))
    }

    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(Logger::in_memory())))
    }

    pub fn log(&self, entry: LogEntry) {
        let key = entry.model_key.as_deref().unwrap_or("-");
        match entry.level {
            LogLevel::Debug => tracing::debug!(component = %entry.component, model_key = key, "{}", entry.message),
            LogLevel::Info => tracing::info!(component = %entry.component, model_key = key, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(component = %entry.component, model_key = key, "{}", entry.message),
            LogLevel::Error => tracing::error!(component = %entry.component, model_key = key, "{}", entry.message),
        }
        if let Ok(mut logger) = self.0.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    /// Entry attributed to one model stream.
    pub fn model(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        model_key: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.log(LogEntry::new(level, component, message).for_model(model_key));
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}

impl Default for SharedLogger {
    fn default() -> Self {
        Self::in_memory()
    }
}
