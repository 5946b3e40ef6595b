//! File logger for recovery runs
//!
//! Every stage writes tagged lines (`[time] [LEVEL] [MODULE] message`) to a
//! single log file so a long recovery can be audited afterwards. Warnings are
//! also counted per module; stages use the counts for their summaries.

use chrono::Local;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global logger instance
static LOGGER: OnceLock<Mutex<SalvageLogger>> = OnceLock::new();

/// Default log file name, created in the working directory
pub const DEFAULT_LOG_FILE: &str = "salvage.log";

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Main logger struct
pub struct SalvageLogger {
    file: Option<File>,
    min_level: LogLevel,
    warnings: BTreeMap<String, u64>,
}

impl SalvageLogger {
    fn new(path: &Path, min_level: LogLevel) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok();

        if file.is_none() {
            eprintln!("[salvage] Could not open log file {}", path.display());
        }

        Self {
            file,
            min_level,
            warnings: BTreeMap::new(),
        }
    }

    fn log(&mut self, level: LogLevel, module: &str, message: &str) {
        if level == LogLevel::Warn {
            *self.warnings.entry(module.to_string()).or_insert(0) += 1;
        }

        if level < self.min_level {
            return;
        }

        let entry = format!(
            "[{}] [{:5}] [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            module,
            message
        );

        if let Some(ref mut file) = self.file {
            let _ = file.write_all(entry.as_bytes());
        }
    }
}

/// Initialize the global logger. Later calls are ignored.
pub fn init(path: Option<PathBuf>, min_level: LogLevel) {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
    let _ = LOGGER.set(Mutex::new(SalvageLogger::new(&path, min_level)));
}

fn log(level: LogLevel, module: &str, message: &str) {
    if let Some(logger) = LOGGER.get() {
        logger.lock().log(level, module, message);
    }
}

/// Log debug message
pub fn debug(module: &str, message: &str) {
    log(LogLevel::Debug, module, message);
}

/// Log info message
pub fn info(module: &str, message: &str) {
    log(LogLevel::Info, module, message);
}

/// Log warning message
pub fn warn(module: &str, message: &str) {
    log(LogLevel::Warn, module, message);
}

/// Log error message
pub fn error(module: &str, message: &str) {
    log(LogLevel::Error, module, message);
}

/// Number of warnings logged so far for a module (0 when logging is not initialized)
pub fn warning_count(module: &str) -> u64 {
    LOGGER
        .get()
        .and_then(|logger| logger.lock().warnings.get(module).copied())
        .unwrap_or(0)
}

/// Flush the log file
pub fn flush() {
    if let Some(logger) = LOGGER.get() {
        if let Some(ref mut file) = logger.lock().file {
            let _ = file.flush();
        }
    }
}

/// Write a separator line for readability
pub fn separator(label: &str) {
    let msg = format!("========== {} ==========", label);
    info("---", &msg);
}
