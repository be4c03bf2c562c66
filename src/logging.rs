//! Logging Module
//!
//! Initializes application logging (tracing with a rolling file appender and
//! stdout) and provides a buffered access log writer that batches entries in
//! RAM and flushes them periodically or when the buffer fills.

use crate::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// One access log record, written as a JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub time: DateTime<Utc>,
    pub remote_ip: String,
    pub method: String,
    pub path: String,
    pub http_status: u16,
    pub bytes_sent: u64,
    pub total_time_ms: u64,
    pub from_cache: bool,
    pub user_agent: Option<String>,
    pub request_id: String,
}

/// RAII guard to ensure flush_in_progress is cleared
struct FlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> Drop for FlushGuard<'a> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Buffered access log writer.
///
/// Entries accumulate in RAM and reach disk when the buffer crosses its
/// capacity or the periodic flush task fires. The final flush runs during
/// shutdown.
pub struct AccessLogBuffer {
    buffer: Mutex<Vec<AccessLogEntry>>,
    log_dir: PathBuf,
    hostname: String,
    max_buffer_size: usize,
    flush_in_progress: AtomicBool,
}

impl AccessLogBuffer {
    pub fn new(log_dir: PathBuf, hostname: String, max_buffer_size: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            log_dir,
            hostname,
            max_buffer_size,
            flush_in_progress: AtomicBool::new(false),
        }
    }

    /// Add an entry, flushing when the buffer is full.
    pub fn log(&self, entry: AccessLogEntry) {
        let needs_flush = {
            let mut buffer = match self.buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            buffer.push(entry);
            buffer.len() >= self.max_buffer_size
        };

        if needs_flush {
            if let Err(e) = self.flush() {
                warn!("Access log flush failed: {}", e);
            }
        }
    }

    /// Write all pending entries to the per-host daily log file.
    ///
    /// Returns the number of entries written. Concurrent flushes coalesce:
    /// a flush that finds one already running returns without writing.
    pub fn flush(&self) -> Result<usize> {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }
        let _guard = FlushGuard {
            flag: &self.flush_in_progress,
        };

        let pending: Vec<AccessLogEntry> = {
            let mut buffer = match self.buffer.lock() {
                Ok(buffer) => buffer,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *buffer)
        };
        if pending.is_empty() {
            return Ok(0);
        }

        std::fs::create_dir_all(&self.log_dir)?;
        let file_name = format!(
            "access-{}-{}.log",
            self.hostname,
            Utc::now().format("%Y-%m-%d")
        );
        let path = self.log_dir.join(file_name);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let count = pending.len();
        for entry in pending {
            let line = serde_json::to_string(&entry)
                .map_err(|e| GatewayError::SerializationError(e.to_string()))?;
            writeln!(file, "{}", line)?;
        }

        debug!("Flushed {} access log entries to {}", count, path.display());
        Ok(count)
    }

    /// Number of entries waiting in RAM.
    pub fn pending(&self) -> usize {
        match self.buffer.lock() {
            Ok(buffer) => buffer.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Initialize the tracing subscriber: stdout plus a daily-rolling app log.
///
/// Returns the appender guard; dropping it stops the background writer, so
/// the caller holds it for the process lifetime.
pub fn init(log_level: &str, app_log_dir: &PathBuf) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(app_log_dir)?;
    let file_appender = tracing_appender::rolling::daily(app_log_dir, "storage-gateway.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .try_init()
        .map_err(|e| GatewayError::ConfigError(format!("Failed to initialize logging: {}", e)))?;

    info!("Logging initialized (level: {})", log_level);
    Ok(guard)
}
