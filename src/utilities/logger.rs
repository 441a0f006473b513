//! Asynchronous file logger.
//!
//! A background task receives log records over an mpsc channel and appends
//! them to a file, so job supervision never blocks on log I/O.
//!
//! ```no_run
//! use jobvisor::utilities::logger::init_file_logger;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (logger, task) = init_file_logger("jobvisor.log").await.expect("init logger");
//!     logger.info("Job manager starting up...");
//!     logger.shutdown().await;
//!     let _ = task.await;
//! }
//! ```

use crate::err::Result;
use crate::global_var::{DEBUG_MODE, LOGGER_CELL};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log level for messages.
#[derive(Clone, Copy, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// A simple async logger handle. Cloning creates another sender handle.
#[derive(Clone, Debug)]
pub struct AsyncLogger {
    // None discards every record
    tx: Option<mpsc::Sender<LogRecord>>,
}

impl AsyncLogger {
    fn log<S: Into<String>>(&self, level: LogLevel, msg: S) {
        let str_msg = msg.into();
        // stdout is reserved for request responses
        if *DEBUG_MODE {
            eprintln!("{}: {}", level, &str_msg);
        }
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(LogRecord::new(level, str_msg)) {
            if let mpsc::error::TrySendError::Full(_) = err {
                eprintln!("Failed to send log message: {}", err);
            }
        }
    }

    /// Request the logger task to flush and shut down.
    pub async fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(LogRecord::Shutdown).await;
        }
    }

    pub fn trace<S: Into<String>>(&self, msg: S) {
        self.log(LogLevel::Trace, msg);
    }
    pub fn debug<S: Into<String>>(&self, msg: S) {
        if *DEBUG_MODE {
            self.log(LogLevel::Debug, msg);
        }
    }
    pub fn info<S: Into<String>>(&self, msg: S) {
        self.log(LogLevel::Info, msg);
    }
    pub fn warn<S: Into<String>>(&self, msg: S) {
        self.log(LogLevel::Warn, msg);
    }
    pub fn error<S: Into<String>>(&self, msg: S) {
        self.log(LogLevel::Error, msg);
    }
}

#[derive(Debug)]
enum LogRecord {
    Message {
        level: LogLevel,
        msg: String,
        ts: DateTime<Utc>,
    },
    Shutdown,
}

impl LogRecord {
    fn new(level: LogLevel, msg: String) -> Self {
        Self::Message {
            level,
            msg,
            ts: Utc::now(),
        }
    }

    fn format_line(&self) -> Option<String> {
        match self {
            // 2025-10-08T21:22:33.123Z [LEVEL] message\n
            LogRecord::Message { level, msg, ts } => Some(format!(
                "{} [{}] {}\n",
                ts.to_rfc3339_opts(SecondsFormat::Millis, true),
                level,
                msg
            )),
            LogRecord::Shutdown => None,
        }
    }
}

/// Initialize a file-based async logger. Returns the logger handle and the background task handle.
/// Dropping the last logger handle will close the channel and allow the task to shut down.
pub async fn init_file_logger<P: AsRef<Path>>(path: P) -> Result<(AsyncLogger, JoinHandle<()>)> {
    let path_buf = path.as_ref().to_path_buf();
    if let Some(parent) = path_buf.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path_buf)
        .await?;

    let (tx, mut rx) = mpsc::channel::<LogRecord>(1024);
    let mut writer = BufWriter::new(file);

    let task = tokio::spawn(async move {
        while let Some(rec) = rx.recv().await {
            match rec {
                LogRecord::Message { .. } => {
                    if let Some(line) = rec.format_line() {
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            // Reopen the file, swap the writer, and retry once.
                            let _ = writer.flush().await;
                            match OpenOptions::new()
                                .create(true)
                                .append(true)
                                .open(&path_buf)
                                .await
                            {
                                Ok(new_file) => {
                                    writer = BufWriter::new(new_file);
                                    let _ = writer.write_all(line.as_bytes()).await;
                                }
                                Err(_) => {
                                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                                }
                            }
                        }
                    }
                    if rx.is_empty() {
                        let _ = writer.flush().await;
                    }
                }
                LogRecord::Shutdown => {
                    break;
                }
            }
        }
        let _ = writer.flush().await;
    });

    Ok((AsyncLogger { tx: Some(tx) }, task))
}

pub(crate) struct Logger;

impl Deref for Logger {
    type Target = AsyncLogger;
    fn deref(&self) -> &Self::Target {
        // Library users that never install a file logger get a sink that
        // drops every record instead of a panic.
        LOGGER_CELL.get_or_init(discard_logger)
    }
}

fn discard_logger() -> AsyncLogger {
    AsyncLogger { tx: None }
}
