use crate::err::Result;
use crate::orch_error;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Append-only, line-oriented log for one job. Both output streams of the
/// process write through the same sink, so lines interleave in arrival order
/// and a line is never split by another.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl LogSink {
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. A trailing newline is added when missing. Each line is
    /// flushed before returning so readers see it immediately.
    pub async fn append_line(&self, line: &str) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = match guard.as_mut() {
            Some(f) => f,
            None => return Err(orch_error!("log {} is closed", self.path.display()).into()),
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        if !line.ends_with('\n') {
            buf.push(b'\n');
        }
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    /// Freeze the log. Later appends fail.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut f) = guard.take() {
            f.flush().await?;
            f.sync_all().await?;
        }
        Ok(())
    }
}

/// Tail of a job log together with the number of lines captured so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogTail {
    pub lines: Vec<String>,
    pub total_lines: usize,
}

/// Last `tail` lines of a job log, oldest first. `tail == 0` returns every
/// line. A log that was never created reads as empty. Only the requested
/// lines are held in memory while the file is scanned.
pub async fn read_tail(path: &Path, tail: usize) -> Result<LogTail> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogTail::default()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut kept: VecDeque<String> = VecDeque::new();
    let mut total_lines = 0;
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        total_lines += 1;
        if tail != 0 && kept.len() == tail {
            kept.pop_front();
        }
        let line = String::from_utf8_lossy(&buf);
        kept.push_back(line.trim_end_matches(['\n', '\r']).to_string());
    }
    Ok(LogTail {
        lines: kept.into(),
        total_lines,
    })
}
