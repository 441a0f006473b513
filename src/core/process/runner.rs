use crate::core::process::LogSink;
use crate::err::{JobError, JobResultOf};
use crate::global_var::LOGGER;
use crate::orch_error;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long SIGKILL gets before a process is declared stuck.
pub const KILL_WAIT: Duration = Duration::from_secs(5);
/// Output still buffered in the pipes after exit gets this long to drain.
/// Orphaned grandchildren can hold a pipe open forever.
pub const PUMP_DRAIN: Duration = Duration::from_secs(2);
/// Longest output segment held back while waiting for a line terminator.
const MAX_SEGMENT: usize = 64 * 1024;

/// A command after resolution: absolute program plus final argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ResolvedCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Real exit code, or `128 + signal` when killed by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the exit status itself could not be collected.
    pub error: Option<String>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none() && self.error.is_none()
    }

    pub fn describe(&self) -> String {
        if let Some(e) = &self.error {
            return format!("failed to collect exit status: {}", e);
        }
        match (self.signal, self.exit_code) {
            (Some(sig), _) => {
                let name = Signal::try_from(sig)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| format!("signal {}", sig));
                format!("process terminated by {}", name)
            }
            (None, Some(code)) => format!("process exited with code {}", code),
            (None, None) => String::from("process ended without an exit code"),
        }
    }
}

/// Signalling side of a running process, shareable between the canceller,
/// the timeout timer and the watcher.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: u32,
    exited: watch::Receiver<bool>,
    escalated: Arc<AtomicBool>,
}

impl ProcessControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// True once SIGKILL had to be sent.
    pub fn escalated(&self) -> bool {
        self.escalated.load(Ordering::SeqCst)
    }

    fn signal_group(&self, signal: Signal) -> JobResultOf<()> {
        LOGGER.info(format!("Sending {} to process group {}", signal, self.pid));
        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(orch_error!("failed to send {} to group {}: {}", signal, self.pid, e).into()),
        }
    }

    async fn wait_exited(&self, limit: Duration) -> bool {
        let mut rx = self.exited.clone();
        // a closed channel means the handle is gone and kill_on_drop fired
        matches!(
            tokio::time::timeout(limit, rx.wait_for(|exited| *exited)).await,
            Ok(_)
        )
    }

    /// SIGTERM the process group, then SIGKILL after `grace`. Returns whether
    /// SIGKILL was needed.
    pub async fn terminate(&self, grace: Duration) -> JobResultOf<bool> {
        if self.has_exited() {
            return Ok(false);
        }
        self.signal_group(Signal::SIGTERM)?;
        if self.wait_exited(grace).await {
            return Ok(false);
        }

        LOGGER.warn(format!(
            "Process {} ignored SIGTERM for {}s, escalating to SIGKILL",
            self.pid,
            grace.as_secs()
        ));
        self.escalated.store(true, Ordering::SeqCst);
        self.signal_group(Signal::SIGKILL)?;
        if self.wait_exited(KILL_WAIT).await {
            return Ok(true);
        }
        Err(JobError::CancellationTimeout {
            pid: self.pid,
            grace_secs: grace.as_secs(),
        })
    }
}

/// Owning side of a started process. Consumed by [`ProcessRunner::wait`].
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    pumps: Vec<JoinHandle<()>>,
    exited_tx: watch::Sender<bool>,
    control: ProcessControl,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }
}

/// Read the next output segment into `buf`, without its terminator. A
/// segment ends at `\n`, at `\r` (progress bars redraw with a bare carriage
/// return), or once it reaches `MAX_SEGMENT` bytes. `\r\n` counts as one
/// terminator. Returns `false` at end of stream when nothing was read.
async fn read_segment<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    after_cr: &mut bool,
) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(!buf.is_empty());
        }
        let skip = usize::from(std::mem::take(after_cr) && chunk[0] == b'\n');
        let rest = &chunk[skip..];
        let room = MAX_SEGMENT.saturating_sub(buf.len());
        match rest.iter().take(room).position(|b| *b == b'\n' || *b == b'\r') {
            Some(pos) => {
                buf.extend_from_slice(&rest[..pos]);
                *after_cr = rest[pos] == b'\r';
                reader.consume(skip + pos + 1);
                return Ok(true);
            }
            None => {
                let take = rest.len().min(room);
                buf.extend_from_slice(&rest[..take]);
                reader.consume(skip + take);
                if buf.len() >= MAX_SEGMENT {
                    return Ok(true);
                }
            }
        }
    }
}

fn pump<R>(reader: R, sink: Arc<LogSink>, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        let mut after_cr = false;
        let mut sink_failed = false;
        loop {
            buf.clear();
            match read_segment(&mut reader, &mut buf, &mut after_cr).await {
                Ok(false) => break,
                Ok(true) => {
                    if sink_failed {
                        // keep draining so the process never blocks on a full pipe
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf);
                    if let Err(e) = sink.append_line(&line).await {
                        LOGGER.error(format!(
                            "Dropping {} output for {:?}: {}",
                            stream,
                            sink.path(),
                            e
                        ));
                        sink_failed = true;
                    }
                }
                Err(e) => {
                    LOGGER.warn(format!("Reading {} failed: {}", stream, e));
                    break;
                }
            }
        }
    })
}

/// Spawns processes and collects their exit status.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Returns once the process exists and both output streams feed `sink`.
    pub async fn start(
        &self,
        cmd: &ResolvedCommand,
        sink: Arc<LogSink>,
    ) -> JobResultOf<ProcessHandle> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if let Some(dir) = &cmd.working_dir {
            command.current_dir(dir);
        }
        for (k, v) in &cmd.env {
            command.env(k, v);
        }

        let mut child = command.spawn().map_err(|e| {
            JobError::ProcessSpawnFailure(format!("{}: {}", cmd.program.display(), e))
        })?;
        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                return Err(JobError::ProcessSpawnFailure(format!(
                    "{}: process exited before its pid was read",
                    cmd.program.display()
                )));
            }
        };
        LOGGER.info(format!(
            "Spawned {} {:?} as pid {}",
            cmd.program.display(),
            &cmd.args,
            pid
        ));

        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(pump(out, sink.clone(), "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(pump(err, sink.clone(), "stderr"));
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let control = ProcessControl {
            pid,
            exited: exited_rx,
            escalated: Arc::new(AtomicBool::new(false)),
        };
        Ok(ProcessHandle {
            child,
            pid,
            pumps,
            exited_tx,
            control,
        })
    }

    /// Wait for exit, then let the output pumps drain.
    pub async fn wait(&self, handle: ProcessHandle) -> ExitReport {
        let ProcessHandle {
            mut child,
            pid,
            pumps,
            exited_tx,
            ..
        } = handle;
        let status = child.wait().await;
        exited_tx.send_replace(true);

        for mut p in pumps {
            if tokio::time::timeout(PUMP_DRAIN, &mut p).await.is_err() {
                LOGGER.debug(format!("Output of pid {} still open after exit, detaching", pid));
                p.abort();
            }
        }

        let report = match status {
            Ok(st) => match (st.code(), st.signal()) {
                (Some(code), _) => ExitReport {
                    exit_code: Some(code),
                    signal: None,
                    error: None,
                },
                (None, Some(sig)) => ExitReport {
                    exit_code: Some(128 + sig),
                    signal: Some(sig),
                    error: None,
                },
                (None, None) => ExitReport {
                    exit_code: None,
                    signal: None,
                    error: Some(String::from("unknown exit status")),
                },
            },
            Err(e) => ExitReport {
                exit_code: None,
                signal: None,
                error: Some(e.to_string()),
            },
        };
        LOGGER.info(format!("pid {} finished: {}", pid, report.describe()));
        report
    }
}
