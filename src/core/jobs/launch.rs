use crate::core::jobs::job_manager::{ManagerInner, SlotPhase};
use crate::core::jobs::{FailureKind, JobId, JobStatus};
use crate::core::process::{ExitReport, LogSink, ProcessControl, ProcessHandle, ResolvedCommand};
use crate::core::tasks::AsyncHandleable;
use crate::err::Result;
use crate::global_var::LOGGER;
use async_trait::async_trait;
use std::sync::Arc;

pub const JOB_ID_ENV: &str = "JOBVISOR_JOB_ID";
pub const WORK_DIR_ENV: &str = "JOBVISOR_WORK_DIR";

/// Queue item that moves one job from `pending` to `running`.
pub(crate) struct LaunchJob {
    inner: Arc<ManagerInner>,
    id: JobId,
    command: ResolvedCommand,
}

impl LaunchJob {
    pub(crate) fn new(inner: Arc<ManagerInner>, id: JobId, command: ResolvedCommand) -> Self {
        Self { inner, id, command }
    }
}

/// Everything needed for the one finalizing write of a job.
struct Outcome {
    status: JobStatus,
    exit_code: Option<i32>,
    failure: Option<FailureKind>,
    error: Option<String>,
    result: Option<serde_json::Value>,
}

impl Outcome {
    fn failed(exit_code: Option<i32>, failure: FailureKind, error: String) -> Self {
        Self {
            status: JobStatus::Failed,
            exit_code,
            failure: Some(failure),
            error: Some(error),
            result: None,
        }
    }
}

#[async_trait]
impl AsyncHandleable for LaunchJob {
    async fn handle(&mut self) -> Result<()> {
        let inner = &self.inner;
        let Some(slot) = inner.slot(&self.id) else {
            LOGGER.debug(format!("Job {} has no slot, nothing to launch", &self.id));
            return Ok(());
        };

        // The slot stays locked until the job is either running or finalized,
        // so a concurrent cancel sees one or the other.
        let mut state = slot.state.lock().await;
        if !matches!(state.phase, SlotPhase::Pending) || state.cancel_requested {
            return Ok(());
        }
        if !inner.is_accepting() {
            LOGGER.info(format!("Shutting down, job {} stays pending", &self.id));
            return Ok(());
        }

        let record = inner.registry.get(&self.id).await?;
        if record.status != JobStatus::Pending {
            LOGGER.warn(format!(
                "Job {} is {} at launch time, not starting it",
                &self.id, record.status
            ));
            state.phase = SlotPhase::Finished;
            drop(state);
            inner.release_slot(&self.id, &slot);
            return Ok(());
        }

        let command = self
            .command
            .clone()
            .with_working_dir(&record.work_dir)
            .with_env(JOB_ID_ENV, self.id.as_str())
            .with_env(WORK_DIR_ENV, record.work_dir.to_string_lossy());

        let started = match LogSink::open(&record.log_path).await {
            Ok(sink) => {
                let sink = Arc::new(sink);
                inner
                    .runner
                    .start(&command, sink.clone())
                    .await
                    .map(|handle| (handle, sink))
            }
            Err(e) => Err(crate::err::JobError::ProcessSpawnFailure(format!(
                "cannot open log {}: {}",
                record.log_path.display(),
                e
            ))),
        };

        match started {
            Err(e) => {
                LOGGER.error(format!("Job {} could not be started: {}", &self.id, e));
                let outcome = Outcome::failed(None, FailureKind::ProcessSpawnFailure, e.to_string());
                finalize(inner, &self.id, outcome).await;
                state.phase = SlotPhase::Finished;
                drop(state);
                inner.release_slot(&self.id, &slot);
            }
            Ok((handle, sink)) => {
                let pid = handle.pid();
                if let Err(e) = inner
                    .registry
                    .update(&self.id, |r| r.mark_running(pid))
                    .await
                {
                    LOGGER.error(format!("Job {} running as pid {} but: {}", &self.id, pid, e));
                }
                let control = handle.control();
                state.phase = SlotPhase::Running(control.clone());
                drop(state);

                let inner = inner.clone();
                let id = self.id.clone();
                tokio::spawn(async move {
                    watch_job(inner, id, handle, control, sink).await;
                });
            }
        }
        Ok(())
    }
}

async fn finalize(inner: &ManagerInner, id: &JobId, outcome: Outcome) {
    let Outcome {
        status,
        exit_code,
        failure,
        error,
        result,
    } = outcome;
    if let Err(e) = inner
        .registry
        .update(id, |r| r.mark_finished(status, exit_code, failure, error, result))
        .await
    {
        LOGGER.error(format!("Failed to finalize job {} as {}: {}", id, status, e));
    }
}

fn spawn_timeout(
    inner: &Arc<ManagerInner>,
    id: &JobId,
    control: &ProcessControl,
) -> Option<tokio::task::JoinHandle<()>> {
    let limit = inner.config.job_timeout?;
    let inner = inner.clone();
    let id = id.clone();
    let control = control.clone();
    Some(tokio::spawn(async move {
        tokio::time::sleep(limit).await;
        let Some(slot) = inner.slot(&id) else {
            return;
        };
        {
            let mut state = slot.state.lock().await;
            if state.cancel_requested || control.has_exited() {
                return;
            }
            state.timed_out = true;
        }
        LOGGER.warn(format!(
            "Job {} exceeded its {}s time limit, terminating pid {}",
            &id,
            limit.as_secs(),
            control.pid()
        ));
        if let Err(e) = control.terminate(inner.config.cancel_grace_period).await {
            LOGGER.error(format!("Terminating timed out job {} failed: {}", &id, e));
        }
    }))
}

/// Completion watcher: waits for the process and performs the single
/// finalizing write for the job.
async fn watch_job(
    inner: Arc<ManagerInner>,
    id: JobId,
    handle: ProcessHandle,
    control: ProcessControl,
    sink: Arc<LogSink>,
) {
    let timer = spawn_timeout(&inner, &id, &control);
    let report = inner.runner.wait(handle).await;
    if let Some(timer) = timer {
        timer.abort();
    }

    let Some(slot) = inner.slot(&id) else {
        LOGGER.error(format!("Job {} lost its slot while running", &id));
        return;
    };
    let mut state = slot.state.lock().await;

    let outcome = if state.cancel_requested {
        cancelled_outcome(&inner, &control)
    } else if state.timed_out {
        let limit = inner.config.job_timeout.map(|d| d.as_secs()).unwrap_or_default();
        Outcome::failed(
            report.exit_code,
            FailureKind::Timeout,
            format!("timed out after {}s; {}", limit, report.describe()),
        )
    } else {
        exited_outcome(&inner, &id, &report).await
    };

    if let Err(e) = sink.close().await {
        LOGGER.warn(format!("Closing log of job {} failed: {}", &id, e));
    }
    finalize(&inner, &id, outcome).await;
    state.phase = SlotPhase::Finished;
    drop(state);
    inner.release_slot(&id, &slot);
}

fn cancelled_outcome(inner: &ManagerInner, control: &ProcessControl) -> Outcome {
    let (failure, error) = if control.escalated() {
        (
            FailureKind::CancellationTimeout,
            format!(
                "cancelled: process ignored SIGTERM for {}s and was killed",
                inner.config.cancel_grace_period.as_secs()
            ),
        )
    } else {
        (FailureKind::Cancelled, String::from("cancelled by request"))
    };
    Outcome {
        status: JobStatus::Cancelled,
        exit_code: None,
        failure: Some(failure),
        error: Some(error),
        result: None,
    }
}

async fn exited_outcome(inner: &ManagerInner, id: &JobId, report: &ExitReport) -> Outcome {
    if report.error.is_some() {
        return Outcome::failed(None, FailureKind::Internal, report.describe());
    }
    if report.signal.is_some() {
        return Outcome::failed(report.exit_code, FailureKind::Signaled, report.describe());
    }
    if !report.success() {
        return Outcome::failed(report.exit_code, FailureKind::ExitCode, report.describe());
    }

    let work_dir = match inner.registry.get(id).await {
        Ok(record) => record.work_dir,
        Err(e) => return Outcome::failed(Some(0), FailureKind::Internal, e.to_string()),
    };
    match inner.extractor.extract(&work_dir).await {
        Ok(result) => Outcome {
            status: JobStatus::Completed,
            exit_code: Some(0),
            failure: None,
            error: None,
            result,
        },
        Err(e) => Outcome::failed(
            Some(0),
            FailureKind::Internal,
            format!("result extraction failed: {}", e),
        ),
    }
}
