use crate::core::collaborators::{CommandResolver, ResultExtractor};
use crate::core::jobs::job_registry::JobRegistry;
use crate::core::jobs::job_store::JobStore;
use crate::core::jobs::launch::LaunchJob;
use crate::core::jobs::{
    CancelOutcome, FailureKind, JobCommand, JobId, JobResult, JobStatus, JobStatusView,
};
use crate::core::process::{
    KILL_WAIT, LogTail, PUMP_DRAIN, ProcessControl, ProcessRunner, ResolvedCommand, read_tail,
};
use crate::core::tasks::{TaskQueue, TaskQueueConfig, TaskQueueSender};
use crate::err::{JobError, JobResultOf};
use crate::global_var::LOGGER;
use crate::utilities::StateDirLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub state_dir: PathBuf,
    pub cancel_grace_period: Duration,
    /// `None` disables the wall-clock limit.
    pub job_timeout: Option<Duration>,
    pub launch_queue_bound: usize,
}

impl ManagerConfig {
    pub fn new<P: Into<PathBuf>>(state_dir: P) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            cancel_grace_period: Duration::from_secs(10),
            job_timeout: None,
            launch_queue_bound: 1024,
        }
    }
}

pub(crate) enum SlotPhase {
    Pending,
    Running(ProcessControl),
    Finished,
}

pub(crate) struct SlotState {
    pub(crate) phase: SlotPhase,
    pub(crate) cancel_requested: bool,
    pub(crate) timed_out: bool,
}

/// Supervision slot of one non-terminal job. Launch, cancellation, timeout
/// and finalization of the same job all go through `state`.
pub(crate) struct JobSlot {
    pub(crate) state: tokio::sync::Mutex<SlotState>,
    done_tx: watch::Sender<bool>,
}

impl JobSlot {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(SlotState {
                phase: SlotPhase::Pending,
                cancel_requested: false,
                timed_out: false,
            }),
            done_tx: watch::channel(false).0,
        }
    }
}

pub(crate) struct ManagerInner {
    pub(crate) config: ManagerConfig,
    pub(crate) registry: JobRegistry,
    pub(crate) runner: ProcessRunner,
    pub(crate) extractor: Arc<dyn ResultExtractor>,
    resolver: Arc<dyn CommandResolver>,
    slots: Mutex<HashMap<JobId, Arc<JobSlot>>>,
    accepting: AtomicBool,
}

impl ManagerInner {
    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<JobSlot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn slot(&self, id: &JobId) -> Option<Arc<JobSlot>> {
        self.slots().get(id).cloned()
    }

    fn add_slot(&self, id: &JobId) -> Arc<JobSlot> {
        let slot = Arc::new(JobSlot::new());
        self.slots().insert(id.clone(), slot.clone());
        slot
    }

    /// Drop the slot of a job that reached a terminal state and wake every
    /// waiter.
    pub(crate) fn release_slot(&self, id: &JobId, slot: &Arc<JobSlot>) {
        {
            let mut slots = self.slots();
            if slots.get(id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
                slots.remove(id);
            }
        }
        slot.done_tx.send_replace(true);
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn cancel_wait_limit(&self) -> Duration {
        self.config.cancel_grace_period + KILL_WAIT + PUMP_DRAIN + Duration::from_secs(1)
    }

    async fn cancel(&self, id: &JobId) -> JobResultOf<CancelOutcome> {
        let Some(slot) = self.slot(id) else {
            let record = self.registry.get(id).await?;
            if record.status.is_terminal() {
                return Ok(CancelOutcome::AlreadyFinished {
                    status: record.status,
                });
            }
            return Err(JobError::Internal(
                format!("job {} is {} but not supervised", id, record.status).into(),
            ));
        };

        let mut state = slot.state.lock().await;
        let running = match &state.phase {
            SlotPhase::Running(control) => Some(control.clone()),
            _ => None,
        };
        let Some(control) = running else {
            if matches!(state.phase, SlotPhase::Finished) {
                drop(state);
                let record = self.registry.get(id).await?;
                return Ok(CancelOutcome::AlreadyFinished {
                    status: record.status,
                });
            }
            state.cancel_requested = true;
            LOGGER.info(format!("Cancelling pending job {}", id));
            let persisted = self
                .registry
                .update(id, |r| {
                    r.mark_finished(
                        JobStatus::Cancelled,
                        None,
                        Some(FailureKind::Cancelled),
                        Some(String::from("cancelled before start")),
                        None,
                    )
                })
                .await;
            state.phase = SlotPhase::Finished;
            drop(state);
            self.release_slot(id, &slot);
            persisted?;
            return Ok(CancelOutcome::Cancelled {
                previous: JobStatus::Pending,
                escalated: false,
            });
        };

        let first_request = !state.cancel_requested;
        state.cancel_requested = true;
        drop(state);

        if first_request {
            LOGGER.info(format!("Cancelling running job {} (pid {})", id, control.pid()));
            control.terminate(self.config.cancel_grace_period).await?;
        } else {
            LOGGER.debug(format!("Job {} already being cancelled, waiting", id));
        }

        let mut done = slot.done_tx.subscribe();
        if tokio::time::timeout(self.cancel_wait_limit(), done.wait_for(|d| *d))
            .await
            .is_err()
        {
            return Err(JobError::CancellationTimeout {
                pid: control.pid(),
                grace_secs: self.config.cancel_grace_period.as_secs(),
            });
        }

        let record = self.registry.get(id).await?;
        match record.status {
            JobStatus::Cancelled => Ok(CancelOutcome::Cancelled {
                previous: JobStatus::Running,
                escalated: control.escalated(),
            }),
            status => Ok(CancelOutcome::AlreadyFinished { status }),
        }
    }
}

/// Owns every job persisted under one state directory.
pub struct JobManager {
    inner: Arc<ManagerInner>,
    sender: TaskQueueSender,
    queue: tokio::sync::Mutex<Option<TaskQueue>>,
    _lock: StateDirLock,
}

impl JobManager {
    /// Lock the state directory, reload every record, and re-queue jobs that
    /// were still waiting to start.
    pub async fn open(
        config: ManagerConfig,
        resolver: Arc<dyn CommandResolver>,
        extractor: Arc<dyn ResultExtractor>,
    ) -> JobResultOf<Self> {
        tokio::fs::create_dir_all(&config.state_dir).await?;
        let lock = StateDirLock::acquire(&config.state_dir)?;
        let (registry, summary) = JobRegistry::load(JobStore::new(&config.state_dir)).await?;
        LOGGER.info(format!(
            "Opened {:?}: {} jobs loaded, {} orphaned ({} not rewritten), {} pending, {} unreadable",
            &config.state_dir,
            summary.loaded,
            summary.reconciled.len(),
            summary.unsaved.len(),
            summary.pending.len(),
            summary.skipped
        ));

        let queue = TaskQueue::new(TaskQueueConfig {
            queue_bound: config.launch_queue_bound,
        });
        let sender = queue.sender();
        let inner = Arc::new(ManagerInner {
            config,
            registry,
            runner: ProcessRunner::new(),
            extractor,
            resolver,
            slots: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        });
        let manager = Self {
            inner,
            sender,
            queue: tokio::sync::Mutex::new(Some(queue)),
            _lock: lock,
        };

        for id in summary.pending {
            manager.requeue(&id).await;
        }
        Ok(manager)
    }

    async fn requeue(&self, id: &JobId) {
        let inner = &self.inner;
        let slot = inner.add_slot(id);
        let resolved = match inner.registry.get(id).await {
            Ok(record) => inner.resolver.resolve(&record.command).await,
            Err(e) => Err(e),
        };
        match resolved {
            Ok(command) => {
                LOGGER.info(format!("Re-queueing pending job {}", id));
                self.enqueue(id, command).await;
            }
            Err(e) => {
                LOGGER.error(format!("Pending job {} can no longer be started: {}", id, e));
                if let Err(fe) = inner
                    .registry
                    .update(id, |r| {
                        r.mark_finished(
                            JobStatus::Failed,
                            None,
                            Some(FailureKind::ProcessSpawnFailure),
                            Some(e.to_string()),
                            None,
                        )
                    })
                    .await
                {
                    LOGGER.error(format!("Failed to finalize job {} as failed: {}", id, fe));
                }
                slot.state.lock().await.phase = SlotPhase::Finished;
                inner.release_slot(id, &slot);
            }
        }
    }

    async fn enqueue(&self, id: &JobId, command: ResolvedCommand) {
        let item = LaunchJob::new(self.inner.clone(), id.clone(), command);
        if let Err(e) = self.sender.send(Box::new(item)).await {
            LOGGER.error(format!("Job {} stays pending, launch queue refused it: {}", id, e));
        }
    }

    /// Validate and persist a new job, then start it in the background.
    /// Returns as soon as the `pending` record is durable.
    pub async fn submit(&self, command: JobCommand, name: Option<String>) -> JobResultOf<JobId> {
        if !self.inner.is_accepting() {
            return Err(JobError::ShuttingDown);
        }
        let resolved = self.inner.resolver.resolve(&command).await?;
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| command.derive_name());

        let inner = &self.inner;
        let record = inner
            .registry
            .insert_new_with(name, command, |r| {
                inner.add_slot(&r.id);
            })
            .await?;
        LOGGER.info(format!(
            "Submitted job {} ({}): {} {:?}",
            &record.id, &record.name, resolved.program.display(), &resolved.args
        ));
        self.enqueue(&record.id, resolved).await;
        Ok(record.id)
    }

    pub async fn status(&self, id: &JobId) -> JobResultOf<JobStatusView> {
        Ok(self.inner.registry.get(id).await?.view())
    }

    pub async fn result(&self, id: &JobId) -> JobResultOf<JobResult> {
        let record = self.inner.registry.get(id).await?;
        match record.status {
            JobStatus::Pending | JobStatus::Running => Err(JobError::JobNotReady {
                job_id: id.to_string(),
                status: record.status,
            }),
            JobStatus::Failed | JobStatus::Cancelled => Err(JobError::JobFailed {
                job_id: id.to_string(),
                status: record.status,
                exit_code: record.exit_code,
                failure: record.failure,
                error: record.error,
            }),
            JobStatus::Completed => {
                let artifacts = list_artifacts(&record.work_dir).await?;
                Ok(JobResult {
                    id: record.id,
                    name: record.name,
                    exit_code: record.exit_code.unwrap_or(0),
                    finished_at: record.finished_at,
                    result: record.result,
                    work_dir: record.work_dir,
                    log_path: record.log_path,
                    artifacts,
                })
            }
        }
    }

    /// Last `tail` lines of output, every line when `tail` is 0.
    pub async fn log(&self, id: &JobId, tail: usize) -> JobResultOf<LogTail> {
        let record = self.inner.registry.get(id).await?;
        Ok(read_tail(&record.log_path, tail).await?)
    }

    pub async fn cancel(&self, id: &JobId) -> JobResultOf<CancelOutcome> {
        self.inner.cancel(id).await
    }

    pub async fn list(&self, filter: Option<JobStatus>) -> Vec<JobStatusView> {
        self.inner.registry.list(filter).await
    }

    /// Stop accepting work, cancel every running job and drain the launch
    /// queue. Jobs still `pending` stay pending and are picked up by the next
    /// `open`.
    pub async fn shutdown(&self) -> JobResultOf<()> {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        LOGGER.info("Job manager shutting down");
        self.cancel_running().await;
        if let Some(queue) = self.queue.lock().await.take() {
            queue.shutdown().await?;
        }
        // a launch already past its checks may have started one more process
        self.cancel_running().await;
        LOGGER.info("Job manager stopped");
        Ok(())
    }

    async fn cancel_running(&self) {
        let mut set = JoinSet::new();
        for id in self.inner.registry.ids_with_status(JobStatus::Running).await {
            let inner = self.inner.clone();
            set.spawn(async move {
                let outcome = inner.cancel(&id).await;
                (id, outcome)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Err(e))) => LOGGER.error(format!("Cancelling job {} on shutdown failed: {}", id, e)),
                Ok(_) => {}
                Err(e) => LOGGER.error(format!("Cancel task panicked: {:?}", e)),
            }
        }
    }
}

/// Regular files below `dir`, sorted.
async fn list_artifacts(dir: &Path) -> JobResultOf<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                stack.push(entry.path());
            } else if kind.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::{JsonResultExtractor, ScriptResolver};
    use crate::utilities::TmpDirGuard;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    async fn manager(state: &Path, grace_secs: u64) -> JobManager {
        let mut config = ManagerConfig::new(state);
        config.cancel_grace_period = Duration::from_secs(grace_secs);
        JobManager::open(
            config,
            Arc::new(ScriptResolver::default()),
            Arc::new(JsonResultExtractor),
        )
        .await
        .unwrap()
    }

    async fn wait_terminal(m: &JobManager, id: &JobId) -> JobStatusView {
        for _ in 0..500 {
            let v = m.status(id).await.unwrap();
            if v.status.is_terminal() {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn second_open_on_same_state_dir_is_refused() {
        let tmp = TmpDirGuard::new("manager_lock");
        let m = manager(&tmp, 1).await;
        let second = JobManager::open(
            ManagerConfig::new(tmp.as_path()),
            Arc::new(ScriptResolver::default()),
            Arc::new(JsonResultExtractor),
        )
        .await;
        assert!(second.is_err());
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn completed_job_lists_artifacts() {
        let tmp = TmpDirGuard::new("manager_artifacts");
        let s = script(
            &tmp,
            "art.sh",
            "mkdir -p out && echo pdb > out/model.pdb && echo '{\"n\":1}' > result.json",
        );
        let m = manager(&tmp.join("state"), 1).await;
        let id = m.submit(JobCommand::new(&s), None).await.unwrap();
        assert_eq!(wait_terminal(&m, &id).await.status, JobStatus::Completed);

        let result = m.result(&id).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.result, Some(serde_json::json!({"n": 1})));
        assert_eq!(result.artifacts.len(), 2);
        assert!(result.artifacts.iter().any(|p| p.ends_with("out/model.pdb")));
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_on_finished_job_reports_prior_state() {
        let tmp = TmpDirGuard::new("manager_cancel_done");
        let s = script(&tmp, "fail.sh", "exit 4");
        let m = manager(&tmp.join("state"), 1).await;
        let id = m.submit(JobCommand::new(&s), None).await.unwrap();
        assert_eq!(wait_terminal(&m, &id).await.status, JobStatus::Failed);

        let outcome = m.cancel(&id).await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::AlreadyFinished {
                status: JobStatus::Failed
            }
        );
        assert!(matches!(
            m.cancel(&JobId::generate()).await,
            Err(JobError::JobNotFound(_))
        ));
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let tmp = TmpDirGuard::new("manager_closed");
        let s = script(&tmp, "ok.sh", "true");
        let m = manager(&tmp.join("state"), 1).await;
        m.shutdown().await.unwrap();
        assert!(matches!(
            m.submit(JobCommand::new(&s), None).await,
            Err(JobError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_running_jobs() {
        let tmp = TmpDirGuard::new("manager_shutdown");
        let s = script(&tmp, "long.sh", "echo started; sleep 30");
        let m = manager(&tmp.join("state"), 2).await;
        let id = m.submit(JobCommand::new(&s), Some("long".into())).await.unwrap();
        for _ in 0..250 {
            if m.status(&id).await.unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        m.shutdown().await.unwrap();
        let view = m.status(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.exit_code, None);
        assert_eq!(view.name, "long");
    }
}
