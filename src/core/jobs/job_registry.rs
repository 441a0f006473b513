use crate::core::jobs::job_store::JobStore;
use crate::core::jobs::{FailureKind, JobCommand, JobId, JobRecord, JobStatus, JobStatusView};
use crate::err::{JobError, JobResultOf};
use crate::global_var::LOGGER;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use tokio::sync::RwLock;

pub const ORPHANED_ERROR: &str =
    "orphaned: the job was running when its supervisor stopped; the process is no longer tracked";

struct RegistryState {
    jobs: HashMap<JobId, JobRecord>,
    next_seq: u64,
}

/// Every known job, keyed by id. All mutation goes through one write lock and
/// is persisted before it becomes visible to readers.
pub struct JobRegistry {
    state: RwLock<RegistryState>,
    store: JobStore,
}

impl Debug for JobRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.state.try_read() {
            Ok(state) => write!(
                f,
                "JobRegistry {{ root: {:?}, jobs: {}, next_seq: {} }}",
                self.store.root(),
                state.jobs.len(),
                state.next_seq
            ),
            Err(_) => write!(f, "JobRegistry {{ <Locked> }}"),
        }
    }
}

/// What happened while bringing a registry back from disk.
#[derive(Debug, Default)]
pub struct ReloadSummary {
    pub loaded: usize,
    pub reconciled: Vec<JobId>,
    /// Reconciled in memory, but the rewrite on disk failed.
    pub unsaved: Vec<JobId>,
    pub pending: Vec<JobId>,
    pub skipped: usize,
}

impl JobRegistry {
    pub fn new(store: JobStore) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                jobs: HashMap::new(),
                next_seq: 1,
            }),
            store,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Load every persisted record. Records left `running` by an unclean
    /// shutdown are moved to `failed` / `Orphaned` and written back. A record
    /// that cannot be written back is still served with its reconciled state.
    pub async fn load(store: JobStore) -> JobResultOf<(Self, ReloadSummary)> {
        store.init().await?;
        let report = store.load_all().await?;
        let mut summary = ReloadSummary {
            skipped: report.skipped.len(),
            ..Default::default()
        };
        for (path, reason) in &report.skipped {
            LOGGER.error(format!("Skipping unreadable job record {:?}: {}", path, reason));
        }

        let registry = Self::new(store);
        {
            let mut state = registry.state.write().await;
            for mut record in report.records {
                match record.status {
                    JobStatus::Running => {
                        if let Err(e) = record.mark_finished(
                            JobStatus::Failed,
                            None,
                            Some(FailureKind::Orphaned),
                            Some(String::from(ORPHANED_ERROR)),
                            None,
                        ) {
                            LOGGER.error(format!("Cannot reconcile job {}: {}", &record.id, e));
                        } else {
                            LOGGER.warn(format!(
                                "Reconciled orphaned job {} ({}) to failed",
                                &record.id, &record.name
                            ));
                            summary.reconciled.push(record.id.clone());
                            if let Err(e) = registry.store.save(&record).await {
                                LOGGER.error(format!(
                                    "Failed to persist reconciled job {}: {}",
                                    &record.id, e
                                ));
                                summary.unsaved.push(record.id.clone());
                            }
                        }
                    }
                    JobStatus::Pending => summary.pending.push(record.id.clone()),
                    _ => {}
                }
                state.next_seq = state.next_seq.max(record.seq + 1);
                summary.loaded += 1;
                state.jobs.insert(record.id.clone(), record);
            }
        }
        Ok((registry, summary))
    }

    /// Allocate an id and persist a new `pending` record.
    #[cfg(test)]
    pub async fn insert_new(&self, name: String, command: JobCommand) -> JobResultOf<JobRecord> {
        self.insert_new_with(name, command, |_| {}).await
    }

    /// Like [`insert_new`](Self::insert_new), running `on_created` after the
    /// record is persisted and before any reader can see it.
    pub async fn insert_new_with<F>(
        &self,
        name: String,
        command: JobCommand,
        on_created: F,
    ) -> JobResultOf<JobRecord>
    where
        F: FnOnce(&JobRecord),
    {
        let mut state = self.state.write().await;
        let mut id = JobId::generate();
        while state.jobs.contains_key(&id)
            || tokio::fs::try_exists(self.store.job_dir(&id)).await?
        {
            id = JobId::generate();
        }
        let seq = state.next_seq;
        let job_dir = self.store.job_dir(&id);
        let record = JobRecord::new(id, seq, name, command, &job_dir);
        self.store.create(&record).await?;
        on_created(&record);
        state.next_seq += 1;
        state.jobs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub async fn get(&self, id: &JobId) -> JobResultOf<JobRecord> {
        let state = self.state.read().await;
        state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))
    }

    /// Apply `f` to a copy of the record, persist the copy, then publish it.
    ///
    /// When persisting fails the change is still published, because the job
    /// has really moved on; the error is returned so the caller can report it.
    pub async fn update<F>(&self, id: &JobId, f: F) -> JobResultOf<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> JobResultOf<()>,
    {
        let mut state = self.state.write().await;
        let current = state
            .jobs
            .get(id)
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        let mut next = current.clone();
        f(&mut next)?;
        let persisted = self.store.save(&next).await;
        state.jobs.insert(id.clone(), next.clone());
        match persisted {
            Ok(()) => Ok(next),
            Err(e) => {
                LOGGER.error(format!("Failed to persist job {}: {}", id, e));
                Err(JobError::Internal(e))
            }
        }
    }

    /// Snapshot of all jobs, oldest first.
    pub async fn list(&self, filter: Option<JobStatus>) -> Vec<JobStatusView> {
        let state = self.state.read().await;
        let mut records: Vec<&JobRecord> = state
            .jobs
            .values()
            .filter(|r| filter.is_none_or(|s| r.status == s))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        records.into_iter().map(JobRecord::view).collect()
    }

    pub async fn ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        let state = self.state.read().await;
        state
            .jobs
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.id.clone())
            .collect()
    }
}
