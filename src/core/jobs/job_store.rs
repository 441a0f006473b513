//! On-disk layout of persisted jobs.
//!
//! ```text
//! <state_dir>/jobs/<id>/job.json      metadata
//! <state_dir>/jobs/<id>/output.log    captured stdout/stderr
//! <state_dir>/jobs/<id>/result.json   result payload, when there is one
//! <state_dir>/jobs/<id>/work/         working directory of the process
//! ```

use crate::core::jobs::{JobId, JobRecord};
use crate::err::Result;
use crate::{orch_error, orch_error_with_source};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const JOBS_DIR: &str = "jobs";
pub const METADATA_FILE: &str = "job.json";
pub const LOG_FILE: &str = "output.log";
pub const RESULT_FILE: &str = "result.json";
pub const WORK_DIR: &str = "work";

#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

/// Records that could be read back, plus the directories that could not.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<JobRecord>,
    pub skipped: Vec<(PathBuf, String)>,
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(bytes).await?;
    f.sync_all().await?;
    drop(f);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl JobStore {
    pub fn new<P: Into<PathBuf>>(state_dir: P) -> Self {
        Self {
            root: state_dir.into().join(JOBS_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Create the job directory and write the first version of the metadata.
    /// Fails if the directory already exists so an id is never reused.
    pub async fn create(&self, record: &JobRecord) -> Result<()> {
        let dir = self.job_dir(&record.id);
        if let Err(e) = tokio::fs::create_dir(&dir).await {
            return Err(orch_error_with_source!(e, "cannot create job dir {}", dir.display()).into());
        }
        tokio::fs::create_dir_all(&record.work_dir).await?;
        self.save(record).await
    }

    pub async fn save(&self, record: &JobRecord) -> Result<()> {
        let dir = self.job_dir(&record.id);
        let mut payload = serde_json::to_vec_pretty(record)?;
        payload.push(b'\n');
        write_atomic(&dir.join(METADATA_FILE), &payload).await?;
        if let Some(result) = &record.result {
            let payload = serde_json::to_vec_pretty(result)?;
            write_atomic(&dir.join(RESULT_FILE), &payload).await?;
        }
        Ok(())
    }

    pub async fn load_one(&self, dir: &Path) -> Result<JobRecord> {
        let meta_path = dir.join(METADATA_FILE);
        let raw = match tokio::fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) => {
                return Err(orch_error_with_source!(e, "failed to read {}", meta_path.display()).into());
            }
        };
        let mut record: JobRecord = match serde_json::from_slice(&raw) {
            Ok(r) => r,
            Err(e) => {
                return Err(orch_error_with_source!(e, "failed to parse {}", meta_path.display()).into());
            }
        };
        let dir_name = dir.file_name().map(|n| n.to_string_lossy().into_owned());
        if dir_name.as_deref() != Some(record.id.as_str()) {
            return Err(orch_error!(
                "{} holds job {} but lives in directory {:?}",
                meta_path.display(),
                record.id,
                dir_name
            )
            .into());
        }

        let result_path = dir.join(RESULT_FILE);
        if tokio::fs::try_exists(&result_path).await? {
            let raw = tokio::fs::read(&result_path).await?;
            record.result = Some(serde_json::from_slice(&raw)?);
        }
        Ok(record)
    }

    /// Read every job directory. A broken record is reported in
    /// `skipped` and never aborts the whole load.
    pub async fn load_all(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(report);
        }
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match self.load_one(&path).await {
                Ok(record) => report.records.push(record),
                Err(e) => report.skipped.push((path, e.to_string())),
            }
        }
        report.records.sort_by_key(|r| r.seq);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs::{JobCommand, JobStatus};
    use crate::utilities::TmpDirGuard;

    fn new_record(store: &JobStore, seq: u64) -> JobRecord {
        let id = JobId::generate();
        let dir = store.job_dir(&id);
        JobRecord::new(id, seq, format!("job{}", seq), JobCommand::new("/bin/true"), &dir)
    }

    #[tokio::test]
    async fn create_save_and_reload() {
        let tmp = TmpDirGuard::new("store_reload");
        let store = JobStore::new(tmp.as_path());
        store.init().await.unwrap();

        let mut a = new_record(&store, 1);
        store.create(&a).await.unwrap();
        assert!(a.work_dir.is_dir());

        a.mark_running(7).unwrap();
        a.mark_finished(
            JobStatus::Completed,
            Some(0),
            None,
            None,
            Some(serde_json::json!({"pdb": "model_0.pdb"})),
        )
        .unwrap();
        store.save(&a).await.unwrap();

        let b = new_record(&store, 2);
        store.create(&b).await.unwrap();

        let report = store.load_all().await.unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].id, a.id);
        assert_eq!(report.records[0].status, JobStatus::Completed);
        assert_eq!(
            report.records[0].result,
            Some(serde_json::json!({"pdb": "model_0.pdb"}))
        );
        assert_eq!(report.records[1].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn create_refuses_existing_directory() {
        let tmp = TmpDirGuard::new("store_dup");
        let store = JobStore::new(tmp.as_path());
        store.init().await.unwrap();
        let a = new_record(&store, 1);
        store.create(&a).await.unwrap();
        assert!(store.create(&a).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_metadata_is_skipped_not_fatal() {
        let tmp = TmpDirGuard::new("store_corrupt");
        let store = JobStore::new(tmp.as_path());
        store.init().await.unwrap();
        let good = new_record(&store, 1);
        store.create(&good).await.unwrap();

        let bad_dir = store.root().join("00000000deadbeef");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join(METADATA_FILE), b"{ not json").unwrap();
        std::fs::write(store.root().join("stray.txt"), b"ignored").unwrap();

        let report = store.load_all().await.unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].1.contains("failed to parse"));
    }

    #[tokio::test]
    async fn load_all_on_missing_root_is_empty() {
        let tmp = TmpDirGuard::new("store_empty");
        let store = JobStore::new(tmp.join("nowhere"));
        let report = store.load_all().await.unwrap();
        assert!(report.records.is_empty());
    }
}
