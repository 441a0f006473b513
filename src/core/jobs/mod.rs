mod job_manager;
mod job_record;
mod job_registry;
mod job_store;
mod launch;

pub use job_manager::{JobManager, ManagerConfig};
pub use job_record::{
    CancelOutcome, CommandArg, FailureKind, JobCommand, JobId, JobRecord, JobResult, JobStatus,
    JobStatusView,
};
pub use job_registry::{JobRegistry, ORPHANED_ERROR, ReloadSummary};
pub use job_store::{JobStore, LOG_FILE, LoadReport, METADATA_FILE, RESULT_FILE, WORK_DIR};
pub use launch::{JOB_ID_ENV, WORK_DIR_ENV};
