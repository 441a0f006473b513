use crate::core::jobs::{FailureKind, JobStatus};
use std::fmt::{Debug, Display, Formatter};

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// This is defined as a convenience.
pub type Result<T> = std::result::Result<T, Error>;

pub struct OrchError {
    err: String,
    file: &'static str,
    line: u32,
    source: Option<Error>,
}

impl OrchError {
    pub fn new(
        err: impl Into<String>,
        file: &'static str,
        line: u32,
        source: Option<Error>,
    ) -> Self {
        Self {
            err: err.into(),
            file,
            line,
            source,
        }
    }
}

#[macro_export]
macro_rules! orch_error {
    ($fmt:expr $(, $($args:tt)*)?) => {
        $crate::err::OrchError::new(
            format!($fmt $(,$($args)*)?),
            file!(), line!(), None)
    };
}

#[macro_export]
macro_rules! orch_error_with_source {
    ($source:expr, $fmt:expr $(, $($args:tt)*)?) => {
        $crate::err::OrchError::new(
            format!($fmt $(,$($args)*)?),
            file!(), line!(), Some(Box::new($source) as $crate::err::Error))
    }
}

impl Debug for OrchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]:{} {}", self.file, self.line, self.err)
    }
}

impl Display for OrchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.err, source),
            None => write!(f, "{}", self.err),
        }
    }
}

impl std::error::Error for OrchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error))
    }
}

/// Errors surfaced at the boundary of every job manager operation.
#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job {job_id} is not ready (status: {status})")]
    JobNotReady { job_id: String, status: JobStatus },

    #[error("job {job_id} {status}: {}", .error.as_deref().unwrap_or("no error recorded"))]
    JobFailed {
        job_id: String,
        status: JobStatus,
        exit_code: Option<i32>,
        failure: Option<FailureKind>,
        error: Option<String>,
    },

    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailure(String),

    #[error("process {pid} did not exit within {grace_secs}s of SIGTERM")]
    CancellationTimeout { pid: u32, grace_secs: u64 },

    #[error("job manager is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(Error),
}

impl JobError {
    /// Stable, machine-checkable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::InvalidCommand(_) => "InvalidCommand",
            JobError::InvalidJobId(_) => "InvalidJobId",
            JobError::JobNotFound(_) => "JobNotFound",
            JobError::JobNotReady { .. } => "JobNotReady",
            JobError::JobFailed { .. } => "JobFailed",
            JobError::ProcessSpawnFailure(_) => "ProcessSpawnFailure",
            JobError::CancellationTimeout { .. } => "CancellationTimeout",
            JobError::ShuttingDown => "ShuttingDown",
            JobError::Internal(_) => "Internal",
        }
    }
}

impl From<Error> for JobError {
    fn from(err: Error) -> Self {
        JobError::Internal(err)
    }
}

impl From<OrchError> for JobError {
    fn from(err: OrchError) -> Self {
        JobError::Internal(Box::new(err))
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Internal(Box::new(err))
    }
}

pub type JobResultOf<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orch_error_keeps_location_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = orch_error_with_source!(io, "failed to read {}", "job.json");
        assert!(format!("{:?}", err).contains("err/mod.rs"));
        assert_eq!(format!("{}", err), "failed to read job.json: gone");
        assert!(std::error::Error::source(&err).is_some());
        assert!(format!("{:?}", err).starts_with('['));
    }

    #[test]
    fn job_error_kinds_are_stable() {
        assert_eq!(JobError::InvalidCommand("x".into()).kind(), "InvalidCommand");
        assert_eq!(JobError::JobNotFound("x".into()).kind(), "JobNotFound");
        let internal: JobError = orch_error!("broken").into();
        assert_eq!(internal.kind(), "Internal");
        assert_eq!(format!("{}", internal), "internal error: broken");
    }

    #[test]
    fn job_failed_message_carries_stored_error() {
        let err = JobError::JobFailed {
            job_id: "00000000000000ff".into(),
            status: JobStatus::Failed,
            exit_code: Some(2),
            failure: Some(FailureKind::ExitCode),
            error: Some("process exited with code 2".into()),
        };
        assert_eq!(
            format!("{}", err),
            "job 00000000000000ff failed: process exited with code 2"
        );
    }
}
