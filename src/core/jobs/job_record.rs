use crate::err::{JobError, JobResultOf};
use crate::global_var::LOGGER;
use crate::orch_error;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

static JOB_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{16}$").expect("job id pattern is valid"));

/// Opaque job handle: 16 lowercase hex digits of a random 64-bit value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    /// Caller supplied ids are checked before they are used to address
    /// anything on disk.
    pub fn parse(s: &str) -> JobResultOf<Self> {
        let s = s.trim();
        if JOB_ID_PATTERN.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(JobError::InvalidJobId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for JobId {
    type Error = JobError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        JobId::parse(&value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// `pending -> failed` only happens when the process could not be spawned.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Machine-checkable tag stored next to a terminal job's error message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailureKind {
    ExitCode,
    Signaled,
    ProcessSpawnFailure,
    Timeout,
    /// The job was running when its supervisor went away.
    Orphaned,
    Cancelled,
    /// Cancelled, but SIGTERM was ignored and SIGKILL had to be sent.
    CancellationTimeout,
    Internal,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArg {
    pub key: String,
    /// Empty for a bare `--key` flag.
    #[serde(default)]
    pub values: Vec<String>,
}

/// What to run: a script or executable plus keyed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCommand {
    pub script: PathBuf,
    #[serde(default)]
    pub args: Vec<CommandArg>,
}

impl JobCommand {
    pub fn new<P: Into<PathBuf>>(script: P) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.args.push(CommandArg {
            key: key.into(),
            values: vec![value.into()],
        });
        self
    }

    pub fn multi_arg<K, I, V>(mut self, key: K, values: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.args.push(CommandArg {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn flag<K: Into<String>>(mut self, key: K) -> Self {
        self.args.push(CommandArg {
            key: key.into(),
            values: Vec::new(),
        });
        self
    }

    /// `<script stem>_<first value, at most 10 chars>`, used when the caller
    /// gives no name.
    pub fn derive_name(&self) -> String {
        let stem = self
            .script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("job"));
        match self.args.iter().find_map(|a| a.values.first()) {
            Some(v) => format!("{}_{}", stem, v.chars().take(10).collect::<String>()),
            None => stem,
        }
    }
}

/// Never go backwards relative to an earlier stamp, even if the wall clock does.
fn stamp_after(prev: DateTime<Utc>) -> DateTime<Utc> {
    std::cmp::max(Utc::now(), prev)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub seq: u64,
    pub name: String,
    pub command: JobCommand,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub pid: Option<u32>,

    pub log_path: PathBuf,
    pub work_dir: PathBuf,

    // kept in its own file next to the metadata
    #[serde(skip)]
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    pub fn new(id: JobId, seq: u64, name: String, command: JobCommand, job_dir: &Path) -> Self {
        Self {
            id,
            seq,
            name,
            command,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            failure: None,
            pid: None,
            log_path: job_dir.join(super::job_store::LOG_FILE),
            work_dir: job_dir.join(super::job_store::WORK_DIR),
            result: None,
        }
    }

    fn check_transition(&self, next: JobStatus) -> JobResultOf<()> {
        if self.status.can_transition_to(next) {
            return Ok(());
        }
        let error_msg = format!(
            "Refusing to move job {} ({}) from {} to {}",
            &self.id, &self.name, self.status, next
        );
        LOGGER.error(&error_msg);
        Err(orch_error!("{}", error_msg).into())
    }

    pub fn mark_running(&mut self, pid: u32) -> JobResultOf<()> {
        self.check_transition(JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.pid = Some(pid);
        self.started_at = Some(stamp_after(self.created_at));
        LOGGER.info(format!(
            "Job {} status change {} -> {}, pid {}",
            &self.id,
            JobStatus::Pending,
            JobStatus::Running,
            pid
        ));
        Ok(())
    }

    /// Apply the one terminal write. All terminal fields change together.
    pub fn mark_finished(
        &mut self,
        status: JobStatus,
        exit_code: Option<i32>,
        failure: Option<FailureKind>,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> JobResultOf<()> {
        if !status.is_terminal() {
            return Err(orch_error!("{} is not a terminal status", status).into());
        }
        self.check_transition(status)?;
        let prev = self.status;
        let floor = self.started_at.unwrap_or(self.created_at);
        self.status = status;
        self.finished_at = Some(stamp_after(floor));
        self.exit_code = exit_code;
        self.failure = failure;
        self.error = error;
        self.result = result;
        LOGGER.info(format!(
            "Job {} status change {} -> {}, status message {}",
            &self.id,
            prev,
            status,
            self.error.as_deref().unwrap_or("None"),
        ));
        Ok(())
    }

    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            error: self.error.clone(),
            failure: self.failure,
        }
    }
}

/// Point-in-time snapshot returned by status and list queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

/// Outcome of a successfully completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub id: JobId,
    pub name: String,
    pub exit_code: i32,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub work_dir: PathBuf,
    pub log_path: PathBuf,
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled {
        previous: JobStatus,
        escalated: bool,
    },
    AlreadyFinished {
        status: JobStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(
            JobId::generate(),
            1,
            "t1".into(),
            JobCommand::new("/bin/true"),
            Path::new("/tmp/jobvisor/jobs/x"),
        )
    }

    #[test]
    fn generated_ids_parse_and_bad_ids_are_rejected() {
        let id = JobId::generate();
        assert_eq!(JobId::parse(id.as_str()).unwrap(), id);
        assert!(matches!(
            JobId::parse("../../etc"),
            Err(JobError::InvalidJobId(_))
        ));
        assert!(JobId::parse("ABCDEF0123456789").is_err());
        assert!(JobId::parse("0123").is_err());
    }

    #[test]
    fn id_deserialization_validates() {
        let ok: JobId = serde_json::from_str("\"00000000000000aa\"").unwrap();
        assert_eq!(ok.as_str(), "00000000000000aa");
        assert!(serde_json::from_str::<JobId>("\"nope\"").is_err());
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        use JobStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!("canceled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("done".parse::<JobStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn lifecycle_sets_monotonic_timestamps() {
        let mut r = record();
        r.mark_running(42).unwrap();
        r.mark_finished(JobStatus::Completed, Some(0), None, None, None)
            .unwrap();
        let started = r.started_at.unwrap();
        let finished = r.finished_at.unwrap();
        assert!(r.created_at <= started && started <= finished);
        assert_eq!(r.pid, Some(42));
        assert!(r.mark_running(43).is_err());
        assert!(
            r.mark_finished(JobStatus::Failed, Some(1), None, None, None)
                .is_err()
        );
        assert_eq!(r.status, JobStatus::Completed);
    }

    #[test]
    fn finishing_requires_terminal_status() {
        let mut r = record();
        assert!(
            r.mark_finished(JobStatus::Running, None, None, None, None)
                .is_err()
        );
        assert_eq!(r.status, JobStatus::Pending);
    }

    #[test]
    fn derive_name_uses_stem_and_first_value() {
        let cmd = JobCommand::new("/opt/scripts/predict_structure.py")
            .arg("input", "QLEDSEVEAVAKG")
            .flag("verbose");
        assert_eq!(cmd.derive_name(), "predict_structure_QLEDSEVEAV");
        assert_eq!(JobCommand::new("run.sh").derive_name(), "run");
    }

    #[test]
    fn metadata_round_trip_skips_inline_result() {
        let mut r = record();
        r.result = Some(serde_json::json!({"score": 1}));
        let text = serde_json::to_string(&r).unwrap();
        assert!(!text.contains("score"));
        let back: JobRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, r.id);
        assert!(back.result.is_none());
        assert_eq!(back.log_path, r.log_path);
    }
}
