use crate::core::jobs::{CommandArg, JobCommand, JobStatus};
use crate::err::{JobError, JobResultOf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_LOG_TAIL: usize = 50;

fn default_tail() -> usize {
    DEFAULT_LOG_TAIL
}

/// Arguments of a submitted command, either as a JSON object
/// (`{"input": "SEQ", "chains": ["A", "B"], "fast": true}`) or as an explicit
/// ordered list of `{"key", "values"}` pairs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SubmitArgs {
    List(Vec<CommandArg>),
    Map(BTreeMap<String, Value>),
}

impl Default for SubmitArgs {
    fn default() -> Self {
        SubmitArgs::List(Vec::new())
    }
}

fn scalar(key: &str, v: &Value) -> JobResultOf<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(JobError::InvalidCommand(format!(
            "argument '{}' has unsupported value {}",
            key, other
        ))),
    }
}

impl SubmitArgs {
    /// `true` becomes a bare flag, `false` and `null` drop the argument,
    /// arrays become repeated values.
    pub fn into_command_args(self) -> JobResultOf<Vec<CommandArg>> {
        let map = match self {
            SubmitArgs::List(args) => return Ok(args),
            SubmitArgs::Map(map) => map,
        };
        let mut args = Vec::with_capacity(map.len());
        for (key, value) in map {
            let values = match &value {
                Value::Null | Value::Bool(false) => continue,
                Value::Bool(true) => Vec::new(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| scalar(&key, item))
                    .collect::<JobResultOf<Vec<_>>>()?,
                other => vec![scalar(&key, other)?],
            };
            args.push(CommandArg { key, values });
        }
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Submit {
        script: PathBuf,
        #[serde(default)]
        args: SubmitArgs,
        #[serde(default)]
        name: Option<String>,
    },
    Status {
        job_id: String,
    },
    Result {
        job_id: String,
    },
    Log {
        job_id: String,
        #[serde(default = "default_tail")]
        tail: usize,
    },
    Cancel {
        job_id: String,
    },
    List {
        #[serde(default)]
        status: Option<JobStatus>,
    },
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Submit { .. } => "submit",
            Request::Status { .. } => "status",
            Request::Result { .. } => "result",
            Request::Log { .. } => "log",
            Request::Cancel { .. } => "cancel",
            Request::List { .. } => "list",
        }
    }
}

/// One request line. `id` is echoed back untouched so callers can match
/// responses that complete out of order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub request: Request,
}

pub(crate) fn build_command(script: PathBuf, args: SubmitArgs) -> JobResultOf<JobCommand> {
    let mut command = JobCommand::new(script);
    command.args = args.into_command_args()?;
    Ok(command)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: Option<Value>, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error<K: Into<String>, M: Into<String>>(id: Option<Value>, kind: K, message: M) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: kind.into(),
                message: message.into(),
                details: None,
            }),
        }
    }

    pub fn from_job_error(id: Option<Value>, err: &JobError) -> Self {
        let mut response = Self::error(id, err.kind(), err.to_string());
        let details = match err {
            JobError::JobFailed {
                status,
                exit_code,
                failure,
                ..
            } => Some(serde_json::json!({
                "status": status,
                "exit_code": exit_code,
                "failure": failure,
            })),
            JobError::JobNotReady { status, .. } => Some(serde_json::json!({ "status": status })),
            _ => None,
        };
        if let Some(body) = response.error.as_mut() {
            body.details = details;
        }
        response
    }
}
