//! Pluggable seams of the job manager: how a submitted command becomes
//! something runnable, and how a finished job's result payload is found.

use crate::config::EnvVar;
use crate::core::jobs::JobCommand;
use crate::core::process::ResolvedCommand;
use crate::err::{JobError, JobResultOf, Result};
use crate::orch_error_with_source;
use async_trait::async_trait;
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// File a job may leave in its working directory to report a result.
pub const RESULT_FILE_NAME: &str = "result.json";

#[async_trait]
pub trait CommandResolver: Send + Sync + 'static {
    /// Check the command can be invoked and build its argv. Every refusal is
    /// `JobError::InvalidCommand`.
    async fn resolve(&self, command: &JobCommand) -> JobResultOf<ResolvedCommand>;
}

#[async_trait]
pub trait ResultExtractor: Send + Sync + 'static {
    async fn extract(&self, work_dir: &Path) -> Result<Option<Value>>;
}

/// Resolves scripts on the local filesystem, optionally run through an
/// interpreter found on `PATH`.
#[derive(Debug, Clone, Default)]
pub struct ScriptResolver {
    scripts_dir: Option<PathBuf>,
    interpreter: Option<String>,
}

fn is_executable(meta: &std::fs::Metadata) -> bool {
    meta.permissions().mode() & 0o111 != 0
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| {
            std::fs::metadata(candidate)
                .map(|m| m.is_file() && is_executable(&m))
                .unwrap_or(false)
        })
}

fn invalid(msg: String) -> JobError {
    JobError::InvalidCommand(msg)
}

impl ScriptResolver {
    pub fn new(scripts_dir: Option<PathBuf>, interpreter: Option<String>) -> Self {
        Self {
            scripts_dir,
            interpreter,
        }
    }

    pub fn from_env(env: &EnvVar) -> Self {
        Self::new(
            env.get_scripts_dir().cloned(),
            env.get_interpreter().map(String::from),
        )
    }

    fn script_path(&self, script: &Path) -> JobResultOf<PathBuf> {
        let joined = match &self.scripts_dir {
            Some(dir) if script.is_relative() => dir.join(script),
            _ => script.to_path_buf(),
        };
        std::path::absolute(&joined)
            .map_err(|e| invalid(format!("cannot resolve {}: {}", joined.display(), e)))
    }

    fn interpreter_path(&self, interpreter: &str) -> JobResultOf<PathBuf> {
        if interpreter.contains('/') {
            let p = PathBuf::from(interpreter);
            return match std::fs::metadata(&p) {
                Ok(m) if m.is_file() && is_executable(&m) => Ok(p),
                _ => Err(invalid(format!("interpreter {} is not executable", interpreter))),
            };
        }
        find_in_path(interpreter)
            .ok_or_else(|| invalid(format!("interpreter {} not found on PATH", interpreter)))
    }

    fn render_args(command: &JobCommand) -> JobResultOf<Vec<String>> {
        let mut argv = Vec::new();
        for arg in &command.args {
            let key = arg.key.trim();
            if key.is_empty() || key.starts_with('-') || key.chars().any(char::is_whitespace) {
                return Err(invalid(format!("bad argument name '{}'", arg.key)));
            }
            argv.push(format!("--{}", key));
            argv.extend(arg.values.iter().cloned());
        }
        Ok(argv)
    }
}

#[async_trait]
impl CommandResolver for ScriptResolver {
    async fn resolve(&self, command: &JobCommand) -> JobResultOf<ResolvedCommand> {
        if command.script.as_os_str().is_empty() {
            return Err(invalid(String::from("script path is empty")));
        }
        let script = self.script_path(&command.script)?;
        let meta = match tokio::fs::metadata(&script).await {
            Ok(m) => m,
            Err(e) => {
                return Err(invalid(format!("script {} is not accessible: {}", script.display(), e)));
            }
        };
        if !meta.is_file() {
            return Err(invalid(format!("script {} is not a regular file", script.display())));
        }

        let mut argv = Vec::with_capacity(command.args.len() * 2 + 1);
        let program = match &self.interpreter {
            Some(interpreter) => {
                argv.push(script.to_string_lossy().into_owned());
                self.interpreter_path(interpreter)?
            }
            None => {
                if !is_executable(&meta) {
                    return Err(invalid(format!(
                        "script {} is not executable and no interpreter is configured",
                        script.display()
                    )));
                }
                script
            }
        };
        argv.extend(Self::render_args(command)?);

        let mut resolved = ResolvedCommand::new(program);
        resolved.args = argv;
        Ok(resolved)
    }
}

/// Reads `<work_dir>/result.json` when the job left one behind.
#[derive(Debug, Clone, Default)]
pub struct JsonResultExtractor;

#[async_trait]
impl ResultExtractor for JsonResultExtractor {
    async fn extract(&self, work_dir: &Path) -> Result<Option<Value>> {
        let path = work_dir.join(RESULT_FILE_NAME);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(orch_error_with_source!(e, "{} is not valid JSON", path.display()).into()),
        }
    }
}
