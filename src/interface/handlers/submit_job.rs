use crate::core::jobs::JobManager;
use crate::err::JobResultOf;
use crate::interface::request::{SubmitArgs, build_command};
use serde_json::{Value, json};
use std::path::PathBuf;

pub async fn submit_job(
    manager: &JobManager,
    script: PathBuf,
    args: SubmitArgs,
    name: Option<String>,
) -> JobResultOf<Value> {
    let command = build_command(script, args)?;
    let job_id = manager.submit(command, name).await?;
    let view = manager.status(&job_id).await?;
    Ok(json!({
        "job_id": job_id,
        "name": view.name,
        "status": view.status,
    }))
}
