use crate::core::jobs::{JobId, JobManager};
use crate::err::JobResultOf;
use serde_json::{Value, json};

pub async fn job_log(manager: &JobManager, job_id: &JobId, tail: usize) -> JobResultOf<Value> {
    let log = manager.log(job_id, tail).await?;
    let status = manager.status(job_id).await?.status;
    Ok(json!({
        "job_id": job_id,
        "status": status,
        "total_lines": log.total_lines,
        "lines": log.lines,
    }))
}
