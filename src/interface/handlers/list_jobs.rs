use crate::core::jobs::{JobManager, JobStatus};
use crate::err::JobResultOf;
use serde_json::{Value, json};

pub async fn list_jobs(manager: &JobManager, status: Option<JobStatus>) -> JobResultOf<Value> {
    let jobs = manager.list(status).await;
    Ok(json!({
        "total": jobs.len(),
        "jobs": jobs,
    }))
}
