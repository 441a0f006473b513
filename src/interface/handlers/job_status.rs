use crate::core::jobs::{JobId, JobManager};
use crate::err::JobResultOf;
use crate::interface::handlers::to_value;
use serde_json::Value;

pub async fn job_status(manager: &JobManager, job_id: &JobId) -> JobResultOf<Value> {
    to_value(&manager.status(job_id).await?)
}
