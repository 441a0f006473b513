use crate::core::jobs::{JobId, JobManager};
use crate::err::JobResultOf;
use crate::interface::handlers::to_value;
use serde_json::Value;

pub async fn job_result(manager: &JobManager, job_id: &JobId) -> JobResultOf<Value> {
    to_value(&manager.result(job_id).await?)
}
