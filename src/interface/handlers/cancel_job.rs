use crate::core::jobs::{JobId, JobManager};
use crate::err::JobResultOf;
use crate::global_var::LOGGER;
use crate::interface::handlers::to_value;
use serde_json::Value;

pub async fn cancel_job(manager: &JobManager, job_id: &JobId) -> JobResultOf<Value> {
    let outcome = manager.cancel(job_id).await?;
    LOGGER.info(format!("Cancel request for job {}: {:?}", job_id, &outcome));
    let mut value = to_value(&outcome)?;
    if let Value::Object(map) = &mut value {
        map.insert(String::from("job_id"), Value::String(job_id.to_string()));
    }
    Ok(value)
}
