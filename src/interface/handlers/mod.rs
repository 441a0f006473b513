use crate::core::jobs::{JobId, JobManager};
use crate::err::JobResultOf;
use crate::interface::handlers::cancel_job::cancel_job;
use crate::interface::handlers::job_log::job_log;
use crate::interface::handlers::job_result::job_result;
use crate::interface::handlers::job_status::job_status;
use crate::interface::handlers::list_jobs::list_jobs;
use crate::interface::handlers::submit_job::submit_job;
use crate::interface::request::Request;
use serde_json::Value;

mod cancel_job;
mod job_log;
mod job_result;
mod job_status;
mod list_jobs;
mod submit_job;

fn to_value<T: serde::Serialize>(v: &T) -> JobResultOf<Value> {
    serde_json::to_value(v).map_err(|e| crate::err::JobError::Internal(Box::new(e)))
}

pub async fn run_handler(manager: &JobManager, request: Request) -> JobResultOf<Value> {
    match request {
        Request::Submit { script, args, name } => submit_job(manager, script, args, name).await,
        Request::Status { job_id } => job_status(manager, &JobId::parse(&job_id)?).await,
        Request::Result { job_id } => job_result(manager, &JobId::parse(&job_id)?).await,
        Request::Log { job_id, tail } => job_log(manager, &JobId::parse(&job_id)?, tail).await,
        Request::Cancel { job_id } => cancel_job(manager, &JobId::parse(&job_id)?).await,
        Request::List { status } => list_jobs(manager, status).await,
    }
}
