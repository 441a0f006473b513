pub mod config;
pub mod core;
pub mod err;
pub mod global_var;
pub mod interface;
pub mod utilities;

pub use crate::core::jobs::{JobId, JobManager, JobStatus};
