pub mod task_queue;

use async_trait::async_trait;

use crate::err::Result;

pub use task_queue::{TaskQueue, TaskQueueConfig, TaskQueueSender};

/// Unit of work accepted by a [`TaskQueue`].
#[async_trait]
pub trait AsyncHandleable: Send + 'static {
    async fn handle(&mut self) -> Result<()>;
}
