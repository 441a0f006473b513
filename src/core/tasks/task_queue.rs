use crate::core::tasks::AsyncHandleable;
use crate::err::Result;
use crate::global_var::LOGGER;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// Async task queue backed by a tokio mpsc channel. A single consumer
/// receives queued items and spawns one task per item, so a slow item never
/// holds back the ones queued behind it.
#[derive(Debug)]
pub struct TaskQueue {
    tx: mpsc::Sender<QueueMsg>,
    worker: JoinHandle<()>,
}

/// Cloneable sending handle.
#[derive(Clone)]
pub struct TaskQueueSender {
    tx: mpsc::Sender<QueueMsg>,
}

impl TaskQueueSender {
    /// Waits for capacity when the queue is full.
    pub async fn send(&self, msg: Box<dyn AsyncHandleable>) -> Result<()> {
        if self.tx.send(QueueMsg::Item(msg)).await.is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "TaskQueue worker task is not running",
            )
            .into());
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TaskQueueConfig {
    /// Max queued items before backpressure. If 0, a very large bound is used.
    pub queue_bound: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self { queue_bound: 1024 }
    }
}

enum QueueMsg {
    Item(Box<dyn AsyncHandleable>),
    Shutdown,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        let bound = if config.queue_bound == 0 {
            tokio::sync::Semaphore::MAX_PERMITS
        } else {
            config.queue_bound
        };
        let (tx, mut rx) = mpsc::channel(bound);

        let worker = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(QueueMsg::Item(item)) => Self::dispatch(&mut in_flight, item),
                        Some(QueueMsg::Shutdown) | None => break,
                    },
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                }
            }
            // Items already handed out run to completion.
            while in_flight.join_next().await.is_some() {}
        });

        Self { tx, worker }
    }

    fn dispatch(in_flight: &mut JoinSet<()>, mut msg: Box<dyn AsyncHandleable>) {
        in_flight.spawn(async move {
            if let Err(e) = msg.handle().await {
                LOGGER.error(format!("An error occurred while handling task: {:?}", e));
            }
        });
    }

    pub fn sender(&self) -> TaskQueueSender {
        TaskQueueSender {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting, then wait for the consumer and every dispatched item.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.tx.send(QueueMsg::Shutdown).await;
        if let Err(e) = self.worker.await {
            LOGGER.error(format!("TaskQueue worker ended abnormally: {:?}", e));
        }
        Ok(())
    }
}
