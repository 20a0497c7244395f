//! In-process FIFO task queue
//!
//! The default scheduling mode when no broker is configured: posted
//! operations enqueue an apply task here, and a single drain loop
//! executes them strictly in arrival order. One task at a time, so
//! in-process ordering needs no further coordination.
//!
//! A failing task is logged and dropped; the loop moves on to the next
//! task. The operation table still holds the failed operation as
//! pending, so a later poll retries it.

use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Task = BoxFuture<'static, Result<()>>;

/// FIFO queue of apply tasks with a single drain loop
#[derive(Clone)]
pub struct FifoQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,
}

impl FifoQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Append a task to the tail
    pub fn enqueue(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    /// Number of tasks waiting
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Spawn the drain loop
    ///
    /// Runs tasks head-first, one at a time, sleeping `poll_interval`
    /// when the queue is empty. Stops when `shutdown` flips to true.
    pub fn start(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    debug!("queue drain loop stopping");
                    return;
                }

                // Never hold the lock across the await.
                let task = tasks.lock().pop_front();
                match task {
                    Some(task) => {
                        if let Err(error) = task.await {
                            warn!(%error, "queued task failed");
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
            }
        })
    }
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self::new()
    }
}
