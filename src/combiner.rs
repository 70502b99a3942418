//! The combiner: a per-connection execution context that runs submitted
//! work items strictly one at a time, in submission order.
//!
//! Generalizes the base crate's `CommandQueue`
//! (`protocol::rpc::command_queue::CommandQueue`) from "RPC byte buffers in,
//! response buffers out" to "boxed futures in, nothing out": the same
//! `mpsc::unbounded_channel` plus single `tokio::spawn`'d consumer shape,
//! minus the RPC-specific processor/result-channel plumbing. Anything that
//! mutates a connection's shared state (the stream table, in-flight credit
//! bookkeeping, deferred trailing-metadata firing) is submitted here so it
//! never races against itself.
//!
//! Every call to [`Combiner::run`] enqueues, even when called from a task
//! that happens to already be running on this combiner; nothing in this
//! engine ever calls into a combiner from within its own consumer task, so
//! there is no reentrancy case to special-case.

use anyhow::anyhow;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A unit of work the combiner will run to completion before starting the
/// next one.
pub type CombinerTask = BoxFuture<'static, ()>;

/// A handle to a running combiner. Cloning shares the same underlying
/// consumer task and ordering.
#[derive(Clone)]
pub struct Combiner {
    sender: mpsc::UnboundedSender<CombinerTask>,
}

impl Combiner {
    /// Spawns the consumer task and returns a handle to submit work to it.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<CombinerTask>();
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task.await;
            }
            debug!("combiner consumer task finished");
        });
        Self { sender }
    }

    /// Enqueues `task`. Returns an error only if the consumer task has
    /// already exited, which happens once every handle to this combiner
    /// has been dropped.
    pub fn run(&self, task: CombinerTask) -> anyhow::Result<()> {
        self.sender.send(task).map_err(|_| {
            error!("attempted to submit work to a combiner whose consumer task has exited");
            anyhow!("combiner consumer task has exited")
        })
    }
}

impl Default for Combiner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let combiner = Combiner::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            combiner
                .run(Box::pin(async move {
                    order.lock().unwrap().push(i);
                }))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn one_task_never_overlaps_the_next() {
        let combiner = Combiner::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            combiner
                .run(Box::pin(async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
