//! Handler handoff for threaded HTTP/2 connections
//!
//! In thread mode the HTTP/2 engine runs on its own event loop thread while
//! the worker thread that accepted the connection waits. Blocking handlers
//! must not run on the loop, so the engine posts them back to the worker
//! through a [`HandoffSender`] and the worker runs them from
//! [`HandoffQueue::drain`].

use super::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Posting side, held by the engine
#[derive(Clone)]
pub struct HandoffSender {
    tx: Sender<Job>,
}

impl HandoffSender {
    /// Run `f` on the draining thread and await its result
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move || {
                let _ = result_tx.send(f());
            }))
            .map_err(|_| Error::ConnectionClosed)?;
        result_rx
            .await
            .map_err(|_| Error::Internal("handed-off handler did not complete".to_string()))
    }
}

impl std::fmt::Debug for HandoffSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffSender")
            .field("queued", &self.tx.len())
            .finish()
    }
}

/// Receiving side, drained by the worker thread
pub struct HandoffQueue {
    rx: Receiver<Job>,
}

impl HandoffQueue {
    pub fn new() -> (HandoffSender, HandoffQueue) {
        let (tx, rx) = unbounded();
        (HandoffSender { tx }, HandoffQueue { rx })
    }

    /// Run posted jobs until every sender is gone, or until `finished`
    /// reports true while the queue is idle
    ///
    /// Returns the number of jobs run.
    pub fn drain(&self, poll: Duration, finished: impl Fn() -> bool) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.recv_timeout(poll) {
                Ok(job) => {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("handed-off handler panicked");
                    }
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if finished() {
                        return ran;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return ran,
            }
        }
    }
}
