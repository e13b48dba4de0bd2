//! One execution surface for futures and blocking calls
//!
//! [`HybridExecutor`] owns a dedicated event loop thread and a
//! [`ThreadPool`]. [`execute`](HybridExecutor::execute) routes a
//! [`Work::Async`] future to the loop and a [`Work::Blocking`] closure to the
//! pool. Either way the caller gets a [`Completion`], which can be awaited on
//! an event loop or waited on from an ordinary thread.

use super::pool::ThreadPool;
use crate::handler::BoxFuture;
use crate::xsocket::event_loop;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor is shut down")]
    Closed,

    #[error("Work was cancelled or panicked")]
    Canceled,

    #[error("Blocking wait attempted on an event loop thread")]
    BlockingOnEventLoop,
}

/// A unit of work in either shape
pub enum Work<T> {
    Blocking(Box<dyn FnOnce() -> T + Send + 'static>),
    Async(BoxFuture<'static, T>),
}

/// The eventual result of submitted work
#[must_use = "dropping a Completion discards the result"]
pub struct Completion<T> {
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Completion<T> {
    fn closed() -> Self {
        Completion { rx: None }
    }

    /// Block the current thread until the work finished
    ///
    /// Fails instead of blocking when called from inside a tokio runtime.
    pub fn wait(self) -> Result<T, ExecutorError> {
        let rx = self.rx.ok_or(ExecutorError::Closed)?;
        if Handle::try_current().is_ok() || event_loop::is_event_loop_thread() {
            return Err(ExecutorError::BlockingOnEventLoop);
        }
        rx.blocking_recv().map_err(|_| ExecutorError::Canceled)
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, ExecutorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            None => Poll::Ready(Err(ExecutorError::Closed)),
            Some(rx) => Pin::new(rx).poll(cx).map(|r| r.map_err(|_| ExecutorError::Canceled)),
        }
    }
}

pub struct HybridExecutor {
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    pool: ThreadPool,
}

impl HybridExecutor {
    /// Start the loop thread `{prefix}-loop` and `threads` pool threads
    pub fn new(threads: usize, name_prefix: &str) -> io::Result<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let loop_thread = std::thread::Builder::new()
            .name(format!("{}-loop", name_prefix))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _mark = event_loop::enter();
                let (stop_tx, stop_rx) = oneshot::channel::<()>();
                if ready_tx.send(Ok((runtime.handle().clone(), stop_tx))).is_err() {
                    return;
                }
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
            })?;

        let (handle, stop) = ready_rx
            .recv()
            .map_err(|_| io::Error::other("executor loop thread exited during startup"))??;

        Ok(HybridExecutor {
            handle,
            stop: Mutex::new(Some(stop)),
            loop_thread: Mutex::new(Some(loop_thread)),
            pool: ThreadPool::new(threads, &format!("{}-pool", name_prefix))?,
        })
    }

    /// Handle of the executor's event loop
    pub fn loop_handle(&self) -> &Handle {
        &self.handle
    }

    pub fn execute<T: Send + 'static>(&self, work: Work<T>) -> Completion<T> {
        match work {
            Work::Blocking(f) => self.run_blocking(f),
            Work::Async(fut) => self.spawn_async(fut),
        }
    }

    /// Run a blocking closure on the pool
    pub fn run_blocking<F, T>(&self, f: F) -> Completion<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        match self.pool.execute(move || {
            let _ = tx.send(f());
        }) {
            Ok(()) => Completion { rx: Some(rx) },
            Err(_) => Completion::closed(),
        }
    }

    /// Run a future on the executor's event loop
    pub fn spawn_async<F>(&self, fut: F) -> Completion<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        Completion { rx: Some(rx) }
    }

    /// Stop the loop thread and wait for it
    ///
    /// Work still queued on the loop is dropped; its completions report
    /// [`ExecutorError::Canceled`].
    pub fn shutdown(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        if event_loop::is_event_loop_thread() {
            return;
        }
        if let Some(thread) = self.loop_thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HybridExecutor {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

impl std::fmt::Debug for HybridExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridExecutor")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}
