//! Fixed-size thread pool for blocking work

use crossbeam_channel::{unbounded, Sender};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Thread pool is shut down")]
pub struct PoolClosed;

pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Start `size` threads named `{name_prefix}-{i}`
    pub fn new(size: usize, name_prefix: &str) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let mut threads = Vec::with_capacity(size);
        for i in 0..size.max(1) {
            let receiver = receiver.clone();
            let name = format!("{}-{}", name_prefix, i);
            let thread_name = name.clone();
            threads.push(std::thread::Builder::new().name(name).spawn(move || {
                // Ends once every sender is gone
                for job in receiver.iter() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!(thread = %thread_name, "pool job panicked");
                    }
                }
            })?);
        }
        Ok(ThreadPool {
            sender: Some(sender),
            threads,
        })
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Queue a job; fails only after shutdown
    pub fn execute<F>(&self, job: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolClosed)?;
        sender.send(Box::new(job)).map_err(|_| PoolClosed)
    }

    /// Let queued jobs finish, then join every thread
    pub fn shutdown(mut self) {
        self.sender.take();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Threads drain and exit on their own
        self.sender.take();
    }
}
