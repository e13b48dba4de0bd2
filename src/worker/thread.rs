//! Thread workers

use super::heartbeat::{Heartbeat, HeartbeatStore};
use super::supervisor::{Spawner, WorkerHandle};
use super::{WorkerContext, WorkerEntry};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub struct ThreadSpawner {
    entry: WorkerEntry,
    heartbeats: Option<Arc<dyn HeartbeatStore>>,
}

impl ThreadSpawner {
    pub fn new(entry: WorkerEntry) -> Self {
        ThreadSpawner {
            entry,
            heartbeats: None,
        }
    }

    pub fn with_heartbeats(mut self, store: Arc<dyn HeartbeatStore>) -> Self {
        self.heartbeats = Some(store);
        self
    }
}

impl Spawner for ThreadSpawner {
    type Worker = ThreadWorker;

    fn spawn(&mut self, index: usize, name: &str) -> std::io::Result<ThreadWorker> {
        let stop = Arc::new(AtomicBool::new(false));
        let heartbeat = self.heartbeats.as_ref().map(|store| Heartbeat::new(Arc::clone(store), index));
        let ctx = WorkerContext::new(index, name, Arc::clone(&stop), heartbeat);
        let entry = Arc::clone(&self.entry);
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
            if catch_unwind(AssertUnwindSafe(|| entry(ctx))).is_err() {
                tracing::error!(worker = %thread_name, "worker thread panicked");
            }
        })?;

        Ok(ThreadWorker {
            name: name.to_string(),
            handle: Some(handle),
            stop,
        })
    }

    fn on_restart(&mut self, index: usize) {
        if let Some(store) = &self.heartbeats {
            store.reset(index);
        }
    }
}

pub struct ThreadWorker {
    name: String,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WorkerHandle for ThreadWorker {
    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn terminate(&mut self) {
        self.stop.store(true, Ordering::Release);
    }

    fn reap(mut self, timeout: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                // Threads cannot be killed; it exits whenever its entry returns
                tracing::warn!(worker = %self.name, "worker thread did not stop, detaching");
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = handle.join();
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Supervisor;
    use parking_lot::Mutex;

    #[test]
    fn test_threads_run_and_stop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let entry: WorkerEntry = Arc::new(move |ctx: WorkerContext| {
            recorded.lock().push((ctx.index, std::thread::current().name().map(str::to_string)));
            while !ctx.should_stop() {
                std::thread::sleep(Duration::from_millis(2));
            }
        });

        let mut sup = Supervisor::start(ThreadSpawner::new(entry), 3, "t").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!((0..3).all(|i| sup.is_alive(i)));
        sup.stop();

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (0, Some("t-0".to_string())),
                (1, Some("t-1".to_string())),
                (2, Some("t-2".to_string())),
            ]
        );
    }

    #[test]
    fn test_panicking_worker_is_restarted() {
        let starts = Arc::new(Mutex::new(vec![0u32; 2]));
        let counter = Arc::clone(&starts);
        let entry: WorkerEntry = Arc::new(move |ctx: WorkerContext| {
            let first = {
                let mut starts = counter.lock();
                starts[ctx.index] += 1;
                starts[ctx.index] == 1
            };
            if ctx.index == 1 && first {
                panic!("boom");
            }
            while !ctx.should_stop() {
                std::thread::sleep(Duration::from_millis(2));
            }
        });

        let mut sup = Supervisor::start(ThreadSpawner::new(entry), 2, "p").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sup.monitor_tick().unwrap(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sup.monitor_tick().unwrap(), 0);
        assert_eq!(sup.restart_count(1), Some(1));
        assert_eq!(*starts.lock(), vec![1, 2]);
        sup.stop();
    }
}
