//! Process workers
//!
//! Workers are forked from the supervisor and inherit everything it set up
//! beforehand: a pre-bound listener, the shared heartbeat mapping. A child
//! runs the entry function and exits with `_exit`, so it never returns into
//! the parent's stack. `SIGTERM` asks a child to finish; the entry sees it
//! through [`WorkerContext::should_stop`](super::WorkerContext::should_stop).

use super::heartbeat::{Heartbeat, HeartbeatStore};
use super::supervisor::{Spawner, WorkerHandle};
use super::{WorkerContext, WorkerEntry};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Whether this process received `SIGTERM` as a worker
pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::Relaxed)
}

#[cfg(target_os = "linux")]
fn set_process_name(name: &str) {
    // The kernel keeps 15 bytes
    let short: String = name.chars().take(15).collect();
    if let Ok(cname) = std::ffi::CString::new(short) {
        // SAFETY: PR_SET_NAME reads a NUL-terminated string
        unsafe {
            libc::prctl(libc::PR_SET_NAME, cname.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_process_name(_name: &str) {}

pub struct ProcessSpawner {
    entry: WorkerEntry,
    heartbeats: Option<Arc<dyn HeartbeatStore>>,
}

impl ProcessSpawner {
    pub fn new(entry: WorkerEntry) -> Self {
        ProcessSpawner {
            entry,
            heartbeats: None,
        }
    }

    /// The store must be process-shared, such as
    /// [`SharedHeartbeats`](super::SharedHeartbeats)
    pub fn with_heartbeats(mut self, store: Arc<dyn HeartbeatStore>) -> Self {
        self.heartbeats = Some(store);
        self
    }
}

impl Spawner for ProcessSpawner {
    type Worker = ProcessWorker;

    fn spawn(&mut self, index: usize, name: &str) -> io::Result<ProcessWorker> {
        // SAFETY: the child only runs the entry function and then _exits
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }

        if pid == 0 {
            // SAFETY: installing a handler that only stores an atomic
            unsafe {
                libc::signal(libc::SIGTERM, on_sigterm as extern "C" fn(libc::c_int) as libc::sighandler_t);
            }
            set_process_name(name);
            let heartbeat = self.heartbeats.as_ref().map(|store| Heartbeat::new(Arc::clone(store), index));
            let ctx = WorkerContext::new(index, name, Arc::new(AtomicBool::new(false)), heartbeat);
            let code = match catch_unwind(AssertUnwindSafe(|| (self.entry)(ctx))) {
                Ok(()) => 0,
                Err(_) => {
                    tracing::error!(worker = %name, "worker process panicked");
                    70
                }
            };
            // SAFETY: leaves the child without unwinding into the parent's frames
            unsafe { libc::_exit(code) };
        }

        Ok(ProcessWorker {
            name: name.to_string(),
            pid,
            exited: false,
        })
    }

    fn on_restart(&mut self, index: usize) {
        if let Some(store) = &self.heartbeats {
            store.reset(index);
        }
    }
}

#[derive(Debug)]
pub struct ProcessWorker {
    name: String,
    pid: libc::pid_t,
    exited: bool,
}

impl ProcessWorker {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Non-blocking reap; true once the child is gone
    fn try_wait(&mut self) -> bool {
        if self.exited {
            return true;
        }
        let mut status = 0;
        // SAFETY: waiting on our own child
        let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        if rc == self.pid || rc < 0 {
            self.exited = true;
            if rc == self.pid && libc::WIFSIGNALED(status) {
                tracing::debug!(worker = %self.name, signal = libc::WTERMSIG(status), "worker process killed");
            }
        }
        self.exited
    }
}

impl WorkerHandle for ProcessWorker {
    fn is_alive(&mut self) -> bool {
        !self.try_wait()
    }

    fn terminate(&mut self) {
        if !self.exited {
            // SAFETY: signalling our own child
            unsafe {
                libc::kill(self.pid, libc::SIGTERM);
            }
        }
    }

    fn reap(mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.try_wait() {
            if Instant::now() >= deadline {
                tracing::warn!(worker = %self.name, pid = self.pid, "worker process ignored SIGTERM, killing");
                // SAFETY: killing and reaping our own child
                unsafe {
                    libc::kill(self.pid, libc::SIGKILL);
                    let mut status = 0;
                    libc::waitpid(self.pid, &mut status, 0);
                }
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn describe(&self) -> String {
        format!("pid {}", self.pid)
    }
}
