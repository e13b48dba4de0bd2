//! Worker supervision and execution surfaces
//!
//! [`Supervisor`] keeps N workers alive. Each worker is a thread
//! ([`ThreadSpawner`]) or a forked process ([`ProcessSpawner`]) running the
//! same entry function with its own slot index. A monitor tick checks every
//! slot for liveness and, when a health check is installed, for a fresh
//! heartbeat; unhealthy slots are replaced under the same index and name.
//!
//! [`ThreadPool`] and [`HybridExecutor`] are the execution surfaces used by the
//! request path: blocking work goes to the pool, futures go to the executor's
//! event loop thread.

pub mod executor;
pub mod heartbeat;
pub mod pool;
pub mod process;
pub mod supervisor;
pub mod thread;

pub use executor::{Completion, ExecutorError, HybridExecutor, Work};
pub use heartbeat::{heartbeat_predicate, Heartbeat, HeartbeatStore, HeartbeatTable, Serving, SharedHeartbeats};
pub use pool::{PoolClosed, ThreadPool};
pub use process::{ProcessSpawner, ProcessWorker};
pub use supervisor::{HealthCheck, Spawner, Supervisor, WorkerHandle, WorkerStatus};
pub use thread::{ThreadSpawner, ThreadWorker};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result type for supervision
pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {name} never reported a heartbeat")]
    NoHeartbeat { name: String },

    #[error("Health check for worker {name} failed: {reason}")]
    HealthCheck { name: String, reason: String },

    #[error("Supervisor already stopped")]
    Stopped,
}

/// Entry function shared by every worker of a pool
pub type WorkerEntry = Arc<dyn Fn(WorkerContext) + Send + Sync>;

/// What a running worker knows about itself
#[derive(Clone)]
pub struct WorkerContext {
    pub index: usize,
    pub name: String,
    stop: Arc<AtomicBool>,
    heartbeat: Option<Heartbeat>,
}

impl WorkerContext {
    pub fn new(index: usize, name: impl Into<String>, stop: Arc<AtomicBool>, heartbeat: Option<Heartbeat>) -> Self {
        WorkerContext {
            index,
            name: name.into(),
            stop,
            heartbeat,
        }
    }

    /// The supervisor asked this worker to finish
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire) || process::terminate_requested()
    }

    /// Record liveness; a no-op when the pool has no heartbeat store
    pub fn beat(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.beat();
        }
    }

    /// Mark the worker busy with a connection until the guard drops
    pub fn serving(&self) -> Option<Serving<'_>> {
        self.heartbeat.as_ref().map(Heartbeat::serving)
    }

    /// Same worker, without write access to its heartbeat slot
    ///
    /// For helper threads of a worker; the slot keeps a single writer.
    pub fn without_heartbeat(&self) -> Self {
        WorkerContext {
            heartbeat: None,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}

/// `{prefix}-{index}`
pub fn worker_name(prefix: &str, index: usize) -> String {
    format!("{}-{}", prefix, index)
}
