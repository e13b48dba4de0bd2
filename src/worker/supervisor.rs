//! Slot-based worker supervisor

use super::{worker_name, Result, SupervisorError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long an orderly stop waits for a worker before forcing it
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// One running worker, thread or process
pub trait WorkerHandle: Send {
    fn is_alive(&mut self) -> bool;

    /// Ask the worker to finish
    fn terminate(&mut self);

    /// Wait up to `timeout` for the worker to finish, then force it
    fn reap(self, timeout: Duration);

    /// Thread name or process id, for logs
    fn describe(&self) -> String;
}

/// Starts workers for a slot
pub trait Spawner: Send + 'static {
    type Worker: WorkerHandle;

    fn spawn(&mut self, index: usize, name: &str) -> std::io::Result<Self::Worker>;

    /// Called when a slot gets a replacement worker
    fn on_restart(&mut self, _index: usize) {}
}

/// What a health check sees about one slot
#[derive(Debug, Clone, Copy)]
pub struct WorkerStatus<'a> {
    pub index: usize,
    pub name: &'a str,
    /// Time since the current worker of this slot was started
    pub uptime: Duration,
}

/// `Ok(false)` and `Err` both mark the worker unhealthy; `Err` is logged loudly
pub type HealthCheck = Box<dyn Fn(&WorkerStatus<'_>) -> Result<bool> + Send + Sync>;

struct Slot<W> {
    name: String,
    worker: Option<W>,
    started: Instant,
    restarts: u32,
}

struct Inner<S: Spawner> {
    spawner: S,
    slots: Vec<Slot<S::Worker>>,
    health_check: Option<HealthCheck>,
    stopped: bool,
}

/// Keeps `count` workers alive under stable indexes and names
pub struct Supervisor<S: Spawner> {
    inner: Arc<Mutex<Inner<S>>>,
    monitor: Option<JoinHandle<()>>,
    monitor_stop: Arc<AtomicBool>,
}

impl<S: Spawner> Supervisor<S> {
    /// Spawn workers `{prefix}-0` .. `{prefix}-{count-1}`
    pub fn start(mut spawner: S, count: usize, name_prefix: &str) -> Result<Self> {
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            let name = worker_name(name_prefix, index);
            let worker = spawner.spawn(index, &name).map_err(|source| SupervisorError::Spawn {
                name: name.clone(),
                source,
            })?;
            tracing::debug!(worker = %name, id = %worker.describe(), "worker started");
            slots.push(Slot {
                name,
                worker: Some(worker),
                started: Instant::now(),
                restarts: 0,
            });
        }
        tracing::info!(count, prefix = name_prefix, "worker pool started");

        Ok(Supervisor {
            inner: Arc::new(Mutex::new(Inner {
                spawner,
                slots,
                health_check: None,
                stopped: false,
            })),
            monitor: None,
            monitor_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Install a health check consulted on every monitor tick
    pub fn set_health_check(&self, check: HealthCheck) {
        self.inner.lock().health_check = Some(check);
    }

    /// Run [`monitor_tick`](Self::monitor_tick) on a background thread
    pub fn spawn_monitor(&mut self, interval: Duration) -> Result<()> {
        if self.monitor.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&self.monitor_stop);
        let handle = std::thread::Builder::new()
            .name("xserve-monitor".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = tick(&inner) {
                        tracing::error!(error = %err, "worker health check failed");
                    }
                }
            })
            .map_err(|source| SupervisorError::Spawn {
                name: "xserve-monitor".to_string(),
                source,
            })?;
        self.monitor = Some(handle);
        Ok(())
    }

    /// Check every slot once and restart the unhealthy ones
    ///
    /// Returns how many slots were restarted. A health check error still
    /// restarts its slot and is returned after all slots were handled.
    pub fn monitor_tick(&self) -> Result<usize> {
        tick(&self.inner)
    }

    pub fn restart_count(&self, index: usize) -> Option<u32> {
        self.inner.lock().slots.get(index).map(|slot| slot.restarts)
    }

    pub fn worker_name(&self, index: usize) -> Option<String> {
        self.inner.lock().slots.get(index).map(|slot| slot.name.clone())
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Whether slot `index` currently has a live worker
    pub fn is_alive(&self, index: usize) -> bool {
        let mut inner = self.inner.lock();
        inner
            .slots
            .get_mut(index)
            .and_then(|slot| slot.worker.as_mut())
            .is_some_and(|worker| worker.is_alive())
    }

    /// Stop the monitor, signal every worker, then reap them
    pub fn stop(&mut self) {
        self.monitor_stop.store(true, Ordering::Release);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }

        let workers: Vec<(String, S::Worker)> = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner
                .slots
                .iter_mut()
                .filter_map(|slot| slot.worker.take().map(|w| (slot.name.clone(), w)))
                .collect()
        };

        let mut workers = workers;
        for (_, worker) in workers.iter_mut() {
            worker.terminate();
        }
        for (name, worker) in workers {
            worker.reap(STOP_TIMEOUT);
            tracing::debug!(worker = %name, "worker stopped");
        }
    }
}

impl<S: Spawner> Drop for Supervisor<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Replaced workers, terminated but not yet reaped
type Retired<W> = Vec<(String, W)>;

fn tick<S: Spawner>(inner: &Mutex<Inner<S>>) -> Result<usize> {
    let mut retired = Vec::new();
    let result = check_slots(&mut inner.lock(), &mut retired);

    // Reaping may take STOP_TIMEOUT; queries must not wait for it
    for (name, worker) in retired {
        worker.reap(STOP_TIMEOUT);
        tracing::debug!(worker = %name, "replaced worker reaped");
    }
    result
}

fn check_slots<S: Spawner>(inner: &mut Inner<S>, retired: &mut Retired<S::Worker>) -> Result<usize> {
    if inner.stopped {
        return Err(SupervisorError::Stopped);
    }

    let mut restarted = 0;
    let mut first_error = None;

    for index in 0..inner.slots.len() {
        let healthy = {
            let slot = &mut inner.slots[index];
            let alive = slot.worker.as_mut().is_some_and(|w| w.is_alive());
            if !alive {
                tracing::error!(worker = %slot.name, restarts = slot.restarts, "worker died");
                false
            } else if let Some(check) = &inner.health_check {
                let status = WorkerStatus {
                    index,
                    name: &slot.name,
                    uptime: slot.started.elapsed(),
                };
                match check(&status) {
                    Ok(true) => true,
                    Ok(false) => {
                        tracing::warn!(worker = %slot.name, "worker unhealthy");
                        false
                    }
                    Err(err) => {
                        tracing::error!(worker = %slot.name, error = %err, "health check error");
                        first_error.get_or_insert(err);
                        false
                    }
                }
            } else {
                true
            }
        };

        if !healthy {
            restart(inner, index, retired)?;
            restarted += 1;
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(restarted),
    }
}

fn restart<S: Spawner>(inner: &mut Inner<S>, index: usize, retired: &mut Retired<S::Worker>) -> Result<()> {
    let name = inner.slots[index].name.clone();
    if let Some(mut old) = inner.slots[index].worker.take() {
        old.terminate();
        retired.push((name.clone(), old));
    }

    inner.spawner.on_restart(index);
    let worker = inner
        .spawner
        .spawn(index, &name)
        .map_err(|source| SupervisorError::Spawn {
            name: name.clone(),
            source,
        })?;

    let slot = &mut inner.slots[index];
    slot.restarts += 1;
    slot.started = Instant::now();
    tracing::info!(worker = %name, id = %worker.describe(), restarts = slot.restarts, "worker restarted");
    slot.worker = Some(worker);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Fake workers whose liveness the test controls
    #[derive(Default, Clone)]
    struct Flags {
        dead: Arc<Mutex<Vec<bool>>>,
        spawned: Arc<AtomicUsize>,
    }

    struct FakeWorker {
        index: usize,
        flags: Flags,
        reap_delay: Duration,
    }

    impl WorkerHandle for FakeWorker {
        fn is_alive(&mut self) -> bool {
            !self.flags.dead.lock()[self.index]
        }

        fn terminate(&mut self) {}

        fn reap(self, _timeout: Duration) {
            std::thread::sleep(self.reap_delay);
        }

        fn describe(&self) -> String {
            format!("fake-{}", self.index)
        }
    }

    struct FakeSpawner(Flags, Duration);

    impl Spawner for FakeSpawner {
        type Worker = FakeWorker;

        fn spawn(&mut self, index: usize, _name: &str) -> std::io::Result<FakeWorker> {
            let mut dead = self.0.dead.lock();
            if dead.len() <= index {
                dead.resize(index + 1, false);
            }
            dead[index] = false;
            self.0.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(FakeWorker {
                index,
                flags: self.0.clone(),
                reap_delay: self.1,
            })
        }
    }

    #[test]
    fn test_one_dead_slot_restarted() {
        let flags = Flags::default();
        let sup = Supervisor::start(FakeSpawner(flags.clone(), Duration::ZERO), 4, "w").unwrap();
        assert_eq!(sup.monitor_tick().unwrap(), 0);

        flags.dead.lock()[2] = true;
        assert_eq!(sup.monitor_tick().unwrap(), 1);
        assert_eq!(sup.monitor_tick().unwrap(), 0);

        assert_eq!(sup.restart_count(2), Some(1));
        for other in [0, 1, 3] {
            assert_eq!(sup.restart_count(other), Some(0));
        }
        assert_eq!(sup.worker_name(2).as_deref(), Some("w-2"));
        assert_eq!(flags.spawned.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_health_check_error_restarts_and_reports() {
        let flags = Flags::default();
        let sup = Supervisor::start(FakeSpawner(flags, Duration::ZERO), 2, "w").unwrap();
        sup.set_health_check(Box::new(|status: &WorkerStatus<'_>| {
            if status.index == 1 {
                Err(SupervisorError::NoHeartbeat {
                    name: status.name.to_string(),
                })
            } else {
                Ok(true)
            }
        }));
        assert!(matches!(sup.monitor_tick(), Err(SupervisorError::NoHeartbeat { .. })));
        assert_eq!(sup.restart_count(1), Some(1));
        assert_eq!(sup.restart_count(0), Some(0));
    }

    #[test]
    fn test_slow_reap_does_not_block_queries() {
        let flags = Flags::default();
        let spawner = FakeSpawner(flags.clone(), Duration::from_millis(500));
        let sup = Arc::new(Supervisor::start(spawner, 2, "w").unwrap());
        flags.dead.lock()[0] = true;

        let ticking = Arc::clone(&sup);
        let tick = std::thread::spawn(move || ticking.monitor_tick().unwrap());
        std::thread::sleep(Duration::from_millis(100));

        let asked = Instant::now();
        assert_eq!(sup.restart_count(0), Some(1));
        assert!(sup.is_alive(0));
        assert!(asked.elapsed() < Duration::from_millis(250));
        assert_eq!(tick.join().unwrap(), 1);
    }

    #[test]
    fn test_tick_after_stop() {
        let mut sup = Supervisor::start(FakeSpawner(Flags::default(), Duration::ZERO), 1, "w").unwrap();
        sup.stop();
        sup.stop();
        assert!(matches!(sup.monitor_tick(), Err(SupervisorError::Stopped)));
    }
}
