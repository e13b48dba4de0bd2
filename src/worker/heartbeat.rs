//! Worker heartbeats
//!
//! A heartbeat store is an array of timestamps indexed by worker slot. Each
//! slot is written by its current worker and read by the supervisor, so
//! plain atomics are enough. Timestamps are `CLOCK_MONOTONIC` milliseconds,
//! which every process on the host reads the same way; zero means the worker
//! never reported.
//!
//! Every slot also carries a generation. The supervisor bumps it when it
//! hands the slot to a replacement, and writers bound to an older generation
//! are ignored. A thread worker that was detached instead of joined can
//! therefore never refresh its successor's slot.
//!
//! [`HeartbeatTable`] lives on the heap and serves thread workers.
//! [`SharedHeartbeats`] lives in an anonymous shared mapping created before
//! forking, so process workers write into memory the supervisor can read.

use super::supervisor::{HealthCheck, WorkerStatus};
use super::SupervisorError;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Milliseconds on the monotonic clock
pub fn monotonic_millis() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid timespec; CLOCK_MONOTONIC is always available on Linux
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

// Slot layout: generation in the top 16 bits, a serving flag, then the stamp
const GENERATION_SHIFT: u32 = 48;
const SERVING: u64 = 1 << 47;
const STAMP_MASK: u64 = SERVING - 1;
const LOW_MASK: u64 = SERVING | STAMP_MASK;
const GENERATIONS: u64 = 1 << (64 - GENERATION_SHIFT);

fn generation_of(word: u64) -> u64 {
    word >> GENERATION_SHIFT
}

pub trait HeartbeatStore: Send + Sync {
    fn len(&self) -> usize;

    fn slot(&self, index: usize) -> Option<&AtomicU64>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generation of the worker currently owning the slot
    fn generation(&self, index: usize) -> u64 {
        self.slot(index)
            .map_or(0, |slot| generation_of(slot.load(Ordering::Acquire)))
    }

    /// Rewrite the low bits of a slot if `generation` still owns it
    ///
    /// Returns false when the slot was handed to a newer worker.
    fn update(&self, index: usize, generation: u64, f: &dyn Fn(u64) -> u64) -> bool {
        let Some(slot) = self.slot(index) else {
            return false;
        };
        slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            (generation_of(word) == generation)
                .then(|| (generation << GENERATION_SHIFT) | (f(word & LOW_MASK) & LOW_MASK))
        })
        .is_ok()
    }

    fn beat(&self, index: usize, generation: u64) -> bool {
        let now = (monotonic_millis() + 1) & STAMP_MASK;
        self.update(index, generation, &|low: u64| (low & SERVING) | now)
    }

    /// Mark the worker as parked on a connection, or back from one
    fn set_serving(&self, index: usize, generation: u64, serving: bool) -> bool {
        let now = (monotonic_millis() + 1) & STAMP_MASK;
        self.update(index, generation, &|_: u64| if serving { SERVING | now } else { now })
    }

    /// Hand the slot to a new worker
    ///
    /// Bumps the generation and clears the history, so writes from the
    /// previous worker are ignored from here on.
    fn reset(&self, index: usize) {
        if let Some(slot) = self.slot(index) {
            let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let next = (generation_of(word) + 1) % GENERATIONS;
                Some(next << GENERATION_SHIFT)
            });
        }
    }

    fn is_serving(&self, index: usize) -> bool {
        self.slot(index)
            .is_some_and(|slot| slot.load(Ordering::Acquire) & SERVING != 0)
    }

    /// Time since the last heartbeat, `None` if there never was one
    fn age(&self, index: usize) -> Option<Duration> {
        let stamp = self.slot(index)?.load(Ordering::Acquire) & STAMP_MASK;
        if stamp == 0 {
            return None;
        }
        Some(Duration::from_millis((monotonic_millis() + 1).saturating_sub(stamp)))
    }
}

/// Heartbeats shared between threads
#[derive(Debug)]
pub struct HeartbeatTable {
    slots: Box<[AtomicU64]>,
}

impl HeartbeatTable {
    pub fn new(len: usize) -> Self {
        HeartbeatTable {
            slots: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl HeartbeatStore for HeartbeatTable {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Option<&AtomicU64> {
        self.slots.get(index)
    }
}

/// Heartbeats in a `MAP_SHARED` anonymous mapping, inherited across fork
pub struct SharedHeartbeats {
    ptr: NonNull<AtomicU64>,
    len: usize,
}

// SAFETY: the mapping is only accessed through atomics
unsafe impl Send for SharedHeartbeats {}
unsafe impl Sync for SharedHeartbeats {}

impl SharedHeartbeats {
    pub fn new(len: usize) -> io::Result<Self> {
        let bytes = len.max(1) * std::mem::size_of::<AtomicU64>();
        // SAFETY: anonymous mapping, no file descriptor involved
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut AtomicU64)
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        // Anonymous mappings are zero-filled, which reads as "never reported"
        Ok(SharedHeartbeats { ptr, len })
    }
}

impl HeartbeatStore for SharedHeartbeats {
    fn len(&self) -> usize {
        self.len
    }

    fn slot(&self, index: usize) -> Option<&AtomicU64> {
        if index >= self.len {
            return None;
        }
        // SAFETY: index is in bounds and the mapping lives as long as self
        Some(unsafe { &*self.ptr.as_ptr().add(index) })
    }
}

impl Drop for SharedHeartbeats {
    fn drop(&mut self) {
        let bytes = self.len.max(1) * std::mem::size_of::<AtomicU64>();
        // SAFETY: unmaps exactly what new() mapped
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, bytes);
        }
    }
}

impl std::fmt::Debug for SharedHeartbeats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHeartbeats").field("len", &self.len).finish()
    }
}

/// A worker's writer for its own slot
///
/// The writer is bound to the slot generation current at creation. Once the
/// supervisor hands the slot to a replacement, every write is dropped.
#[derive(Clone)]
pub struct Heartbeat {
    store: Arc<dyn HeartbeatStore>,
    index: usize,
    generation: u64,
}

impl Heartbeat {
    pub fn new(store: Arc<dyn HeartbeatStore>, index: usize) -> Self {
        let generation = store.generation(index);
        Heartbeat {
            store,
            index,
            generation,
        }
    }

    pub fn beat(&self) {
        if !self.store.beat(self.index, self.generation) {
            tracing::trace!(slot = self.index, "heartbeat from a replaced worker ignored");
        }
    }

    /// Mark the worker as serving a connection until the guard drops
    pub fn serving(&self) -> Serving<'_> {
        self.store.set_serving(self.index, self.generation, true);
        Serving { heartbeat: self }
    }
}

/// See [`Heartbeat::serving`]
pub struct Serving<'a> {
    heartbeat: &'a Heartbeat,
}

impl Drop for Serving<'_> {
    fn drop(&mut self) {
        let hb = self.heartbeat;
        hb.store.set_serving(hb.index, hb.generation, false);
    }
}

/// Health check that fails workers with a stale heartbeat
///
/// A worker that has been up longer than `grace` without a single heartbeat
/// is reported as an error rather than as healthy; its entry function most
/// likely never calls [`WorkerContext::beat`](super::WorkerContext::beat).
///
/// A worker parked on a connection waits for its peer, not for itself, so it
/// counts as healthy until the connection ends. Thread death is still caught
/// by the liveness check.
pub fn heartbeat_predicate(
    store: Arc<dyn HeartbeatStore>,
    max_age: Duration,
    grace: Duration,
) -> HealthCheck {
    Box::new(move |status: &WorkerStatus<'_>| match store.age(status.index) {
        _ if store.is_serving(status.index) => Ok(true),
        Some(age) => Ok(age <= max_age),
        None if status.uptime < grace => Ok(true),
        None => Err(SupervisorError::NoHeartbeat {
            name: status.name.to_string(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(index: usize, uptime: Duration) -> WorkerStatus<'static> {
        WorkerStatus {
            index,
            name: "w",
            uptime,
        }
    }

    #[test]
    fn test_table_beat_and_reset() {
        let table = HeartbeatTable::new(2);
        assert!(table.age(0).is_none());
        assert!(table.beat(0, 0));
        assert!(table.age(0).unwrap() < Duration::from_secs(1));
        assert!(table.age(1).is_none());
        table.reset(0);
        assert!(table.age(0).is_none());
        assert_eq!(table.generation(0), 1);
        // Out of range is ignored
        assert!(!table.beat(9, 0));
        assert!(table.age(9).is_none());
    }

    #[test]
    fn test_replaced_writer_is_ignored() {
        let store: Arc<dyn HeartbeatStore> = Arc::new(HeartbeatTable::new(1));
        let old = Heartbeat::new(store.clone(), 0);
        store.reset(0);
        let new = Heartbeat::new(store.clone(), 0);

        old.beat();
        assert!(store.age(0).is_none());
        {
            let _serving = old.serving();
            assert!(!store.is_serving(0));
        }

        new.beat();
        assert!(store.age(0).is_some());
        assert_eq!(store.generation(0), 1);
    }

    #[test]
    fn test_serving_worker_stays_healthy() {
        let store: Arc<dyn HeartbeatStore> = Arc::new(HeartbeatTable::new(1));
        let check = heartbeat_predicate(store.clone(), Duration::ZERO, Duration::ZERO);
        let heartbeat = Heartbeat::new(store.clone(), 0);

        let serving = heartbeat.serving();
        std::thread::sleep(Duration::from_millis(5));
        assert!(check(&status(0, Duration::from_secs(1))).unwrap());

        drop(serving);
        assert!(!store.is_serving(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!check(&status(0, Duration::from_secs(1))).unwrap());
    }

    #[test]
    fn test_generation_wraps() {
        let table = HeartbeatTable::new(1);
        for _ in 0..GENERATIONS {
            table.reset(0);
        }
        assert_eq!(table.generation(0), 0);
        assert!(table.beat(0, 0));
    }

    #[test]
    fn test_predicate_fails_loudly_without_heartbeat() {
        let table: Arc<dyn HeartbeatStore> = Arc::new(HeartbeatTable::new(1));
        let check = heartbeat_predicate(table.clone(), Duration::from_secs(5), Duration::from_millis(100));

        assert!(check(&status(0, Duration::from_millis(10))).unwrap());
        assert!(matches!(
            check(&status(0, Duration::from_secs(1))),
            Err(SupervisorError::NoHeartbeat { .. })
        ));

        table.beat(0, 0);
        assert!(check(&status(0, Duration::from_secs(1))).unwrap());
    }

    #[test]
    fn test_predicate_stale_heartbeat() {
        let table: Arc<dyn HeartbeatStore> = Arc::new(HeartbeatTable::new(1));
        let check = heartbeat_predicate(table.clone(), Duration::ZERO, Duration::ZERO);
        table.beat(0, 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!check(&status(0, Duration::from_secs(1))).unwrap());
    }

    #[test]
    fn test_shared_heartbeats_visible_after_fork() {
        let shared = SharedHeartbeats::new(4).unwrap();
        assert!(shared.age(3).is_none());

        // SAFETY: the child only touches the mapping and exits
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            shared.beat(3, 0);
            unsafe { libc::_exit(0) };
        }
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert!(shared.age(3).is_some());
        assert!(shared.age(2).is_none());
    }
}
