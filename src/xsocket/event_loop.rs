//! Event loop thread marking
//!
//! A thread that drives the cooperative event loop holds an [`EventLoopGuard`]
//! for as long as it runs the loop. Blocking socket calls made while the mark
//! is set fail immediately.

use super::{Error, Result};
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static ON_EVENT_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as an event loop thread until dropped
#[must_use = "the thread is only marked while the guard is alive"]
pub struct EventLoopGuard {
    previous: bool,
    // Tied to the thread that created it
    _not_send: PhantomData<*const ()>,
}

/// Mark the current thread as an event loop thread
pub fn enter() -> EventLoopGuard {
    let previous = ON_EVENT_LOOP.with(|flag| flag.replace(true));
    EventLoopGuard {
        previous,
        _not_send: PhantomData,
    }
}

impl Drop for EventLoopGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        ON_EVENT_LOOP.with(|flag| flag.set(previous));
    }
}

/// Whether the current thread drives an event loop
pub fn is_event_loop_thread() -> bool {
    ON_EVENT_LOOP.with(|flag| flag.get())
}

/// Fail if a blocking socket call would stall the event loop
pub fn ensure_blocking_allowed() -> Result<()> {
    if is_event_loop_thread() {
        return Err(Error::BlockingOnEventLoop);
    }
    Ok(())
}
