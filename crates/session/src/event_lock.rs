//! Event-handler election
//!
//! Exactly one thread at a time may sit in the transport's native wait and
//! dispatch what it returns. [`EventLock`] elects that thread. It is not
//! re-entrant: a second `lock()` from the holder is reported as an error
//! instead of deadlocking.
//!
//! Threads that only need "the current pass to finish" (for example to
//! observe a completion someone else's pass delivers) register an
//! [`EventWaiter`] first and then block on it, so a pass that ends between a
//! failed `try_lock` and the wait is never missed.

use common::{Error, Result};
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    closed: bool,
    waiters: usize,
    /// Number of passes finished so far
    generation: u64,
}

/// Single-owner lock guarding the native event wait
#[derive(Debug, Default)]
pub struct EventLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl EventLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire without blocking
    ///
    /// Returns `None` while another owner holds the lock or after `close()`.
    pub fn try_lock(&self) -> Option<EventLockGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.owner.is_some() {
            return None;
        }
        state.owner = Some(thread::current().id());
        Some(EventLockGuard::new(self, true))
    }

    /// Acquire, blocking until the current owner releases
    pub fn lock(&self) -> Result<EventLockGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(Error::SessionClosed);
            }
            match state.owner {
                None => {
                    state.owner = Some(me);
                    return Ok(EventLockGuard::new(self, true));
                }
                Some(owner) if owner == me => {
                    return Err(Error::InvalidState(
                        "event lock is already held by this thread".to_string(),
                    ));
                }
                Some(_) => state = self.released.wait(state).unwrap(),
            }
        }
    }

    /// Borrow the ownership the current thread already has
    ///
    /// Used when work that needs the lock runs inside a callback of the
    /// holder's own pass. Dropping the returned guard does not release.
    pub(crate) fn current_holder(&self) -> Option<EventLockGuard<'_>> {
        let state = self.state.lock().unwrap();
        (state.owner == Some(thread::current().id())).then(|| EventLockGuard::new(self, false))
    }

    /// Register intent to wait for the current pass to finish
    pub fn register_waiter(&self) -> EventWaiter<'_> {
        let mut state = self.state.lock().unwrap();
        state.waiters += 1;
        EventWaiter {
            lock: self,
            generation: state.generation,
        }
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap().owner.is_some()
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.state.lock().unwrap().owner == Some(thread::current().id())
    }

    /// Threads currently registered as waiters
    pub fn waiters(&self) -> usize {
        self.state.lock().unwrap().waiters
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Refuse all future acquisitions and wake every waiter
    ///
    /// A guard held at the time stays valid until dropped.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.released.notify_all();
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.owner = None;
        state.generation = state.generation.wrapping_add(1);
        trace!(
            "Event lock released (pass {}, {} waiters)",
            state.generation,
            state.waiters
        );
        self.released.notify_all();
    }
}

/// Proof of holding the [`EventLock`]; releases on drop
///
/// Operations that may only run on the event-handling thread take a
/// reference to a guard.
#[derive(Debug)]
pub struct EventLockGuard<'a> {
    lock: &'a EventLock,
    releases: bool,
    // Ownership is tied to the acquiring thread
    _not_send: PhantomData<*const ()>,
}

impl<'a> EventLockGuard<'a> {
    fn new(lock: &'a EventLock, releases: bool) -> Self {
        Self {
            lock,
            releases,
            _not_send: PhantomData,
        }
    }

    /// Release explicitly
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for EventLockGuard<'_> {
    fn drop(&mut self) {
        if self.releases {
            self.lock.release();
        }
    }
}

/// A registered waiter; unregisters on drop
#[derive(Debug)]
pub struct EventWaiter<'a> {
    lock: &'a EventLock,
    generation: u64,
}

impl EventWaiter<'_> {
    /// Block until a pass finishes after registration, the lock is free or
    /// closed, or `timeout` elapses
    ///
    /// Returns `false` only on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock.state.lock().unwrap();
        loop {
            if state.closed || state.generation != self.generation || state.owner.is_none() {
                return true;
            }
            match deadline {
                None => state = self.lock.released.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self.lock.released.wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
    }
}

impl Drop for EventWaiter<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.waiters = state.waiters.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_try_lock_is_exclusive() {
        let lock = EventLock::new();
        let guard = lock.try_lock().unwrap();
        assert!(lock.is_held());
        assert!(lock.held_by_current_thread());
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_at_most_one_concurrent_winner() {
        const THREADS: usize = 8;
        let lock = Arc::new(EventLock::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = lock.clone();
                let barrier = barrier.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let guard = lock.try_lock();
                    if guard.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    // Keep holding until every thread has tried
                    barrier.wait();
                    drop(guard);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_is_not_reentrant() {
        let lock = EventLock::new();
        let _guard = lock.lock().unwrap();
        assert!(matches!(lock.lock(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_lock_blocks_until_release() {
        let lock = Arc::new(EventLock::new());
        let guard = lock.try_lock().unwrap();

        let other = lock.clone();
        let handle = thread::spawn(move || {
            let guard = other.lock().unwrap();
            assert!(other.held_by_current_thread());
            drop(guard);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn test_waiter_wakes_when_pass_finishes() {
        let lock = Arc::new(EventLock::new());
        let guard = lock.try_lock().unwrap();

        let other = lock.clone();
        let handle = thread::spawn(move || {
            let waiter = other.register_waiter();
            waiter.wait(Some(Duration::from_secs(5)))
        });

        while lock.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(guard);
        assert!(handle.join().unwrap());
        assert_eq!(lock.waiters(), 0);
    }

    #[test]
    fn test_waiter_times_out_while_held() {
        let lock = Arc::new(EventLock::new());
        let other = lock.clone();
        let handle = thread::spawn(move || {
            let _guard = other.try_lock().unwrap();
            thread::sleep(Duration::from_millis(200));
        });
        while !lock.is_held() {
            thread::sleep(Duration::from_millis(1));
        }

        let waiter = lock.register_waiter();
        assert!(!waiter.wait(Some(Duration::from_millis(10))));
        drop(waiter);
        handle.join().unwrap();
    }

    #[test]
    fn test_waiter_on_free_lock_returns_immediately() {
        let lock = EventLock::new();
        let waiter = lock.register_waiter();
        assert!(waiter.wait(None));
    }

    #[test]
    fn test_close_refuses_and_wakes() {
        let lock = Arc::new(EventLock::new());
        let guard = lock.try_lock().unwrap();

        let other = lock.clone();
        let handle = thread::spawn(move || other.lock().map(|_| ()));
        thread::sleep(Duration::from_millis(10));
        lock.close();

        assert_eq!(handle.join().unwrap(), Err(Error::SessionClosed));
        drop(guard);
        assert!(lock.is_closed());
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn test_current_holder_does_not_release() {
        let lock = EventLock::new();
        assert!(lock.current_holder().is_none());

        let guard = lock.lock().unwrap();
        let borrowed = lock.current_holder().unwrap();
        drop(borrowed);
        assert!(lock.held_by_current_thread());
        drop(guard);
        assert!(!lock.is_held());
    }
}
