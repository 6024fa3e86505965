//! Event loop: one native wait, then dispatch
//!
//! A pass waits inside the transport for at most
//! `min(timeout, next transfer deadline)` and dispatches every returned
//! event in transport order. Only the [`EventLock`] holder runs passes.
//! Everything a callback may want to do from inside a pass (submit, cancel,
//! register, deregister) goes through the registries' own short-lived
//! mutexes and never through the event lock.

use crate::event_lock::{EventLock, EventLockGuard};
use crate::hotplug::HotplugRegistry;
use crate::poll::{PollDescriptor, PollNotifiers};
use crate::registry::TransferRegistry;
use crate::transport::{Event, Transport};
use common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

pub struct EventLoop {
    transport: Arc<dyn Transport>,
    lock: EventLock,
    transfers: Arc<TransferRegistry>,
    hotplug: Arc<HotplugRegistry>,
    notifiers: PollNotifiers,
    failed: AtomicBool,
}

impl EventLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        transfers: Arc<TransferRegistry>,
        hotplug: Arc<HotplugRegistry>,
    ) -> Self {
        Self {
            transport,
            lock: EventLock::new(),
            transfers,
            hotplug,
            notifiers: PollNotifiers::new(),
            failed: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> &EventLock {
        &self.lock
    }

    pub fn notifiers(&self) -> &PollNotifiers {
        &self.notifiers
    }

    /// Whether the transport reported an unrecoverable error
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Time until the earliest transfer deadline
    pub fn next_timeout(&self) -> Result<Option<Duration>> {
        self.check(self.transport.next_timeout())
    }

    pub fn poll_descriptors(&self) -> Vec<PollDescriptor> {
        self.transport.poll_descriptors()
    }

    /// Wake whichever thread is blocked in the native wait
    pub fn interrupt(&self) {
        self.transport.interrupt();
    }

    /// Run one pass, blocking until the event lock is available
    pub fn handle_blocking(&self, timeout: Option<Duration>) -> Result<usize> {
        let guard = self.lock.lock()?;
        self.handle_locked(&guard, timeout)
    }

    /// Run one pass if nobody else is handling events
    ///
    /// Returns `Ok(None)` without waiting when the lock is taken.
    pub fn handle_if_unlocked(&self, timeout: Option<Duration>) -> Result<Option<usize>> {
        match self.lock.try_lock() {
            Some(guard) => self.handle_locked(&guard, timeout).map(Some),
            None => {
                trace!("Event lock busy, skipping pass");
                Ok(None)
            }
        }
    }

    /// Run one pass as the current lock holder
    ///
    /// Returns the number of events dispatched. An interrupted wait is a
    /// pass with zero events.
    pub fn handle_locked(&self, guard: &EventLockGuard<'_>, timeout: Option<Duration>) -> Result<usize> {
        if self.has_failed() {
            return Err(Error::SessionClosed);
        }

        let wait = shorter(timeout, self.next_timeout()?);
        let events = match self.transport.wait(wait) {
            Ok(events) => events,
            Err(Error::Interrupted) => {
                debug!("Event wait interrupted");
                return Ok(0);
            }
            Err(e) => return Err(self.fail_if_fatal(e)),
        };

        let count = events.len();
        for event in events {
            self.dispatch(guard, event);
        }
        if count > 0 {
            trace!("Event pass dispatched {} events", count);
        }
        Ok(count)
    }

    /// Keep handling events (or waiting for whoever is) until `done` holds
    /// or `timeout` elapses
    ///
    /// Returns the number of events this thread dispatched itself.
    pub fn handle_until<F>(&self, mut done: F, timeout: Option<Duration>) -> Result<usize>
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut handled = 0;

        loop {
            if done() {
                return Ok(handled);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(handled);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if self.lock.is_closed() || self.has_failed() {
                return Err(Error::SessionClosed);
            }

            if let Some(guard) = self.lock.try_lock() {
                // The previous holder may have delivered it while we raced for the lock
                if done() {
                    return Ok(handled);
                }
                handled += self.handle_locked(&guard, remaining)?;
                continue;
            }

            let waiter = self.lock.register_waiter();
            if done() {
                return Ok(handled);
            }
            waiter.wait(remaining);
        }
    }

    fn dispatch(&self, guard: &EventLockGuard<'_>, event: Event) {
        match event {
            Event::TransferCompletion { id, record } => {
                self.transfers.complete(guard, id, record);
            }
            Event::HotplugNotification { device, event } => {
                self.hotplug.dispatch(guard, &device, event);
            }
            Event::PollSetChanged(change) => {
                trace!("Poll set changed: {:?}", change);
                self.notifiers.notify(change);
            }
        }
    }

    /// Close the event lock; future passes fail with `SessionClosed`
    pub fn close(&self) {
        self.lock.close();
    }

    fn check<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail_if_fatal(e))
    }

    fn fail_if_fatal(&self, err: Error) -> Error {
        if err.is_fatal() || err == Error::NoDevice {
            if !self.failed.swap(true, Ordering::AcqRel) {
                error!("Transport failed, session is no longer usable: {}", err);
            }
            return Error::SessionClosed;
        }
        err
    }
}

/// The shorter of two optional waits (`None` = unlimited)
fn shorter(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorter_wait() {
        let ms = Duration::from_millis;
        assert_eq!(shorter(None, None), None);
        assert_eq!(shorter(Some(ms(100)), None), Some(ms(100)));
        assert_eq!(shorter(None, Some(ms(5))), Some(ms(5)));
        assert_eq!(shorter(Some(ms(100)), Some(ms(5))), Some(ms(5)));
    }
}
