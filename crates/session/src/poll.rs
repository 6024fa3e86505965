//! Poll descriptors for embedding the session in an external reactor
//!
//! A session can drive its own waits (`handle_events`) or hand its wait-able
//! descriptors to an epoll/kqueue loop owned by the application. In the
//! latter case the application watches the descriptors from
//! [`Session::poll_descriptors`](crate::Session::poll_descriptors) and the
//! notifier callbacks keep its interest set current.

use bitflags::bitflags;
use std::sync::{Arc, Mutex};
use tracing::trace;

bitflags! {
    /// Readiness a descriptor should be watched for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READABLE = 0x01;
        const WRITABLE = 0x02;
    }
}

/// A descriptor the embedding reactor should monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollDescriptor {
    /// Raw OS descriptor
    pub fd: i32,
    pub interest: Interest,
}

impl PollDescriptor {
    pub fn new(fd: i32, interest: Interest) -> Self {
        Self { fd, interest }
    }

    pub fn readable(fd: i32) -> Self {
        Self::new(fd, Interest::READABLE)
    }
}

/// A change to the poll set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollChange {
    Added(PollDescriptor),
    Removed(i32),
}

/// Compute the changes that turn `old` into `new`
///
/// Removals come first so a reused fd number is reported as removed and
/// then added again.
pub fn diff(old: &[PollDescriptor], new: &[PollDescriptor]) -> Vec<PollChange> {
    let mut changes: Vec<PollChange> = old
        .iter()
        .filter(|pd| !new.contains(pd))
        .map(|pd| PollChange::Removed(pd.fd))
        .collect();
    changes.extend(
        new.iter()
            .filter(|pd| !old.contains(pd))
            .map(|pd| PollChange::Added(*pd)),
    );
    changes
}

type AddedFn = dyn Fn(PollDescriptor) + Send + Sync;
type RemovedFn = dyn Fn(i32) + Send + Sync;

#[derive(Clone)]
struct Notifiers {
    added: Arc<AddedFn>,
    removed: Arc<RemovedFn>,
}

/// Registered poll-set notifier callbacks
#[derive(Default)]
pub struct PollNotifiers {
    inner: Mutex<Option<Notifiers>>,
}

impl PollNotifiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install notifiers, replacing any previous pair
    pub fn set<A, R>(&self, added: A, removed: R)
    where
        A: Fn(PollDescriptor) + Send + Sync + 'static,
        R: Fn(i32) + Send + Sync + 'static,
    {
        *self.inner.lock().unwrap() = Some(Notifiers {
            added: Arc::new(added),
            removed: Arc::new(removed),
        });
    }

    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Forward one change; the notifier runs without the internal lock held
    pub fn notify(&self, change: PollChange) {
        let notifiers = self.inner.lock().unwrap().clone();
        let Some(notifiers) = notifiers else {
            trace!("Poll set changed with no notifier installed: {:?}", change);
            return;
        };
        match change {
            PollChange::Added(pd) => (notifiers.added)(pd),
            PollChange::Removed(fd) => (notifiers.removed)(fd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_diff_reports_removals_then_additions() {
        let old = vec![PollDescriptor::readable(3), PollDescriptor::readable(4)];
        let new = vec![
            PollDescriptor::readable(4),
            PollDescriptor::new(7, Interest::READABLE | Interest::WRITABLE),
        ];

        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![
                PollChange::Removed(3),
                PollChange::Added(PollDescriptor::new(
                    7,
                    Interest::READABLE | Interest::WRITABLE
                )),
            ]
        );
        assert!(diff(&new, &new).is_empty());
    }

    #[test]
    fn test_interest_change_is_remove_and_add() {
        let old = vec![PollDescriptor::readable(5)];
        let new = vec![PollDescriptor::new(5, Interest::WRITABLE)];
        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0], PollChange::Removed(5));
    }

    #[test]
    fn test_notifiers_forward_changes() {
        let added = Arc::new(AtomicI32::new(-1));
        let removed = Arc::new(AtomicI32::new(-1));
        let notifiers = PollNotifiers::new();

        // No notifier installed: dropped silently
        notifiers.notify(PollChange::Removed(1));

        let a = added.clone();
        let r = removed.clone();
        notifiers.set(
            move |pd| a.store(pd.fd, Ordering::SeqCst),
            move |fd| r.store(fd, Ordering::SeqCst),
        );
        assert!(notifiers.is_set());

        notifiers.notify(PollChange::Added(PollDescriptor::readable(9)));
        notifiers.notify(PollChange::Removed(6));
        assert_eq!(added.load(Ordering::SeqCst), 9);
        assert_eq!(removed.load(Ordering::SeqCst), 6);

        notifiers.clear();
        assert!(!notifiers.is_set());
    }
}
