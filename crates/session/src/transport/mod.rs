//! Native transport boundary
//!
//! The session never talks to a host controller directly. Everything native
//! (submitting, cancelling, waiting, hot-plug sources, poll descriptors) goes
//! through a [`Transport`]. Completions and hot-plug notifications come back
//! out of [`Transport::wait`] as [`Event`]s, keyed by [`TransferId`] so no
//! pointer to session state ever crosses the boundary.

#[cfg(feature = "libusb")]
pub mod libusb;

use crate::poll::{PollChange, PollDescriptor};
use crate::transfer::{CompletionRecord, TransferId};
use common::{DeviceInfo, HotplugEvent, Result};
use std::time::Duration;

pub use crate::transfer::TransferDescriptor;

/// One occurrence reported by a native wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A submitted transfer reached a terminal status
    TransferCompletion {
        id: TransferId,
        record: CompletionRecord,
    },
    /// A device arrived or left
    HotplugNotification {
        device: DeviceInfo,
        event: HotplugEvent,
    },
    /// A descriptor joined or left the poll set
    PollSetChanged(PollChange),
}

/// Native host-controller session
///
/// Implementations must be callable from any thread. `wait` is only ever
/// entered by the current event-lock holder, so a transport may assume it
/// never runs concurrently with itself; every other method may run
/// concurrently with `wait`.
pub trait Transport: Send + Sync {
    /// Submit one transfer without blocking
    ///
    /// The buffer behind `descriptor.buffer` stays valid until a completion
    /// for `descriptor.id` has been returned from `wait` or `abandon` has
    /// reported it unreferenced.
    fn submit(&self, descriptor: &TransferDescriptor) -> Result<()>;

    /// Request cancellation; the outcome arrives later as a completion
    fn cancel(&self, id: TransferId) -> Result<()>;

    /// Forget a pending transfer at shutdown
    ///
    /// Returns `true` iff the native side no longer references its buffer.
    fn abandon(&self, id: TransferId) -> bool;

    /// Wait up to `timeout` (`None` = until something happens) and drain
    /// every event that became ready
    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Event>>;

    /// Time until the earliest transfer deadline, if any
    fn next_timeout(&self) -> Result<Option<Duration>>;

    /// Descriptors an external reactor should watch
    fn poll_descriptors(&self) -> Vec<PollDescriptor>;

    /// Devices currently attached, for hot-plug enumeration
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Wake a thread blocked in `wait`
    fn interrupt(&self);

    /// Release the native session
    fn close(&self);
}
