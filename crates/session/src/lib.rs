//! Asynchronous USB transfer and event-dispatch core
//!
//! A [`Session`] submits transfers to a native [`Transport`], elects one
//! thread at a time to wait for native events ([`EventLock`]), and
//! dispatches what that wait returns: transfer completions to their
//! callbacks, hot-plug notifications to matching registrations and
//! poll-set changes to an embedding reactor.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usb_session::test_utils::MockTransport;
//! use usb_session::{DeviceToken, Session, TransferState};
//!
//! let mock = Arc::new(MockTransport::new());
//! let session = Session::new(mock.clone());
//!
//! let transfer = session
//!     .bulk_transfer(DeviceToken(1), 0x81, 4)
//!     .timeout(Duration::from_millis(100))
//!     .callback(|t| assert_eq!(t.state(), TransferState::Completed))
//!     .build()
//!     .unwrap();
//! let id = session.submit(transfer).unwrap();
//!
//! mock.complete(id, 4);
//! session.handle_events(Some(Duration::from_millis(100))).unwrap();
//! ```

pub mod event_lock;
pub mod event_loop;
pub mod hotplug;
pub mod poll;
pub mod registry;
pub mod session;
pub mod test_utils;
pub mod transfer;
pub mod transport;
pub mod worker;

pub use event_lock::{EventLock, EventLockGuard, EventWaiter};
pub use event_loop::EventLoop;
pub use hotplug::{HotplugFilter, HotplugNotification, HotplugRegistry, RegistrationId};
pub use poll::{Interest, PollChange, PollDescriptor};
pub use registry::{SubmitError, TransferRegistry};
pub use session::{HotplugBuilder, Session};
pub use transfer::{
    CompletionRecord, DeviceToken, Transfer, TransferBuilder, TransferCallback, TransferDescriptor,
    TransferId, TransferState,
};
pub use transport::{Event, Transport};
pub use worker::EventThread;

#[cfg(feature = "libusb")]
pub use transport::libusb::LibusbTransport;

// Re-export the shared data model
pub use common::{
    CallbackAction, ControlSetup, DeviceInfo, DeviceSpeed, EndpointAddress, Error, HotplugEvent,
    HotplugEvents, IsoPacket, Result, SessionConfig, TransferFlags, TransferKind, TransferStatus,
};

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
