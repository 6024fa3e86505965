//! Hot-plug registrations and dispatch
//!
//! Each registration pairs a [`HotplugFilter`] and an event set with a
//! callback. Notifications from the transport are matched against every
//! active registration independently; a callback that panics or asks to be
//! deregistered never affects delivery to the others.

use crate::event_lock::EventLockGuard;
use crate::panic_message;
use crate::transport::Transport;
use async_channel::{Receiver, TrySendError};
use common::{CallbackAction, DeviceInfo, Error, HotplugEvent, HotplugEvents, Result};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace, warn};

/// Device match criteria; `None` fields match anything
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotplugFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub class: Option<u8>,
}

impl HotplugFilter {
    /// Match every device
    pub fn any() -> Self {
        Self::default()
    }

    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            ..Self::default()
        }
    }

    pub fn with_product(mut self, product_id: u16) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn with_class(mut self, class: u8) -> Self {
        self.class = Some(class);
        self
    }

    pub fn matches(&self, device: &DeviceInfo) -> bool {
        self.vendor_id.is_none_or(|v| v == device.vendor_id)
            && self.product_id.is_none_or(|p| p == device.product_id)
            && self.class.is_none_or(|c| c == device.class)
    }
}

/// Key of a hot-plug registration, usable only for deregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hotplug#{}", self.0)
    }
}

/// Notification forwarded through a hot-plug channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugNotification {
    pub device: DeviceInfo,
    pub event: HotplugEvent,
}

pub type HotplugCallback = Box<dyn FnMut(&DeviceInfo, HotplugEvent) -> CallbackAction + Send>;

struct Registration {
    id: RegistrationId,
    filter: HotplugFilter,
    events: HotplugEvents,
    callback: Mutex<HotplugCallback>,
    active: AtomicBool,
    /// Set while `register` walks the attached devices
    enumeration: Mutex<Option<Enumeration>>,
}

/// Events dispatched on the enumerating thread itself, replayed afterwards
struct Enumeration {
    thread: ThreadId,
    deferred: VecDeque<(DeviceInfo, HotplugEvent)>,
}

impl Registration {
    fn wants(&self, device: &DeviceInfo, event: HotplugEvent) -> bool {
        self.active.load(Ordering::Acquire)
            && self.events.contains_event(event)
            && self.filter.matches(device)
    }

    /// Queue the event if this thread is inside the registration's own
    /// enumeration, where the callback is already running
    fn defer(&self, device: &DeviceInfo, event: HotplugEvent) -> bool {
        let mut enumeration = self.enumeration.lock().unwrap();
        match enumeration.as_mut() {
            Some(e) if e.thread == thread::current().id() => {
                e.deferred.push_back((device.clone(), event));
                true
            }
            _ => false,
        }
    }

    /// Next deferred event, or `None` once enumeration is finished
    fn next_deferred(&self) -> Option<(DeviceInfo, HotplugEvent)> {
        let mut enumeration = self.enumeration.lock().unwrap();
        let next = enumeration.as_mut().and_then(|e| e.deferred.pop_front());
        if next.is_none() {
            *enumeration = None;
        }
        next
    }

    /// Run the callback; a panic counts as `Keep`
    fn invoke(&self, device: &DeviceInfo, event: HotplugEvent) -> CallbackAction {
        let mut callback = self.callback.lock().unwrap();
        // Deregistered while waiting for a concurrent invocation
        if !self.active.load(Ordering::Acquire) {
            return CallbackAction::Keep;
        }
        match catch_unwind(AssertUnwindSafe(|| (*callback)(device, event))) {
            Ok(action) => action,
            Err(panic) => {
                error!(
                    "Panic in hotplug callback {} for {} ({:?}): {}",
                    self.id,
                    device,
                    event,
                    panic_message(panic.as_ref())
                );
                CallbackAction::Keep
            }
        }
    }
}

/// Set of active hot-plug registrations
pub struct HotplugRegistry {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    entries: Mutex<Vec<Arc<Registration>>>,
}

impl HotplugRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Add a registration
    ///
    /// With `enumerate` and `ARRIVED` in `events`, the callback first sees an
    /// `Arrived` for every matching device already attached, on the calling
    /// thread. Returning `Deregister` there stops the walk and removes the
    /// registration; its id is still returned. Live events the callback
    /// dispatches on this thread during the walk are delivered after it.
    pub fn register(
        &self,
        filter: HotplugFilter,
        events: HotplugEvents,
        enumerate: bool,
        callback: HotplugCallback,
    ) -> Result<RegistrationId> {
        if events.is_empty() {
            return Err(Error::InvalidArgument(
                "hotplug registration needs at least one event".to_string(),
            ));
        }

        let walk = enumerate && events.contains(HotplugEvents::ARRIVED);
        let existing = if walk {
            self.transport.devices()?
        } else {
            Vec::new()
        };

        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Registration {
            id,
            filter,
            events,
            callback: Mutex::new(callback),
            active: AtomicBool::new(true),
            enumeration: Mutex::new(walk.then(|| Enumeration {
                thread: thread::current().id(),
                deferred: VecDeque::new(),
            })),
        });
        self.entries.lock().unwrap().push(entry.clone());
        debug!("Registered hotplug callback {} ({:?}, {:?})", id, filter, events);

        for device in existing.iter().filter(|d| filter.matches(d)) {
            if entry.invoke(device, HotplugEvent::Arrived) == CallbackAction::Deregister {
                debug!("Hotplug callback {} deregistered during enumeration", id);
                self.remove(id);
                break;
            }
        }
        if walk {
            // Live events the callback itself dispatched while enumerating
            while let Some((device, event)) = entry.next_deferred() {
                if entry.wants(&device, event)
                    && entry.invoke(&device, event) == CallbackAction::Deregister
                {
                    debug!("Hotplug callback {} asked to be deregistered", id);
                    self.remove(id);
                }
            }
        }

        Ok(id)
    }

    /// Forward matching notifications into a bounded channel
    ///
    /// The registration removes itself once the receiver is dropped. A full
    /// channel drops the notification.
    pub fn channel(
        &self,
        filter: HotplugFilter,
        events: HotplugEvents,
        enumerate: bool,
        capacity: usize,
    ) -> Result<(RegistrationId, Receiver<HotplugNotification>)> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "hotplug channel capacity must be greater than zero".to_string(),
            ));
        }

        let (tx, rx) = async_channel::bounded(capacity);
        let id = self.register(
            filter,
            events,
            enumerate,
            Box::new(move |device, event| {
                let notification = HotplugNotification {
                    device: device.clone(),
                    event,
                };
                match tx.try_send(notification) {
                    Ok(()) => CallbackAction::Keep,
                    Err(TrySendError::Full(n)) => {
                        warn!("Hotplug channel full, dropping {:?} for {}", n.event, n.device);
                        CallbackAction::Keep
                    }
                    Err(TrySendError::Closed(_)) => CallbackAction::Deregister,
                }
            }),
        )?;
        Ok((id, rx))
    }

    /// Remove a registration; safe from inside its own callback
    pub fn deregister(&self, id: RegistrationId) -> Result<()> {
        if self.remove(id) {
            debug!("Deregistered hotplug callback {}", id);
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    fn remove(&self, id: RegistrationId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().position(|e| e.id == id) {
            Some(index) => {
                let entry = entries.remove(index);
                entry.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Deliver one notification to every matching registration
    ///
    /// Callbacks run without the registry lock held, so they may register
    /// and deregister freely. Returns the number of callbacks invoked.
    pub fn dispatch(&self, _guard: &EventLockGuard<'_>, device: &DeviceInfo, event: HotplugEvent) -> usize {
        let snapshot: Vec<Arc<Registration>> = self.entries.lock().unwrap().clone();
        trace!(
            "Dispatching {:?} for {} to {} registrations",
            event,
            device,
            snapshot.len()
        );

        let mut delivered = 0;
        for entry in snapshot {
            if !entry.wants(device, event) {
                continue;
            }
            delivered += 1;
            if entry.defer(device, event) {
                trace!("Deferred {:?} for {} until enumeration ends", event, entry.id);
                continue;
            }
            if entry.invoke(device, event) == CallbackAction::Deregister {
                debug!("Hotplug callback {} asked to be deregistered", entry.id);
                self.remove(entry.id);
            }
        }
        delivered
    }

    /// Drop every registration
    pub fn clear(&self) -> usize {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        for entry in &entries {
            entry.active.store(false, Ordering::Release);
        }
        entries.len()
    }

    pub fn contains(&self, id: RegistrationId) -> bool {
        self.entries.lock().unwrap().iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_lock::EventLock;
    use crate::test_utils::{MockTransport, mock_device, mock_hid_device};
    use std::sync::atomic::AtomicUsize;

    fn registry() -> (Arc<MockTransport>, HotplugRegistry) {
        let mock = Arc::new(MockTransport::new());
        (mock.clone(), HotplugRegistry::new(mock))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> HotplugCallback {
        let counter = counter.clone();
        Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            CallbackAction::Keep
        })
    }

    #[test]
    fn test_filter_matching() {
        let apple = mock_device(1, 2, 0x05ac, 0x12a8);
        let hid = mock_hid_device(1, 3, 0x046d, 0xc52b);

        assert!(HotplugFilter::any().matches(&apple));
        assert!(HotplugFilter::vendor(0x05ac).matches(&apple));
        assert!(!HotplugFilter::vendor(0x05ac).matches(&hid));
        assert!(!HotplugFilter::vendor(0x05ac).with_product(0x0001).matches(&apple));
        assert!(HotplugFilter::any().with_class(0x03).matches(&hid));
        assert!(!HotplugFilter::any().with_class(0x03).matches(&apple));
    }

    #[test]
    fn test_empty_event_set_rejected() {
        let (_mock, registry) = registry();
        let calls = Arc::new(AtomicUsize::new(0));
        let err = registry
            .register(HotplugFilter::any(), HotplugEvents::empty(), false, counting(&calls))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_respects_event_set() {
        let (_mock, registry) = registry();
        let lock = EventLock::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(HotplugFilter::any(), HotplugEvents::LEFT, false, counting(&calls))
            .unwrap();

        let device = mock_device(1, 2, 0x1234, 0x5678);
        let guard = lock.lock().unwrap();
        assert_eq!(registry.dispatch(&guard, &device, HotplugEvent::Arrived), 0);
        assert_eq!(registry.dispatch(&guard, &device, HotplugEvent::Left), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deregister_unknown_is_not_found() {
        let (_mock, registry) = registry();
        assert_eq!(registry.deregister(RegistrationId(42)), Err(Error::NotFound));
    }

    #[test]
    fn test_enumeration_skipped_without_arrived() {
        let (mock, registry) = registry();
        mock.add_device(mock_device(1, 2, 0x1234, 0x5678));
        let calls = Arc::new(AtomicUsize::new(0));

        registry
            .register(HotplugFilter::any(), HotplugEvents::LEFT, true, counting(&calls))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_channel_deregisters_when_receiver_dropped() {
        let (_mock, registry) = registry();
        let lock = EventLock::new();
        let (id, rx) = registry
            .channel(HotplugFilter::any(), HotplugEvents::all(), false, 4)
            .unwrap();

        let device = mock_device(1, 2, 0x1234, 0x5678);
        let guard = lock.lock().unwrap();
        registry.dispatch(&guard, &device, HotplugEvent::Arrived);
        assert_eq!(
            rx.try_recv().unwrap(),
            HotplugNotification {
                device: device.clone(),
                event: HotplugEvent::Arrived
            }
        );

        drop(rx);
        registry.dispatch(&guard, &device, HotplugEvent::Left);
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_zero_capacity_channel_rejected() {
        let (_mock, registry) = registry();
        let err = registry
            .channel(HotplugFilter::any(), HotplugEvents::all(), false, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
