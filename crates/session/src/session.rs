//! Session facade
//!
//! A [`Session`] ties one transport to its event loop and registries. It is
//! a cheap, cloneable handle; the underlying session closes when `close()`
//! is called or the last handle is dropped.

use crate::event_lock::EventLockGuard;
use crate::event_loop::EventLoop;
use crate::hotplug::{HotplugCallback, HotplugFilter, HotplugNotification, HotplugRegistry, RegistrationId};
use crate::poll::PollDescriptor;
use crate::registry::{SubmitError, TransferRegistry};
use crate::transfer::{DeviceToken, Transfer, TransferBuilder, TransferId};
use crate::transport::Transport;
use crate::worker::EventThread;
use async_channel::Receiver;
use common::{
    CallbackAction, ControlSetup, DeviceInfo, EndpointAddress, Error, HotplugEvent, HotplugEvents,
    Result, SessionConfig,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

pub(crate) struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    transfers: Arc<TransferRegistry>,
    hotplug: Arc<HotplugRegistry>,
    event_loop: EventLoop,
    state: AtomicU8,
}

/// Handle to a USB session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session on `transport` with default configuration
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let transfers = Arc::new(TransferRegistry::new(transport.clone()));
        let hotplug = Arc::new(HotplugRegistry::new(transport.clone()));
        let event_loop = EventLoop::new(transport.clone(), transfers.clone(), hotplug.clone());
        debug!("Opened USB session ({:?})", config);

        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                transfers,
                hotplug,
                event_loop,
                state: AtomicU8::new(OPEN),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // Transfer factories

    pub fn control_transfer(&self, device: DeviceToken, setup: ControlSetup) -> TransferBuilder {
        TransferBuilder::control(device, setup)
    }

    pub fn bulk_transfer(
        &self,
        device: DeviceToken,
        endpoint: impl Into<EndpointAddress>,
        length: usize,
    ) -> TransferBuilder {
        TransferBuilder::bulk(device, endpoint, length)
    }

    pub fn bulk_stream_transfer(
        &self,
        device: DeviceToken,
        endpoint: impl Into<EndpointAddress>,
        stream_id: u32,
        length: usize,
    ) -> TransferBuilder {
        TransferBuilder::bulk_stream(device, endpoint, stream_id, length)
    }

    pub fn interrupt_transfer(
        &self,
        device: DeviceToken,
        endpoint: impl Into<EndpointAddress>,
        length: usize,
    ) -> TransferBuilder {
        TransferBuilder::interrupt(device, endpoint, length)
    }

    pub fn iso_transfer(
        &self,
        device: DeviceToken,
        endpoint: impl Into<EndpointAddress>,
        packet_lengths: Vec<u32>,
    ) -> TransferBuilder {
        TransferBuilder::isochronous(device, endpoint, packet_lengths)
    }

    // Transfers

    /// Submit a transfer; its callback runs once on the event-handling thread
    pub fn submit(&self, transfer: Transfer) -> std::result::Result<TransferId, SubmitError> {
        if let Err(error) = self.ensure_open() {
            return Err(SubmitError { error, transfer });
        }
        self.inner.transfers.submit(transfer)
    }

    /// Submit and resolve with the finished transfer
    ///
    /// Someone must be handling events (see [`Session::spawn_event_thread`])
    /// for the future to resolve. The transfer's own callback is put back
    /// before it is returned, and is not invoked.
    pub async fn submit_async(&self, mut transfer: Transfer) -> Result<Transfer> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let original = transfer.replace_callback(None);
        let restore = original.clone();

        transfer.set_callback(move |mut finished: Transfer| {
            finished.replace_callback(restore.clone());
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(finished);
            }
        });

        if let Err(err) = self.submit(transfer) {
            let mut transfer = err.transfer;
            transfer.replace_callback(original);
            return Err(err.error);
        }

        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Request cancellation; the callback still runs once
    pub fn cancel(&self, id: TransferId) -> Result<()> {
        self.ensure_open()?;
        self.inner.transfers.cancel(id)
    }

    /// Number of submitted transfers not yet delivered
    pub fn pending_transfers(&self) -> usize {
        self.inner.transfers.len()
    }

    // Hot-plug

    pub fn hotplug(&self) -> HotplugBuilder<'_> {
        HotplugBuilder {
            session: self,
            filter: HotplugFilter::any(),
            events: HotplugEvents::all(),
            enumerate: false,
        }
    }

    pub fn deregister(&self, id: RegistrationId) -> Result<()> {
        self.ensure_open()?;
        self.inner.hotplug.deregister(id)
    }

    pub fn hotplug_registrations(&self) -> usize {
        self.inner.hotplug.len()
    }

    /// Devices currently attached
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.ensure_open()?;
        self.inner.transport.devices()
    }

    // Event handling

    /// Run one event pass, waiting for the event lock if necessary
    pub fn handle_events(&self, timeout: Option<Duration>) -> Result<usize> {
        self.ensure_open()?;
        self.inner.event_loop.handle_blocking(timeout)
    }

    /// Run one event pass unless another thread is handling events
    pub fn handle_events_if_unlocked(&self, timeout: Option<Duration>) -> Result<Option<usize>> {
        self.ensure_open()?;
        self.inner.event_loop.handle_if_unlocked(timeout)
    }

    /// Take the event lock to drive passes with [`Session::handle_events_locked`]
    pub fn lock_events(&self) -> Result<EventLockGuard<'_>> {
        self.ensure_open()?;
        self.inner.event_loop.lock().lock()
    }

    pub fn try_lock_events(&self) -> Option<EventLockGuard<'_>> {
        self.ensure_open().ok()?;
        self.inner.event_loop.lock().try_lock()
    }

    pub fn handle_events_locked(&self, guard: &EventLockGuard<'_>, timeout: Option<Duration>) -> Result<usize> {
        self.ensure_open()?;
        self.inner.event_loop.handle_locked(guard, timeout)
    }

    /// Handle events, or wait for whoever is, until `done` returns true
    pub fn handle_events_until<F>(&self, done: F, timeout: Option<Duration>) -> Result<usize>
    where
        F: FnMut() -> bool,
    {
        self.ensure_open()?;
        self.inner.event_loop.handle_until(done, timeout)
    }

    pub fn next_timeout(&self) -> Result<Option<Duration>> {
        self.ensure_open()?;
        self.inner.event_loop.next_timeout()
    }

    pub fn poll_descriptors(&self) -> Vec<PollDescriptor> {
        self.inner.event_loop.poll_descriptors()
    }

    /// Follow poll-set changes; notifiers run on the event-handling thread
    pub fn set_poll_notifiers<A, R>(&self, added: A, removed: R)
    where
        A: Fn(PollDescriptor) + Send + Sync + 'static,
        R: Fn(i32) + Send + Sync + 'static,
    {
        self.inner.event_loop.notifiers().set(added, removed);
    }

    pub fn clear_poll_notifiers(&self) {
        self.inner.event_loop.notifiers().clear();
    }

    /// Wake the thread currently blocked in the native wait
    pub fn interrupt_event_handler(&self) {
        self.inner.event_loop.interrupt();
    }

    /// Drive events on a dedicated thread
    pub fn spawn_event_thread(&self) -> Result<EventThread> {
        self.ensure_open()?;
        EventThread::spawn(self, self.inner.config.event_poll_interval())
    }

    // Lifecycle

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the session
    ///
    /// Outstanding transfers are cancelled and drained for up to the
    /// configured grace period; whatever is left is finished with
    /// `SessionClosed`. Hot-plug registrations are dropped. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != OPEN || self.event_loop.has_failed()
    }

    fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("Closing USB session");

        // Waits out submissions already inside the transport
        self.transfers.close();
        let cancelled = self.transfers.cancel_all();
        let registrations = self.hotplug.clear();
        debug!(
            "Cancelled {} transfers, dropped {} hotplug registrations",
            cancelled, registrations
        );

        let lock = self.event_loop.lock();
        let leftovers = match lock.current_holder() {
            // Closing from a callback: this thread is the handler and cannot wait on itself
            Some(guard) => self.transfers.force_close(&guard),
            None => {
                if !self.transfers.is_empty() {
                    let grace = self.config.close_grace();
                    let drained = self
                        .event_loop
                        .handle_until(|| self.transfers.is_empty(), Some(grace));
                    if let Err(e) = drained {
                        debug!("Drain on close stopped early: {}", e);
                    }
                }
                self.event_loop.interrupt();
                match lock.lock() {
                    Ok(guard) => self.transfers.force_close(&guard),
                    Err(e) => {
                        warn!("Could not take the event lock to finish close: {}", e);
                        0
                    }
                }
            }
        };
        if leftovers > 0 {
            warn!("{} transfers finished as SessionClosed", leftovers);
        }

        self.event_loop.close();
        self.transport.close();
        self.state.store(CLOSED, Ordering::Release);
        info!("USB session closed");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builder for hot-plug registrations
pub struct HotplugBuilder<'a> {
    session: &'a Session,
    filter: HotplugFilter,
    events: HotplugEvents,
    enumerate: bool,
}

impl HotplugBuilder<'_> {
    pub fn vendor_id(mut self, vendor_id: u16) -> Self {
        self.filter.vendor_id = Some(vendor_id);
        self
    }

    pub fn product_id(mut self, product_id: u16) -> Self {
        self.filter.product_id = Some(product_id);
        self
    }

    pub fn class(mut self, class: u8) -> Self {
        self.filter.class = Some(class);
        self
    }

    pub fn filter(mut self, filter: HotplugFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Events to subscribe to (default: arrival and removal)
    pub fn events(mut self, events: HotplugEvents) -> Self {
        self.events = events;
        self
    }

    /// Report already attached devices as arrivals before returning
    pub fn enumerate(mut self, enumerate: bool) -> Self {
        self.enumerate = enumerate;
        self
    }

    pub fn register<F>(self, callback: F) -> Result<RegistrationId>
    where
        F: FnMut(&DeviceInfo, HotplugEvent) -> CallbackAction + Send + 'static,
    {
        self.session.ensure_open()?;
        let callback: HotplugCallback = Box::new(callback);
        self.session
            .inner
            .hotplug
            .register(self.filter, self.events, self.enumerate, callback)
    }

    /// Receive notifications through a bounded channel of `capacity`
    pub fn channel(self, capacity: usize) -> Result<(RegistrationId, Receiver<HotplugNotification>)> {
        self.session.ensure_open()?;
        self.session
            .inner
            .hotplug
            .channel(self.filter, self.events, self.enumerate, capacity)
    }

    /// Like [`HotplugBuilder::channel`] with the configured capacity
    pub fn subscribe(self) -> Result<(RegistrationId, Receiver<HotplugNotification>)> {
        let capacity = self.session.inner.config.hotplug_channel_capacity;
        self.channel(capacity)
    }
}
