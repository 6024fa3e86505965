//! Test utilities for usb-session
//!
//! [`MockTransport`] is a scriptable in-memory transport: tests submit
//! through a real [`Session`](crate::Session) and then decide, from the
//! outside, when and how each transfer completes, which devices come and
//! go, and how the poll set changes.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usb_session::test_utils::MockTransport;
//! use usb_session::{DeviceToken, Session};
//!
//! let mock = Arc::new(MockTransport::new());
//! let session = Session::new(mock.clone());
//!
//! let transfer = session.bulk_transfer(DeviceToken(1), 0x81, 4).build().unwrap();
//! let id = session.submit(transfer).unwrap();
//! mock.complete_with_data(id, &[1, 2, 3, 4]);
//! assert_eq!(session.handle_events(Some(Duration::from_millis(100))).unwrap(), 1);
//! ```

use crate::poll::{PollChange, PollDescriptor};
use crate::transfer::{CompletionRecord, DeviceToken, TransferDescriptor, TransferId};
use crate::transport::{Event, Transport};
use common::{
    ControlSetup, DeviceInfo, DeviceSpeed, EndpointAddress, Error, HotplugEvent, IsoPacket, Result,
    TransferKind, TransferStatus,
};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What the mock saw for one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransfer {
    pub id: TransferId,
    pub device: DeviceToken,
    pub endpoint: EndpointAddress,
    pub kind: TransferKind,
    pub length: usize,
    pub timeout: Option<Duration>,
    pub stream_id: Option<u32>,
    /// Buffer contents at submission time
    pub data: Vec<u8>,
}

struct BufferPtr(*mut u8);

// The registry keeps the buffer alive while the id is pending here
unsafe impl Send for BufferPtr {}

struct PendingTransfer {
    kind: TransferKind,
    buffer: BufferPtr,
    length: usize,
    deadline: Option<Instant>,
    iso_packet_lengths: Vec<u32>,
}

struct MockState {
    pending: BTreeMap<TransferId, PendingTransfer>,
    submitted: Vec<SubmittedTransfer>,
    cancel_requests: Vec<TransferId>,
    events: VecDeque<Event>,
    devices: Vec<DeviceInfo>,
    poll_set: Vec<PollDescriptor>,
    submit_error: Option<Error>,
    devices_error: Option<Error>,
    wait_errors: VecDeque<Error>,
    auto_confirm_cancel: bool,
    abandon_result: bool,
    interrupted: bool,
    closed: bool,
    waiting: usize,
    max_concurrent_waits: usize,
    wait_calls: usize,
}

/// Scriptable in-memory [`Transport`]
pub struct MockTransport {
    state: Mutex<MockState>,
    wakeup: Condvar,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                pending: BTreeMap::new(),
                submitted: Vec::new(),
                cancel_requests: Vec::new(),
                events: VecDeque::new(),
                devices: Vec::new(),
                poll_set: Vec::new(),
                submit_error: None,
                devices_error: None,
                wait_errors: VecDeque::new(),
                auto_confirm_cancel: true,
                abandon_result: true,
                interrupted: false,
                closed: false,
                waiting: 0,
                max_concurrent_waits: 0,
                wait_calls: 0,
            }),
            wakeup: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn push(&self, state: &mut MockState, event: Event) {
        state.events.push_back(event);
        self.wakeup.notify_all();
    }

    // Scripting

    /// Make every following submission fail with `error`
    pub fn set_submit_error(&self, error: Option<Error>) {
        self.state().submit_error = error;
    }

    pub fn set_devices_error(&self, error: Option<Error>) {
        self.state().devices_error = error;
    }

    /// Fail the next `wait` with `error`
    pub fn fail_next_wait(&self, error: Error) {
        self.state().wait_errors.push_back(error);
        self.wakeup.notify_all();
    }

    /// Whether a cancel request immediately yields a `Cancelled` completion
    ///
    /// Turn off to let tests decide how a cancelled transfer finishes.
    pub fn set_auto_confirm_cancel(&self, enabled: bool) {
        self.state().auto_confirm_cancel = enabled;
    }

    /// What `abandon` reports at shutdown
    pub fn set_abandon_result(&self, released: bool) {
        self.state().abandon_result = released;
    }

    /// Finish a pending transfer with `status`, moving `actual_length` bytes
    ///
    /// Returns `false` if the id is not pending.
    pub fn complete_with_status(&self, id: TransferId, status: TransferStatus, actual_length: usize) -> bool {
        let mut state = self.state();
        if state.pending.remove(&id).is_none() {
            return false;
        }
        let record = CompletionRecord::new(status, actual_length);
        self.push(&mut state, Event::TransferCompletion { id, record });
        true
    }

    /// Finish a pending transfer successfully
    pub fn complete(&self, id: TransferId, actual_length: usize) -> bool {
        self.complete_with_status(id, TransferStatus::Completed, actual_length)
    }

    /// Finish a pending IN transfer, writing `data` into its buffer
    ///
    /// For control transfers the data lands after the setup packet.
    pub fn complete_with_data(&self, id: TransferId, data: &[u8]) -> bool {
        let mut state = self.state();
        let Some(pending) = state.pending.remove(&id) else {
            return false;
        };
        let offset = match pending.kind {
            TransferKind::Control => ControlSetup::SIZE,
            _ => 0,
        };
        let count = data.len().min(pending.length.saturating_sub(offset));
        // SAFETY: the id was pending, so the registry still owns the buffer
        // and nothing else touches it until the completion is dispatched.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), pending.buffer.0.add(offset), count);
        }
        let record = CompletionRecord::completed(count);
        self.push(&mut state, Event::TransferCompletion { id, record });
        true
    }

    /// Finish a pending isochronous transfer with per-packet results
    pub fn complete_iso(&self, id: TransferId, packets: &[(u32, TransferStatus)]) -> bool {
        let mut state = self.state();
        let Some(pending) = state.pending.remove(&id) else {
            return false;
        };
        let iso_packets: Vec<IsoPacket> = pending
            .iso_packet_lengths
            .iter()
            .zip(packets)
            .map(|(&length, &(actual, status))| IsoPacket {
                length,
                actual_length: actual.min(length),
                status: Some(status),
            })
            .collect();
        let total = iso_packets.iter().map(|p| p.actual_length as usize).sum();
        let record = CompletionRecord {
            status: TransferStatus::Completed,
            actual_length: total,
            iso_packets,
        };
        self.push(&mut state, Event::TransferCompletion { id, record });
        true
    }

    /// Attach a device without notifying anyone
    pub fn add_device(&self, device: DeviceInfo) {
        self.state().devices.push(device);
    }

    /// Attach a device and queue an arrival
    pub fn arrive(&self, device: DeviceInfo) {
        let mut state = self.state();
        state.devices.push(device.clone());
        self.push(
            &mut state,
            Event::HotplugNotification {
                device,
                event: HotplugEvent::Arrived,
            },
        );
    }

    /// Detach a device and queue a removal
    pub fn leave(&self, device: &DeviceInfo) {
        let mut state = self.state();
        state
            .devices
            .retain(|d| (d.bus_number, d.device_address) != (device.bus_number, device.device_address));
        self.push(
            &mut state,
            Event::HotplugNotification {
                device: device.clone(),
                event: HotplugEvent::Left,
            },
        );
    }

    /// Add a descriptor to the poll set and queue the change
    pub fn add_poll_fd(&self, descriptor: PollDescriptor) {
        let mut state = self.state();
        state.poll_set.push(descriptor);
        self.push(&mut state, Event::PollSetChanged(PollChange::Added(descriptor)));
    }

    /// Remove a descriptor from the poll set and queue the change
    pub fn remove_poll_fd(&self, fd: i32) {
        let mut state = self.state();
        state.poll_set.retain(|pd| pd.fd != fd);
        self.push(&mut state, Event::PollSetChanged(PollChange::Removed(fd)));
    }

    // Inspection

    pub fn submitted(&self) -> Vec<SubmittedTransfer> {
        self.state().submitted.clone()
    }

    pub fn pending_ids(&self) -> Vec<TransferId> {
        self.state().pending.keys().copied().collect()
    }

    pub fn cancel_requests(&self) -> Vec<TransferId> {
        self.state().cancel_requests.clone()
    }

    /// Highest number of threads ever inside `wait` at once
    pub fn max_concurrent_waits(&self) -> usize {
        self.state().max_concurrent_waits
    }

    pub fn wait_calls(&self) -> usize {
        self.state().wait_calls
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Move expired transfers to `TimedOut`
    fn expire(&self, state: &mut MockState) {
        let now = Instant::now();
        let expired: Vec<TransferId> = state
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            state.pending.remove(&id);
            let record = CompletionRecord::with_status(TransferStatus::TimedOut);
            state.events.push_back(Event::TransferCompletion { id, record });
        }
    }

    fn earliest_deadline(state: &MockState) -> Option<Instant> {
        state.pending.values().filter_map(|p| p.deadline).min()
    }
}

impl Transport for MockTransport {
    fn submit(&self, descriptor: &TransferDescriptor) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::SessionClosed);
        }
        if let Some(error) = state.submit_error.clone() {
            return Err(error);
        }

        // SAFETY: the descriptor points at `length` initialized bytes owned by the registry
        let data = unsafe { std::slice::from_raw_parts(descriptor.buffer, descriptor.length) }.to_vec();
        state.submitted.push(SubmittedTransfer {
            id: descriptor.id,
            device: descriptor.device,
            endpoint: descriptor.endpoint,
            kind: descriptor.kind,
            length: descriptor.length,
            timeout: descriptor.timeout,
            stream_id: descriptor.stream_id,
            data,
        });
        state.pending.insert(
            descriptor.id,
            PendingTransfer {
                kind: descriptor.kind,
                buffer: BufferPtr(descriptor.buffer),
                length: descriptor.length,
                deadline: descriptor.timeout.map(|t| Instant::now() + t),
                iso_packet_lengths: descriptor.iso_packet_lengths.clone(),
            },
        );
        self.wakeup.notify_all();
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> Result<()> {
        let mut state = self.state();
        if !state.pending.contains_key(&id) {
            return Err(Error::NotFound);
        }
        state.cancel_requests.push(id);
        if state.auto_confirm_cancel {
            state.pending.remove(&id);
            let record = CompletionRecord::with_status(TransferStatus::Cancelled);
            self.push(&mut state, Event::TransferCompletion { id, record });
        }
        Ok(())
    }

    fn abandon(&self, id: TransferId) -> bool {
        let mut state = self.state();
        state.pending.remove(&id);
        state.abandon_result
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::SessionClosed);
        }
        state.waiting += 1;
        state.wait_calls += 1;
        state.max_concurrent_waits = state.max_concurrent_waits.max(state.waiting);

        let deadline = timeout.map(|t| Instant::now() + t);
        let result = loop {
            if let Some(error) = state.wait_errors.pop_front() {
                break Err(error);
            }
            self.expire(&mut state);
            if !state.events.is_empty() {
                break Ok(state.events.drain(..).collect());
            }
            if state.interrupted {
                state.interrupted = false;
                break Ok(Vec::new());
            }
            if state.closed {
                break Err(Error::SessionClosed);
            }

            let now = Instant::now();
            let wake_at = match (deadline, Self::earliest_deadline(&state)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            };
            match wake_at {
                Some(at) if at <= now => {
                    // One more look for transfers that expired exactly now
                    self.expire(&mut state);
                    break Ok(state.events.drain(..).collect());
                }
                Some(at) => state = self.wakeup.wait_timeout(state, at - now).unwrap().0,
                None => state = self.wakeup.wait(state).unwrap(),
            }
        };

        state.waiting -= 1;
        result
    }

    fn next_timeout(&self) -> Result<Option<Duration>> {
        let state = self.state();
        let now = Instant::now();
        Ok(Self::earliest_deadline(&state).map(|d| d.saturating_duration_since(now)))
    }

    fn poll_descriptors(&self) -> Vec<PollDescriptor> {
        self.state().poll_set.clone()
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let state = self.state();
        if let Some(error) = state.devices_error.clone() {
            return Err(error);
        }
        Ok(state.devices.clone())
    }

    fn interrupt(&self) {
        self.state().interrupted = true;
        self.wakeup.notify_all();
    }

    fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.pending.clear();
        self.wakeup.notify_all();
    }
}

/// Create a mock full-speed device
pub fn mock_device(bus_number: u8, device_address: u8, vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        bus_number,
        device_address,
        vendor_id,
        product_id,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        speed: DeviceSpeed::Full,
    }
}

/// Create a mock HID device (class 0x03, boot keyboard)
pub fn mock_hid_device(bus_number: u8, device_address: u8, vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        class: 0x03,
        subclass: 0x01,
        protocol: 0x01,
        speed: DeviceSpeed::Low,
        ..mock_device(bus_number, device_address, vendor_id, product_id)
    }
}

/// Create a mock mass storage device (class 0x08, SCSI, bulk-only)
pub fn mock_storage_device(bus_number: u8, device_address: u8, vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        class: 0x08,
        subclass: 0x06,
        protocol: 0x50,
        speed: DeviceSpeed::High,
        ..mock_device(bus_number, device_address, vendor_id, product_id)
    }
}

/// Create `count` distinct devices on bus 1
pub fn mock_device_list(count: usize) -> Vec<DeviceInfo> {
    (0..count)
        .map(|i| mock_device(1, (i + 2) as u8, 0x1000 + i as u16, 0x2000 + i as u16))
        .collect()
}

/// Run a future with a timeout
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
