//! libusb transport
//!
//! Native transport built on `rusb` and the libusb1-sys bindings it
//! re-exports as `rusb::ffi`. Transfers are raw `libusb_transfer`s whose
//! user data is the [`TransferId`]; the completion callback only records
//! that id, and the records are assembled after `handle_events` returns,
//! on the event-handling thread.

use crate::poll::{self, Interest, PollChange, PollDescriptor};
use crate::transfer::{CompletionRecord, DeviceToken, TransferDescriptor, TransferId};
use crate::transport::{Event, Transport};
use common::{DeviceInfo, DeviceSpeed, Error, HotplugEvent, IsoPacket, Result, TransferKind, TransferStatus};
use rusb::ffi::{self, constants::*, libusb_transfer};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

thread_local! {
    // Filled by `transfer_callback` while this thread is inside handle_events
    static COMPLETED: RefCell<Vec<TransferId>> = const { RefCell::new(Vec::new()) };
}

extern "system" fn transfer_callback(transfer: *mut libusb_transfer) {
    let id = TransferId(unsafe { (*transfer).user_data } as usize as u64);
    COMPLETED.with(|completed| completed.borrow_mut().push(id));
}

struct RawTransfer(*mut libusb_transfer);

// Only dereferenced under the inflight lock or after libusb handed it back
unsafe impl Send for RawTransfer {}

struct HotplugHandle(#[allow(dead_code)] Registration<Context>);

// The registration is only created and dropped under a mutex
unsafe impl Send for HotplugHandle {}

/// Feeds libusb hot-plug callbacks into the transport's event queue
struct HotplugQueue {
    queue: Arc<Mutex<VecDeque<Event>>>,
}

impl<T: UsbContext> Hotplug<T> for HotplugQueue {
    fn device_arrived(&mut self, device: Device<T>) {
        let device = device_info(&device);
        debug!("Hot-plug: device arrived {}", device);
        self.queue.lock().unwrap().push_back(Event::HotplugNotification {
            device,
            event: HotplugEvent::Arrived,
        });
    }

    fn device_left(&mut self, device: Device<T>) {
        let device = device_info(&device);
        debug!("Hot-plug: device left {}", device);
        self.queue.lock().unwrap().push_back(Event::HotplugNotification {
            device,
            event: HotplugEvent::Left,
        });
    }
}

/// [`Transport`] backed by a libusb context
pub struct LibusbTransport {
    context: Context,
    handles: Mutex<HashMap<DeviceToken, DeviceHandle<Context>>>,
    next_token: AtomicU64,
    inflight: Mutex<HashMap<TransferId, RawTransfer>>,
    hotplug_events: Arc<Mutex<VecDeque<Event>>>,
    registration: Mutex<Option<HotplugHandle>>,
    poll_set: Mutex<Vec<PollDescriptor>>,
    closed: AtomicBool,
}

impl LibusbTransport {
    /// Create a libusb context and subscribe to hot-plug events where supported
    pub fn new() -> Result<Self> {
        let context = Context::new()?;
        let transport = Self {
            context,
            handles: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            inflight: Mutex::new(HashMap::new()),
            hotplug_events: Arc::new(Mutex::new(VecDeque::new())),
            registration: Mutex::new(None),
            poll_set: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        if rusb::has_hotplug() {
            let callback = HotplugQueue {
                queue: transport.hotplug_events.clone(),
            };
            let registration = HotplugBuilder::new()
                .enumerate(false) // Enumeration is done per registration
                .register(&transport.context, Box::new(callback))?;
            *transport.registration.lock().unwrap() = Some(HotplugHandle(registration));
            debug!("Hot-plug callbacks registered");
        } else {
            warn!("Hot-plug is not supported on this platform");
        }

        *transport.poll_set.lock().unwrap() = transport.read_pollfds();
        Ok(transport)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Hand an opened device to the transport
    pub fn attach(&self, handle: DeviceHandle<Context>) -> DeviceToken {
        let token = DeviceToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        debug!(
            "Attached device {:03}:{:03} as token {}",
            handle.device().bus_number(),
            handle.device().address(),
            token.0
        );
        self.handles.lock().unwrap().insert(token, handle);
        token
    }

    /// Open the first device matching `vendor_id:product_id`
    pub fn open(&self, vendor_id: u16, product_id: u16) -> Result<DeviceToken> {
        let handle = self
            .context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(Error::NotFound)?;
        Ok(self.attach(handle))
    }

    /// Close a device; its pending transfers must have finished
    pub fn detach(&self, token: DeviceToken) -> Result<()> {
        self.handles
            .lock()
            .unwrap()
            .remove(&token)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    fn read_pollfds(&self) -> Vec<PollDescriptor> {
        let mut descriptors = Vec::new();
        unsafe {
            let list = ffi::libusb_get_pollfds(self.context.as_raw());
            if list.is_null() {
                return descriptors;
            }
            let mut index = 0;
            loop {
                let entry = *list.add(index);
                if entry.is_null() {
                    break;
                }
                let mut interest = Interest::empty();
                if (*entry).events & libc::POLLIN != 0 {
                    interest |= Interest::READABLE;
                }
                if (*entry).events & libc::POLLOUT != 0 {
                    interest |= Interest::WRITABLE;
                }
                descriptors.push(PollDescriptor::new((*entry).fd, interest));
                index += 1;
            }
            ffi::libusb_free_pollfds(list);
        }
        descriptors
    }

    /// Build the completion record of a finished transfer and free it
    fn reap(&self, id: TransferId) -> Option<CompletionRecord> {
        let raw = self.inflight.lock().unwrap().remove(&id)?;
        let record = unsafe {
            let transfer = &*raw.0;
            let mut record = CompletionRecord::new(
                status_from_native(transfer.status),
                transfer.actual_length.max(0) as usize,
            );
            if transfer.transfer_type == LIBUSB_TRANSFER_TYPE_ISOCHRONOUS {
                let packets = transfer.iso_packet_desc.as_ptr();
                record.iso_packets = (0..transfer.num_iso_packets.max(0) as usize)
                    .map(|i| {
                        let desc = &*packets.add(i);
                        IsoPacket {
                            length: desc.length,
                            actual_length: desc.actual_length,
                            status: Some(status_from_native(desc.status)),
                        }
                    })
                    .collect();
                record.actual_length = record.iso_packets.iter().map(|p| p.actual_length as usize).sum();
            }
            ffi::libusb_free_transfer(raw.0);
            record
        };
        Some(record)
    }
}

impl Transport for LibusbTransport {
    fn submit(&self, descriptor: &TransferDescriptor) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        let device = self
            .handles
            .lock()
            .unwrap()
            .get(&descriptor.device)
            .map(|h| h.as_raw())
            .ok_or(Error::NoDevice)?;

        let iso_packets = descriptor.iso_packet_lengths.len() as c_int;
        let raw = unsafe { ffi::libusb_alloc_transfer(iso_packets) };
        if raw.is_null() {
            return Err(Error::Other(LIBUSB_ERROR_NO_MEM));
        }

        let user_data = descriptor.id.0 as usize as *mut c_void;
        let timeout = descriptor.timeout_ms() as c_uint;
        let length = descriptor.length as c_int;
        unsafe {
            match descriptor.kind {
                TransferKind::Control => {
                    ffi::libusb_fill_control_transfer(
                        raw,
                        device,
                        descriptor.buffer,
                        transfer_callback,
                        user_data,
                        timeout,
                    );
                }
                TransferKind::Bulk | TransferKind::BulkStream => {
                    ffi::libusb_fill_bulk_transfer(
                        raw,
                        device,
                        descriptor.endpoint.0,
                        descriptor.buffer,
                        length,
                        transfer_callback,
                        user_data,
                        timeout,
                    );
                    if let Some(stream_id) = descriptor.stream_id {
                        (*raw).transfer_type = LIBUSB_TRANSFER_TYPE_BULK_STREAM;
                        ffi::libusb_transfer_set_stream_id(raw, stream_id);
                    }
                }
                TransferKind::Interrupt => {
                    ffi::libusb_fill_interrupt_transfer(
                        raw,
                        device,
                        descriptor.endpoint.0,
                        descriptor.buffer,
                        length,
                        transfer_callback,
                        user_data,
                        timeout,
                    );
                }
                TransferKind::Isochronous => {
                    ffi::libusb_fill_iso_transfer(
                        raw,
                        device,
                        descriptor.endpoint.0,
                        descriptor.buffer,
                        length,
                        iso_packets,
                        transfer_callback,
                        user_data,
                        timeout,
                    );
                    let packets = (*raw).iso_packet_desc.as_mut_ptr();
                    for (i, &packet_length) in descriptor.iso_packet_lengths.iter().enumerate() {
                        (*packets.add(i)).length = packet_length;
                    }
                }
            }
            (*raw).flags = descriptor.flags.bits();
        }

        // Indexed before submission so the callback can always be resolved
        self.inflight
            .lock()
            .unwrap()
            .insert(descriptor.id, RawTransfer(raw));

        let rc = unsafe { ffi::libusb_submit_transfer(raw) };
        if rc < 0 {
            self.inflight.lock().unwrap().remove(&descriptor.id);
            unsafe { ffi::libusb_free_transfer(raw) };
            return Err(Error::from_native(rc));
        }
        trace!("Submitted libusb transfer {} ({:p})", descriptor.id, raw);
        Ok(())
    }

    fn cancel(&self, id: TransferId) -> Result<()> {
        let inflight = self.inflight.lock().unwrap();
        let raw = inflight.get(&id).ok_or(Error::NotFound)?;
        let rc = unsafe { ffi::libusb_cancel_transfer(raw.0) };
        if rc < 0 {
            return Err(Error::from_native(rc));
        }
        Ok(())
    }

    fn abandon(&self, id: TransferId) -> bool {
        // Still owned by libusb: leak the transfer rather than free it under the kernel
        let still_native = self.inflight.lock().unwrap().remove(&id).is_some();
        if still_native {
            warn!("Abandoning libusb transfer {} still in flight", id);
        }
        !still_native
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }

        let handled = self.context.handle_events(timeout);
        let completed = COMPLETED.with(|completed| std::mem::take(&mut *completed.borrow_mut()));
        if let Err(e) = handled {
            if completed.is_empty() {
                return Err(e.into());
            }
            debug!("handle_events failed after {} completions: {}", completed.len(), e);
        }

        let mut events: Vec<Event> = completed
            .into_iter()
            .filter_map(|id| {
                self.reap(id)
                    .map(|record| Event::TransferCompletion { id, record })
            })
            .collect();
        events.extend(self.hotplug_events.lock().unwrap().drain(..));

        let current = self.read_pollfds();
        let mut known = self.poll_set.lock().unwrap();
        let changes: Vec<PollChange> = poll::diff(&known, &current);
        *known = current;
        events.extend(changes.into_iter().map(Event::PollSetChanged));

        Ok(events)
    }

    fn next_timeout(&self) -> Result<Option<Duration>> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let rc = unsafe { ffi::libusb_get_next_timeout(self.context.as_raw(), &mut tv) };
        match rc {
            0 => Ok(None),
            rc if rc < 0 => Err(Error::from_native(rc)),
            _ => Ok(Some(
                Duration::from_secs(tv.tv_sec.max(0) as u64)
                    + Duration::from_micros(tv.tv_usec.max(0) as u64),
            )),
        }
    }

    fn poll_descriptors(&self) -> Vec<PollDescriptor> {
        self.poll_set.lock().unwrap().clone()
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let list = self.context.devices()?;
        Ok(list.iter().map(|device| device_info(&device)).collect())
    }

    fn interrupt(&self) {
        unsafe { ffi::libusb_interrupt_event_handler(self.context.as_raw()) };
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registration.lock().unwrap().take();
        self.handles.lock().unwrap().clear();
        let leaked = self.inflight.lock().unwrap().drain().count();
        if leaked > 0 {
            warn!("{} libusb transfers still in flight at close", leaked);
        }
        debug!("libusb transport closed");
    }
}

fn status_from_native(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Errored,
    }
}

/// Device information from a rusb device
fn device_info<T: UsbContext>(device: &Device<T>) -> DeviceInfo {
    let (vendor_id, product_id, class, subclass, protocol) = match device.device_descriptor() {
        Ok(desc) => (
            desc.vendor_id(),
            desc.product_id(),
            desc.class_code(),
            desc.sub_class_code(),
            desc.protocol_code(),
        ),
        Err(e) => {
            debug!("No descriptor for {:03}:{:03}: {}", device.bus_number(), device.address(), e);
            (0, 0, 0, 0, 0)
        }
    };

    DeviceInfo {
        bus_number: device.bus_number(),
        device_address: device.address(),
        vendor_id,
        product_id,
        class,
        subclass,
        protocol,
        speed: match device.speed() {
            rusb::Speed::Low => DeviceSpeed::Low,
            rusb::Speed::Full => DeviceSpeed::Full,
            rusb::Speed::High => DeviceSpeed::High,
            rusb::Speed::Super => DeviceSpeed::Super,
            rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
            _ => DeviceSpeed::Unknown,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_from_native(LIBUSB_TRANSFER_COMPLETED), TransferStatus::Completed);
        assert_eq!(status_from_native(LIBUSB_TRANSFER_STALL), TransferStatus::Stall);
        assert_eq!(status_from_native(LIBUSB_TRANSFER_ERROR), TransferStatus::Errored);
        assert_eq!(status_from_native(LIBUSB_TRANSFER_NO_DEVICE), TransferStatus::NoDevice);
    }
}
