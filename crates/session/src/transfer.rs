//! Transfers and their lifecycle
//!
//! A [`Transfer`] owns its buffer. It is configured by the caller, moved
//! into the session on submission, and handed back by value to its
//! completion callback once the transport reports a terminal status.
//!
//! ```text
//! Allocated ──fill_*──► Configured ──submit──► Submitted ──complete──► Completed
//!                                                                      Cancelled
//!                                                                      Errored
//!                                                                      TimedOut ──free──► Freed
//! ```
//!
//! A transfer in a terminal state may be submitted again as-is.

use common::{
    ControlSetup, EndpointAddress, Error, IsoPacket, Result, TransferFlags, TransferKind,
    TransferStatus,
};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable key identifying a transfer across the native boundary
///
/// The transport receives this as user data on submission and reports it
/// back on completion; the registry resolves it to the owned transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl TransferId {
    fn next() -> Self {
        TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-assigned key for an opened device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceToken(pub u64);

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Allocated,
    Configured,
    Submitted,
    Completed,
    Cancelled,
    Errored,
    TimedOut,
    Freed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Cancelled
                | TransferState::Errored
                | TransferState::TimedOut
        )
    }

    /// Terminal state reached for a reported status
    pub fn from_status(status: TransferStatus) -> Self {
        match status {
            TransferStatus::Completed => TransferState::Completed,
            TransferStatus::Cancelled | TransferStatus::SessionClosed => TransferState::Cancelled,
            TransferStatus::TimedOut => TransferState::TimedOut,
            TransferStatus::Errored
            | TransferStatus::Stall
            | TransferStatus::NoDevice
            | TransferStatus::Overflow => TransferState::Errored,
        }
    }
}

/// Result payload the transport reports for a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub status: TransferStatus,
    /// Bytes moved, excluding the setup packet of control transfers
    pub actual_length: usize,
    /// Per-packet results (isochronous only)
    pub iso_packets: Vec<IsoPacket>,
}

impl CompletionRecord {
    pub fn new(status: TransferStatus, actual_length: usize) -> Self {
        Self {
            status,
            actual_length,
            iso_packets: Vec::new(),
        }
    }

    pub fn completed(actual_length: usize) -> Self {
        Self::new(TransferStatus::Completed, actual_length)
    }

    pub fn with_status(status: TransferStatus) -> Self {
        Self::new(status, 0)
    }
}

/// Completion callback; receives the transfer back by value
pub type TransferCallback = Arc<dyn Fn(Transfer) + Send + Sync>;

/// Native-facing view of a submitted transfer
///
/// `buffer` points into the transfer's heap allocation, which the registry
/// keeps alive and untouched until the completion for `id` is observed.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    pub id: TransferId,
    pub device: DeviceToken,
    pub endpoint: EndpointAddress,
    pub kind: TransferKind,
    pub flags: TransferFlags,
    pub buffer: *mut u8,
    pub length: usize,
    pub timeout: Option<Duration>,
    pub stream_id: Option<u32>,
    pub iso_packet_lengths: Vec<u32>,
}

impl TransferDescriptor {
    /// Timeout in libusb convention (0 = unlimited)
    pub fn timeout_ms(&self) -> u32 {
        self.timeout
            .map(|t| t.as_millis().clamp(1, u32::MAX as u128) as u32)
            .unwrap_or(0)
    }
}

/// One USB transfer
pub struct Transfer {
    id: TransferId,
    state: TransferState,
    kind: TransferKind,
    device: DeviceToken,
    endpoint: EndpointAddress,
    flags: TransferFlags,
    timeout: Option<Duration>,
    buffer: Vec<u8>,
    length: usize,
    status: Option<TransferStatus>,
    actual_length: usize,
    stream_id: Option<u32>,
    iso_capacity: usize,
    iso_packets: Vec<IsoPacket>,
    callback: Option<TransferCallback>,
}

impl Transfer {
    /// Allocate an unconfigured transfer with room for `iso_packets` packets
    pub fn alloc(iso_packets: usize) -> Self {
        Self {
            id: TransferId::next(),
            state: TransferState::Allocated,
            kind: TransferKind::Bulk,
            device: DeviceToken(0),
            endpoint: EndpointAddress::CONTROL,
            flags: TransferFlags::empty(),
            timeout: None,
            buffer: Vec::new(),
            length: 0,
            status: None,
            actual_length: 0,
            stream_id: None,
            iso_capacity: iso_packets,
            iso_packets: Vec::new(),
            callback: None,
        }
    }

    /// Configure as a control transfer
    ///
    /// For IN requests `data` must be empty; `setup.length` bytes are
    /// reserved for the data stage. For OUT requests `data` is the data
    /// stage and must be exactly `setup.length` bytes.
    pub fn fill_control(&mut self, device: DeviceToken, setup: ControlSetup, data: &[u8]) -> Result<()> {
        self.ensure_configurable()?;
        let data_len = setup.length as usize;
        if setup.is_in() && !data.is_empty() {
            return Err(Error::InvalidArgument(
                "control IN request cannot carry OUT data".to_string(),
            ));
        }
        if !setup.is_in() && data.len() != data_len {
            return Err(Error::InvalidArgument(format!(
                "control OUT data is {} bytes but wLength is {}",
                data.len(),
                data_len
            )));
        }

        let mut buffer = Vec::with_capacity(ControlSetup::SIZE + data_len);
        buffer.extend_from_slice(&setup.to_bytes());
        if setup.is_in() {
            buffer.resize(ControlSetup::SIZE + data_len, 0);
        } else {
            buffer.extend_from_slice(data);
        }

        self.configure(TransferKind::Control, device, EndpointAddress::CONTROL, buffer);
        Ok(())
    }

    /// Configure as a bulk transfer; for IN endpoints `buffer` is the receive space
    pub fn fill_bulk(&mut self, device: DeviceToken, endpoint: EndpointAddress, buffer: Vec<u8>) -> Result<()> {
        self.ensure_configurable()?;
        ensure_data_endpoint(TransferKind::Bulk, endpoint)?;
        self.configure(TransferKind::Bulk, device, endpoint, buffer);
        Ok(())
    }

    /// Configure as a bulk transfer on a USB 3 stream
    pub fn fill_bulk_stream(
        &mut self,
        device: DeviceToken,
        endpoint: EndpointAddress,
        stream_id: u32,
        buffer: Vec<u8>,
    ) -> Result<()> {
        self.ensure_configurable()?;
        ensure_data_endpoint(TransferKind::BulkStream, endpoint)?;
        if stream_id == 0 {
            return Err(Error::InvalidArgument("stream id 0 is reserved".to_string()));
        }
        self.configure(TransferKind::BulkStream, device, endpoint, buffer);
        self.stream_id = Some(stream_id);
        Ok(())
    }

    /// Configure as an interrupt transfer
    pub fn fill_interrupt(&mut self, device: DeviceToken, endpoint: EndpointAddress, buffer: Vec<u8>) -> Result<()> {
        self.ensure_configurable()?;
        ensure_data_endpoint(TransferKind::Interrupt, endpoint)?;
        self.configure(TransferKind::Interrupt, device, endpoint, buffer);
        Ok(())
    }

    /// Configure as an isochronous transfer split into `packet_lengths`
    pub fn fill_iso(
        &mut self,
        device: DeviceToken,
        endpoint: EndpointAddress,
        buffer: Vec<u8>,
        packet_lengths: &[u32],
    ) -> Result<()> {
        self.ensure_configurable()?;
        ensure_data_endpoint(TransferKind::Isochronous, endpoint)?;
        if packet_lengths.is_empty() {
            return Err(Error::InvalidArgument(
                "isochronous transfer needs at least one packet".to_string(),
            ));
        }
        if packet_lengths.len() > self.iso_capacity {
            return Err(Error::InvalidArgument(format!(
                "{} packets requested but {} allocated",
                packet_lengths.len(),
                self.iso_capacity
            )));
        }
        let total: u64 = packet_lengths.iter().map(|&l| l as u64).sum();
        if total > buffer.len() as u64 {
            return Err(Error::InvalidArgument(format!(
                "packet table needs {} bytes but buffer holds {}",
                total,
                buffer.len()
            )));
        }

        self.configure(TransferKind::Isochronous, device, endpoint, buffer);
        self.iso_packets = packet_lengths.iter().map(|&l| IsoPacket::new(l)).collect();
        Ok(())
    }

    fn ensure_configurable(&self) -> Result<()> {
        match self.state {
            TransferState::Freed => Err(Error::InvalidState(format!(
                "transfer {} has been freed",
                self.id
            ))),
            TransferState::Submitted => Err(Error::Busy),
            _ => Ok(()),
        }
    }

    fn configure(&mut self, kind: TransferKind, device: DeviceToken, endpoint: EndpointAddress, buffer: Vec<u8>) {
        self.kind = kind;
        self.device = device;
        self.endpoint = endpoint;
        self.length = buffer.len();
        self.buffer = buffer;
        self.stream_id = None;
        self.iso_packets.clear();
        self.status = None;
        self.actual_length = 0;
        self.state = TransferState::Configured;
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_flags(&mut self, flags: TransferFlags) {
        self.flags = flags;
    }

    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: Fn(Transfer) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    pub(crate) fn replace_callback(&mut self, callback: Option<TransferCallback>) -> Option<TransferCallback> {
        std::mem::replace(&mut self.callback, callback)
    }

    /// Release the buffer and callback; the transfer cannot be submitted again
    ///
    /// Allowed once the transfer has finished, or if it was never submitted.
    pub fn free(&mut self) -> Result<()> {
        match self.state {
            TransferState::Submitted => return Err(Error::Busy),
            TransferState::Freed => {
                return Err(Error::InvalidState(format!(
                    "transfer {} has already been freed",
                    self.id
                )));
            }
            _ => {}
        }
        self.buffer = Vec::new();
        self.iso_packets.clear();
        self.callback = None;
        self.length = 0;
        self.state = TransferState::Freed;
        Ok(())
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn device(&self) -> DeviceToken {
        self.device
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    pub fn flags(&self) -> TransferFlags {
        self.flags
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Terminal status of the last submission
    pub fn status(&self) -> Option<TransferStatus> {
        self.status
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Requested length (for control transfers, including the setup packet)
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    pub fn iso_packets(&self) -> &[IsoPacket] {
        &self.iso_packets
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Setup packet of a control transfer
    pub fn setup(&self) -> Option<ControlSetup> {
        match self.kind {
            TransferKind::Control => ControlSetup::from_bytes(&self.buffer),
            _ => None,
        }
    }

    /// Bytes moved by the last submission
    ///
    /// Control transfers skip the setup packet. Isochronous data is packed
    /// per packet, so this returns the whole used packet area.
    pub fn data(&self) -> &[u8] {
        match self.kind {
            TransferKind::Control => {
                let start = ControlSetup::SIZE.min(self.buffer.len());
                let end = (start + self.actual_length).min(self.buffer.len());
                &self.buffer[start..end]
            }
            TransferKind::Isochronous => {
                let used: usize = self.iso_packets.iter().map(|p| p.length as usize).sum();
                &self.buffer[..used.min(self.buffer.len())]
            }
            _ => &self.buffer[..self.actual_length.min(self.buffer.len())],
        }
    }

    /// Data stage of a control transfer, `None` for other kinds
    pub fn control_data(&self) -> Option<&[u8]> {
        match self.kind {
            TransferKind::Control => Some(self.data()),
            _ => None,
        }
    }

    /// Take the buffer out, leaving the transfer empty
    pub fn into_buffer(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub(crate) fn callback(&self) -> Option<TransferCallback> {
        self.callback.clone()
    }

    /// Validate for submission and move to `Submitted`
    pub(crate) fn arm(&mut self) -> Result<TransferDescriptor> {
        match self.state {
            TransferState::Configured => {}
            s if s.is_terminal() => {}
            TransferState::Allocated => {
                return Err(Error::InvalidArgument(format!(
                    "transfer {} has not been configured",
                    self.id
                )));
            }
            TransferState::Freed => {
                return Err(Error::InvalidState(format!(
                    "transfer {} has been freed",
                    self.id
                )));
            }
            _ => return Err(Error::Busy),
        }

        self.status = None;
        self.actual_length = 0;
        for packet in &mut self.iso_packets {
            packet.actual_length = 0;
            packet.status = None;
        }
        self.state = TransferState::Submitted;

        Ok(TransferDescriptor {
            id: self.id,
            device: self.device,
            endpoint: self.endpoint,
            kind: self.kind,
            flags: self.flags,
            buffer: self.buffer.as_mut_ptr(),
            length: self.length,
            timeout: self.timeout,
            stream_id: self.stream_id,
            iso_packet_lengths: self.iso_packets.iter().map(|p| p.length).collect(),
        })
    }

    /// Undo `arm` after the transport refused the submission
    pub(crate) fn disarm(&mut self) {
        self.state = TransferState::Configured;
    }

    /// Apply a completion record and move to the matching terminal state
    pub(crate) fn finish(&mut self, record: CompletionRecord) {
        let capacity = match self.kind {
            TransferKind::Control => self.length.saturating_sub(ControlSetup::SIZE),
            _ => self.length,
        };
        self.status = Some(record.status);
        self.actual_length = record.actual_length.min(capacity);
        if self.kind == TransferKind::Isochronous {
            for (packet, reported) in self.iso_packets.iter_mut().zip(record.iso_packets) {
                packet.actual_length = reported.actual_length.min(packet.length);
                packet.status = reported.status;
            }
        }
        self.state = TransferState::from_status(record.status);
    }

    /// Replace a buffer the native side may still reference
    pub(crate) fn abandon_buffer(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        std::mem::forget(buffer);
        self.length = 0;
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("length", &self.length)
            .field("status", &self.status)
            .field("actual_length", &self.actual_length)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

fn ensure_data_endpoint(kind: TransferKind, endpoint: EndpointAddress) -> Result<()> {
    if endpoint.number() == 0 {
        return Err(Error::InvalidArgument(format!(
            "endpoint {} is the control endpoint, not valid for {:?}",
            endpoint, kind
        )));
    }
    Ok(())
}

/// Builder for configured transfers
///
/// Obtained from the session's transfer factories, e.g.
/// [`Session::bulk_transfer`](crate::Session::bulk_transfer).
pub struct TransferBuilder {
    kind: TransferKind,
    device: DeviceToken,
    endpoint: EndpointAddress,
    length: usize,
    data: Option<Vec<u8>>,
    setup: Option<ControlSetup>,
    stream_id: u32,
    packet_lengths: Vec<u32>,
    timeout: Option<Duration>,
    flags: TransferFlags,
    callback: Option<TransferCallback>,
}

impl TransferBuilder {
    fn new(kind: TransferKind, device: DeviceToken, endpoint: EndpointAddress, length: usize) -> Self {
        Self {
            kind,
            device,
            endpoint,
            length,
            data: None,
            setup: None,
            stream_id: 0,
            packet_lengths: Vec::new(),
            timeout: None,
            flags: TransferFlags::empty(),
            callback: None,
        }
    }

    pub fn control(device: DeviceToken, setup: ControlSetup) -> Self {
        let mut builder = Self::new(
            TransferKind::Control,
            device,
            EndpointAddress::CONTROL,
            setup.length as usize,
        );
        builder.setup = Some(setup);
        builder
    }

    pub fn bulk(device: DeviceToken, endpoint: impl Into<EndpointAddress>, length: usize) -> Self {
        Self::new(TransferKind::Bulk, device, endpoint.into(), length)
    }

    pub fn bulk_stream(
        device: DeviceToken,
        endpoint: impl Into<EndpointAddress>,
        stream_id: u32,
        length: usize,
    ) -> Self {
        let mut builder = Self::new(TransferKind::BulkStream, device, endpoint.into(), length);
        builder.stream_id = stream_id;
        builder
    }

    pub fn interrupt(device: DeviceToken, endpoint: impl Into<EndpointAddress>, length: usize) -> Self {
        Self::new(TransferKind::Interrupt, device, endpoint.into(), length)
    }

    pub fn isochronous(device: DeviceToken, endpoint: impl Into<EndpointAddress>, packet_lengths: Vec<u32>) -> Self {
        let length = packet_lengths.iter().map(|&l| l as usize).sum();
        let mut builder = Self::new(TransferKind::Isochronous, device, endpoint.into(), length);
        builder.packet_lengths = packet_lengths;
        builder
    }

    /// OUT payload; replaces the zero-filled receive buffer
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Transfer) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<Transfer> {
        let mut transfer = Transfer::alloc(self.packet_lengths.len());
        let buffer = match self.data {
            Some(data) => data,
            None => vec![0u8; self.length],
        };

        match self.kind {
            TransferKind::Control => {
                let setup = self
                    .setup
                    .ok_or_else(|| Error::InvalidArgument("control transfer without setup".to_string()))?;
                let out_data: &[u8] = if setup.is_in() { &[] } else { &buffer };
                transfer.fill_control(self.device, setup, out_data)?;
            }
            TransferKind::Bulk => transfer.fill_bulk(self.device, self.endpoint, buffer)?,
            TransferKind::BulkStream => {
                transfer.fill_bulk_stream(self.device, self.endpoint, self.stream_id, buffer)?
            }
            TransferKind::Interrupt => transfer.fill_interrupt(self.device, self.endpoint, buffer)?,
            TransferKind::Isochronous => {
                transfer.fill_iso(self.device, self.endpoint, buffer, &self.packet_lengths)?
            }
        }

        transfer.timeout = self.timeout;
        transfer.flags = self.flags;
        transfer.callback = self.callback;
        Ok(transfer)
    }
}
