//! USB type definitions
//!
//! This module defines the USB data model shared by the event core and its
//! embedders: device identity, endpoint addressing, transfer kinds, flags
//! and completion statuses, and hot-plug events.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device information delivered with hot-plug notifications
///
/// Carries the descriptor fields hot-plug filters match against. String
/// descriptors are not part of it; decoding those is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Bus number the device is attached to
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Negotiated device speed
    pub speed: DeviceSpeed,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}:{:03} {:04x}:{:04x}",
            self.bus_number, self.device_address, self.vendor_id, self.product_id
        )
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSpeed {
    /// Speed not reported by the host controller
    #[default]
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

/// Endpoint address (bit 7 is the direction, bits 0-3 the number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// The default control endpoint
    pub const CONTROL: EndpointAddress = EndpointAddress(0x00);

    /// Device-to-host endpoint
    pub fn is_in(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Host-to-device endpoint
    pub fn is_out(self) -> bool {
        !self.is_in()
    }

    /// Endpoint number without the direction bit
    pub fn number(self) -> u8 {
        self.0 & 0x0f
    }
}

impl From<u8> for EndpointAddress {
    fn from(address: u8) -> Self {
        EndpointAddress(address)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// USB transfer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Control transfer on endpoint 0, buffer starts with the setup packet
    Control,
    /// Isochronous transfer split into fixed packets
    Isochronous,
    /// Bulk transfer
    Bulk,
    /// Interrupt transfer
    Interrupt,
    /// Bulk transfer on a USB 3 stream
    BulkStream,
}

impl TransferKind {
    /// libusb transfer type tag
    pub fn type_tag(self) -> u8 {
        match self {
            TransferKind::Control => 0,
            TransferKind::Isochronous => 1,
            TransferKind::Bulk => 2,
            TransferKind::Interrupt => 3,
            TransferKind::BulkStream => 4,
        }
    }
}

bitflags! {
    /// Per-transfer behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransferFlags: u8 {
        /// Report a short IN transfer as an error
        const SHORT_NOT_OK = 1 << 0;
        /// Terminate an OUT transfer that is a multiple of the packet size with a zero-length packet
        const ADD_ZERO_PACKET = 1 << 3;
    }
}

/// Terminal status of a transfer, as reported on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer finished; fewer bytes than requested may have moved
    Completed,
    /// Transfer failed
    Errored,
    /// Per-transfer timeout expired
    TimedOut,
    /// Transfer was cancelled
    Cancelled,
    /// Endpoint stalled (control request not supported for control endpoints)
    Stall,
    /// Device was disconnected
    NoDevice,
    /// Device sent more data than requested
    Overflow,
    /// Session was closed while the transfer was pending
    SessionClosed,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// One packet of an isochronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    /// Requested packet length
    pub length: u32,
    /// Bytes actually moved for this packet
    pub actual_length: u32,
    /// Packet status (None until the transfer completes)
    pub status: Option<TransferStatus>,
}

impl IsoPacket {
    pub fn new(length: u32) -> Self {
        Self {
            length,
            actual_length: 0,
            status: None,
        }
    }
}

/// Control transfer setup packet
///
/// Encoded little-endian into the first 8 bytes of a control transfer's
/// buffer, data stage follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    /// bmRequestType (bit 7 = device-to-host)
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength, length of the data stage
    pub length: u16,
}

impl ControlSetup {
    /// Size of the encoded setup packet
    pub const SIZE: usize = 8;

    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

/// Hot-plug event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HotplugEvent {
    /// Device was connected
    Arrived,
    /// Device was disconnected
    Left,
}

bitflags! {
    /// Set of hot-plug events a registration subscribes to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HotplugEvents: u8 {
        const ARRIVED = 0x01;
        const LEFT = 0x02;
    }
}

impl Default for HotplugEvents {
    fn default() -> Self {
        HotplugEvents::all()
    }
}

impl HotplugEvents {
    pub fn contains_event(self, event: HotplugEvent) -> bool {
        self.contains(HotplugEvents::from(event))
    }
}

impl From<HotplugEvent> for HotplugEvents {
    fn from(event: HotplugEvent) -> Self {
        match event {
            HotplugEvent::Arrived => HotplugEvents::ARRIVED,
            HotplugEvent::Left => HotplugEvents::LEFT,
        }
    }
}

/// What a hot-plug callback wants done with its registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallbackAction {
    /// Stay registered
    #[default]
    Keep,
    /// Deregister now
    Deregister,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_direction() {
        assert!(EndpointAddress(0x81).is_in());
        assert_eq!(EndpointAddress(0x81).number(), 1);
        assert!(EndpointAddress(0x02).is_out());
        assert_eq!(EndpointAddress::CONTROL.number(), 0);
        assert_eq!(EndpointAddress(0x81).to_string(), "0x81");
    }

    #[test]
    fn test_setup_packet_encoding() {
        // GET_DESCRIPTOR(Device), 18 bytes
        let setup = ControlSetup {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0x0000,
            length: 0x0012,
        };
        let bytes = setup.to_bytes();

        assert_eq!(bytes, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert!(setup.is_in());
        assert_eq!(ControlSetup::from_bytes(&bytes), Some(setup));
        assert_eq!(ControlSetup::from_bytes(&bytes[..4]), None);
    }

    #[test]
    fn test_hotplug_event_set() {
        let events = HotplugEvents::ARRIVED;
        assert!(events.contains_event(HotplugEvent::Arrived));
        assert!(!events.contains_event(HotplugEvent::Left));
        assert!(HotplugEvents::default().contains_event(HotplugEvent::Left));
    }

    #[test]
    fn test_type_tags_match_libusb() {
        assert_eq!(TransferKind::Control.type_tag(), 0);
        assert_eq!(TransferKind::Isochronous.type_tag(), 1);
        assert_eq!(TransferKind::BulkStream.type_tag(), 4);
    }

    #[test]
    fn test_device_display() {
        let device = DeviceInfo {
            bus_number: 1,
            device_address: 4,
            vendor_id: 0x05ac,
            product_id: 0x12a8,
            class: 0,
            subclass: 0,
            protocol: 0,
            speed: DeviceSpeed::High,
        };
        assert_eq!(device.to_string(), "001:004 05ac:12a8");
    }
}
