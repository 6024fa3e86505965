//! Common types for the USB session workspace
//!
//! This crate holds everything the event core shares with its embedders:
//! the USB data model (devices, endpoints, transfer kinds and statuses,
//! hot-plug events), the error taxonomy, logging setup and the session
//! configuration file.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use types::{
    CallbackAction, ControlSetup, DeviceInfo, DeviceSpeed, EndpointAddress, HotplugEvent,
    HotplugEvents, IsoPacket, TransferFlags, TransferKind, TransferStatus,
};
