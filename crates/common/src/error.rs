//! Common error types
//!
//! Synchronous operations (submit, cancel, register, deregister) fail with
//! one of these. Transfer outcomes are never reported through this type;
//! they arrive as a [`TransferStatus`](crate::TransferStatus) on completion.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed transfer or registration
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the object's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Resource busy")]
    Busy,

    #[error("Operation timed out")]
    Timeout,

    #[error("Overflow")]
    Overflow,

    #[error("Pipe error")]
    Pipe,

    #[error("Interrupted")]
    Interrupted,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Entity not found")]
    NotFound,

    #[error("Access denied (insufficient permissions)")]
    Access,

    #[error("IO error: {0}")]
    Io(String),

    /// Session is closed or its native handle is gone
    #[error("Session closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    /// Native error code with no closer mapping
    #[error("Native error {0}")]
    Other(i32),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors after which the native session cannot be used any more
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SessionClosed)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Map rusb::Error onto the session taxonomy
impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Io => Error::Io("native I/O error".to_string()),
            rusb::Error::InvalidParam => Error::InvalidArgument("rejected by libusb".to_string()),
            rusb::Error::Access => Error::Access,
            rusb::Error::NoDevice => Error::NoDevice,
            rusb::Error::NotFound => Error::NotFound,
            rusb::Error::Busy => Error::Busy,
            rusb::Error::Timeout => Error::Timeout,
            rusb::Error::Overflow => Error::Overflow,
            rusb::Error::Pipe => Error::Pipe,
            rusb::Error::Interrupted => Error::Interrupted,
            rusb::Error::NoMem => Error::Other(-11),
            rusb::Error::NotSupported => Error::NotSupported,
            _ => Error::Other(-99),
        }
    }
}

impl Error {
    /// Map a negative libusb return code
    pub fn from_native(code: i32) -> Self {
        match code {
            -1 => Error::Io("native I/O error".to_string()),
            -2 => Error::InvalidArgument("rejected by libusb".to_string()),
            -3 => Error::Access,
            -4 => Error::NoDevice,
            -5 => Error::NotFound,
            -6 => Error::Busy,
            -7 => Error::Timeout,
            -8 => Error::Overflow,
            -9 => Error::Pipe,
            -10 => Error::Interrupted,
            -12 => Error::NotSupported,
            other => Error::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(Error::from(rusb::Error::Timeout), Error::Timeout);
        assert_eq!(Error::from(rusb::Error::Pipe), Error::Pipe);
        assert_eq!(Error::from(rusb::Error::NoDevice), Error::NoDevice);
        assert_eq!(Error::from(rusb::Error::NotFound), Error::NotFound);
        assert_eq!(Error::from(rusb::Error::Other), Error::Other(-99));
    }

    #[test]
    fn test_map_native_code() {
        assert_eq!(Error::from_native(-4), Error::NoDevice);
        assert_eq!(Error::from_native(-10), Error::Interrupted);
        assert_eq!(Error::from_native(-12), Error::NotSupported);
        assert_eq!(Error::from_native(-42), Error::Other(-42));
    }

    #[test]
    fn test_error_display() {
        let msg = Error::InvalidArgument("endpoint 0x00 is not a bulk endpoint".into()).to_string();
        assert!(msg.contains("Invalid argument"));
        assert!(msg.contains("0x00"));
        assert_eq!(Error::SessionClosed.to_string(), "Session closed");
    }

    #[test]
    fn test_only_session_closed_is_fatal() {
        assert!(Error::SessionClosed.is_fatal());
        assert!(!Error::NoDevice.is_fatal());
        assert!(!Error::Interrupted.is_fatal());
    }
}
