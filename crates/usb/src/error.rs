//! Transfer engine errors

use crate::transfer::TransferStatus;
use protocol::DescriptorError;
use thiserror::Error;

/// Errors returned by the transfer engine
///
/// Cloneable so that a completed asynchronous transfer can hand out its
/// outcome any number of times.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Device is not open")]
    NotOpen,

    #[error("Device not found")]
    NotFound,

    #[error("Access denied")]
    AccessDenied,

    #[error("Device or interface is busy")]
    Busy,

    /// A read returned fewer bytes than a helper requires
    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    /// A write was acknowledged for fewer bytes than were sent
    #[error("Incomplete transfer: sent {actual} of {expected} bytes")]
    Incomplete { expected: usize, actual: usize },

    #[error("Malformed descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Failed to select configuration")]
    ConfigurationFailed,

    #[error("Interface at position {position} reports number {reported}")]
    InterfaceNumberMismatch { position: u8, reported: u8 },

    #[error("Failed to read descriptors")]
    DescriptorReadFailed,

    #[error("Operation not supported by this platform")]
    UnsupportedOperation,

    /// Non-blocking result query on a transfer that has not completed
    #[error("Transfer has not finished")]
    NotFinished,

    #[error("Transfer failed: {0:?}")]
    TransferFailed(TransferStatus),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Could not schedule isochronous transfer after {attempts} attempts")]
    IsoScheduleFailed { attempts: u32 },

    #[error("Platform error {code}: {message}")]
    Platform { code: i32, message: String },
}

/// Type alias for engine results
pub type Result<T> = std::result::Result<T, Error>;

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::NotFound | rusb::Error::NoDevice => Error::NotFound,
            rusb::Error::Access => Error::AccessDenied,
            rusb::Error::Busy => Error::Busy,
            rusb::Error::NotSupported => Error::UnsupportedOperation,
            rusb::Error::InvalidParam => Error::InvalidArgument(err.to_string()),
            rusb::Error::Pipe => Error::TransferFailed(TransferStatus::Stall),
            rusb::Error::Timeout => Error::TransferFailed(TransferStatus::TimedOut),
            rusb::Error::Overflow => Error::TransferFailed(TransferStatus::Overflow),
            _ => Error::Platform {
                code: libusb_code(err),
                message: err.to_string(),
            },
        }
    }
}

/// libusb error code for a rusb error
pub(crate) fn libusb_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

/// rusb error for a libusb error code
pub(crate) fn rusb_error(code: i32) -> rusb::Error {
    match code {
        -1 => rusb::Error::Io,
        -2 => rusb::Error::InvalidParam,
        -3 => rusb::Error::Access,
        -4 => rusb::Error::NoDevice,
        -5 => rusb::Error::NotFound,
        -6 => rusb::Error::Busy,
        -7 => rusb::Error::Timeout,
        -8 => rusb::Error::Overflow,
        -9 => rusb::Error::Pipe,
        -10 => rusb::Error::Interrupted,
        -11 => rusb::Error::NoMem,
        -12 => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(Error::from(rusb::Error::NotFound), Error::NotFound);
        assert_eq!(Error::from(rusb::Error::Access), Error::AccessDenied);
        assert_eq!(Error::from(rusb::Error::Busy), Error::Busy);
        assert_eq!(
            Error::from(rusb::Error::Pipe),
            Error::TransferFailed(TransferStatus::Stall)
        );
        assert!(matches!(
            Error::from(rusb::Error::Io),
            Error::Platform { code: -1, .. }
        ));
    }

    #[test]
    fn test_libusb_code_round_trip() {
        for code in -12..=-1 {
            assert_eq!(libusb_code(rusb_error(code)), code);
        }
        assert_eq!(libusb_code(rusb_error(-42)), -99);
    }

    #[test]
    fn test_descriptor_error_wraps() {
        let err: Error = DescriptorError::EndpointBeforeInterface.into();
        assert!(err.to_string().starts_with("Malformed descriptor"));
    }
}
