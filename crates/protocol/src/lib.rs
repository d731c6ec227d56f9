//! USB wire format for usb-explorer
//!
//! This crate decodes the standard descriptors of chapter 9 of the USB 2.0
//! specification and builds control request setup packets. It does no I/O;
//! the `usb` crate feeds it bytes read from real devices.
//!
//! # Example
//!
//! ```
//! use protocol::{EndpointInfo, parse_configuration};
//!
//! let bytes = [
//!     9, 0x02, 25, 0, 1, 1, 0, 0x80, 50, // configuration
//!     9, 0x04, 0, 0, 1, 0xFF, 0, 0, 0, // interface 0
//!     7, 0x05, 0x81, 0x02, 0x00, 0x02, 0, // bulk IN endpoint
//! ];
//! let config = parse_configuration(&bytes).unwrap();
//! assert_eq!(config.configuration_value, 1);
//!
//! let info = EndpointInfo::from(&config.interfaces[0].endpoints[0]);
//! assert_eq!(info.to_string(), "#1 Bulk IN Max Packet Size: 512 Interval: 0");
//! ```

pub mod constants;
pub mod descriptors;
pub mod endpoint;
pub mod error;
pub mod request;
pub mod strings;

pub use descriptors::{
    ConfigurationDescriptor, DescriptorType, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor, configuration_total_length, parse_configuration,
    parse_device_descriptor,
};
pub use endpoint::{EndpointInfo, Synchronisation, TransferType, Usage};
pub use error::{DescriptorError, Result};
pub use request::{ControlSetup, Direction, Recipient, RequestType, get_descriptor, request_type};
pub use strings::{decode_string_descriptor, parse_language_ids, utf16_to_ascii_lossy};
