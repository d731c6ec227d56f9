//! USB device transfer engine
//!
//! Discovers USB devices, opens them with every interface of the first
//! configuration claimed, and performs control and isochronous transfers.
//!
//! # Architecture
//!
//! - [`platform`]: the small set of primitives a backend provides
//! - [`libusb`]: the backend used on Linux and macOS
//! - [`device`]: shared logic on top of a backend (descriptor cache, string
//!   helpers, isochronous frame scheduling)
//! - [`transfer`]: handles for asynchronous transfers, completed from the
//!   device's event thread
//! - [`iso_stream`]: gap-free isochronous output
//! - [`device_list`]: incremental device list maintenance for front ends
//!
//! # Example
//!
//! ```no_run
//! use usb::{enumerate, open};
//!
//! for info in enumerate()? {
//!     println!("{}", info);
//! }
//!
//! let device = open(&"1-4.2".into())?;
//! println!("{}", device.descriptors()?);
//! # Ok::<(), usb::Error>(())
//! ```

pub mod device;
pub mod device_list;
pub mod discovery;
pub mod error;
pub mod event_loop;
pub mod id;
pub mod iso_buffer;
pub mod iso_stream;
pub mod libusb;
pub mod platform;
pub mod requests;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfer;
pub mod unwind;

pub use device::{Device, ISO_ASAP_ATTEMPTS};
pub use device_list::{DeviceList, ListChange};
pub use discovery::{enumerate, open, open_with};
pub use error::{Error, Result};
pub use event_loop::EventContext;
pub use id::{DeviceId, DeviceInfo, Speed};
pub use iso_buffer::IsoBuffer;
pub use iso_stream::{FrameWrite, IsochronousStream, StreamConfig};
pub use libusb::LibusbPlatform;
pub use platform::{ControlPipe, IsoSubmit, Platform, PlatformDevice};
pub use transfer::{
    Completion, IsoTransferHandle, Transfer, TransferHandle, TransferStatus, WriteHandle,
    transfer_pair,
};

pub use protocol::{Direction, Recipient, RequestType};
