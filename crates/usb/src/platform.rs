//! Platform adapter contract
//!
//! A backend implements these primitives once per operating system. Everything
//! else (descriptor caching, string helpers, isochronous scheduling) is built
//! on top of them in [`crate::device`] and [`crate::iso_stream`].

use crate::error::{Error, Result};
use crate::id::{DeviceId, DeviceInfo, Speed};
use crate::iso_buffer::IsoBuffer;
use crate::transfer::Completion;
use protocol::{ControlSetup, Direction};
use std::sync::Arc;

/// Synchronous control transfers on the default pipe
///
/// Shared by opened devices and by the short-lived handles enumeration uses
/// to read strings, so the descriptor helpers in [`crate::requests`] work for
/// both.
pub trait ControlPipe {
    /// Run a device-to-host request, returning the bytes actually read
    ///
    /// `setup.length` bytes are requested. Fewer may come back.
    fn control_in(&self, setup: ControlSetup) -> Result<Vec<u8>>;

    /// Run a host-to-device request, returning the number of bytes accepted
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize>;
}

/// Outcome of an isochronous submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoSubmit {
    Submitted,
    /// The requested start frame has already gone by
    TooOld,
}

/// One opened device as seen by a backend
pub trait PlatformDevice: ControlPipe + Send + Sync {
    /// Release every interface and the device itself. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    fn speed(&self) -> Speed;

    /// Start an asynchronous control IN transfer, resolving `completion` from
    /// the device's event thread
    fn submit_control_in(&self, setup: ControlSetup, completion: Completion<Vec<u8>>)
    -> Result<()>;

    /// Start an asynchronous control OUT transfer
    fn submit_control_out(
        &self,
        setup: ControlSetup,
        data: Vec<u8>,
        completion: Completion<usize>,
    ) -> Result<()> {
        let _ = (setup, data, completion);
        Err(Error::UnsupportedOperation)
    }

    /// Full configuration descriptor stream of configuration `index`
    fn raw_configuration(&self, index: u8) -> Result<Vec<u8>>;

    /// Allocate a buffer for an isochronous endpoint of an opened interface
    fn create_iso_buffer(
        &self,
        direction: Direction,
        interface: u8,
        endpoint: u8,
        num_frames: usize,
        bytes_per_frame: usize,
    ) -> Result<IsoBuffer>;

    /// Queue `buffer` to start at bus frame `frame`
    ///
    /// Returns [`IsoSubmit::TooOld`] without consuming anything when `frame`
    /// has already elapsed. `completion` is resolved with the number of bytes
    /// moved once every frame of the buffer has been serviced.
    fn submit_iso(
        &self,
        buffer: &IsoBuffer,
        frame: u64,
        completion: Completion<usize>,
    ) -> Result<IsoSubmit>;

    /// Current bus frame number
    fn bus_frame_number(&self) -> Result<u64>;

    fn num_interfaces(&self) -> u8;

    /// Select an alternate setting; the interface's pipes change with it
    fn set_alternate(&self, interface: u8, alternate_setting: u8) -> Result<()>;

    /// Endpoint addresses currently reachable on an interface
    fn pipes(&self, interface: u8) -> Result<Vec<u8>>;
}

/// A device discovery backend
pub trait Platform: Send + Sync {
    /// Every USB device that could be queried. Per-device failures are
    /// skipped; only a failure to reach the device tree is an error.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Open a device, select its first configuration and claim every interface
    ///
    /// Partial acquisition is undone before an error is returned.
    fn open(&self, id: &DeviceId) -> Result<Arc<dyn PlatformDevice>>;
}
