//! libusb platform backend
//!
//! Built on rusb. Enumeration uses one shared context; every opened device
//! gets a context of its own plus an event thread that delivers its
//! asynchronous completions.
//!
//! libusb cannot start an isochronous transfer at a given bus frame and does
//! not expose the frame counter, so this backend emulates the frame clock at
//! one frame per millisecond since open. Transfers whose start frame has not
//! passed are queued behind the ones already pending.

mod device;
mod discovery;
mod transfers;

pub use device::LibusbDevice;

use crate::error::{Error, Result};
use crate::id::{DeviceId, DeviceInfo};
use crate::platform::{Platform, PlatformDevice};
use rusb::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Device discovery and access through libusb
pub struct LibusbPlatform {
    context: Context,
    timeout: Duration,
}

impl LibusbPlatform {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: Context::new()?,
            timeout: Duration::ZERO,
        })
    }

    /// Timeout for control and isochronous transfers; zero waits forever
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Platform for LibusbPlatform {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        discovery::enumerate(&self.context, self.timeout)
    }

    fn open(&self, id: &DeviceId) -> Result<Arc<dyn PlatformDevice>> {
        let context = Context::new()?;
        let device = discovery::find(&context, id)?.ok_or(Error::NotFound)?;
        debug!(
            "Found {} at bus {} address {}",
            id,
            device.bus_number(),
            device.address()
        );
        let device = LibusbDevice::open(&context, device, id.clone(), self.timeout)?;
        Ok(Arc::new(device))
    }
}
