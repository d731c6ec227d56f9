//! Finding and opening devices

use crate::device::Device;
use crate::error::Result;
use crate::id::{DeviceId, DeviceInfo};
use crate::libusb::LibusbPlatform;
use crate::platform::Platform;
use tracing::{debug, warn};

/// List the USB devices visible through libusb
pub fn enumerate() -> Result<Vec<DeviceInfo>> {
    LibusbPlatform::new()?.enumerate()
}

/// Open a device through libusb
pub fn open(id: &DeviceId) -> Result<Device> {
    open_with(&LibusbPlatform::new()?, id)
}

/// Open a device through any platform backend
///
/// The backend acquires the device and its interfaces; the descriptor tree is
/// then read and cached. Everything acquired is released again if any step
/// fails.
pub fn open_with(platform: &dyn Platform, id: &DeviceId) -> Result<Device> {
    debug!("Opening device {}", id);
    let inner = platform.open(id)?;
    Device::from_platform(id.clone(), inner)
}

/// Describe every candidate device, leaving out the ones that cannot be
/// queried
///
/// A device that fails to answer is logged and skipped; the rest are still
/// reported.
pub(crate) fn describe_all<T>(
    candidates: impl IntoIterator<Item = T>,
    name: impl Fn(&T) -> DeviceId,
    describe: impl Fn(&T) -> Result<DeviceInfo>,
) -> Vec<DeviceInfo> {
    let mut found = Vec::new();
    for candidate in candidates {
        match describe(&candidate) {
            Ok(info) => found.push(info),
            Err(e) => warn!("Skipping device {}: {}", name(&candidate), e),
        }
    }
    debug!("Enumerated {} devices", found.len());
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn info(locator: &str) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId::new(locator),
            manufacturer: String::new(),
            product: String::new(),
            serial: String::new(),
            vendor_id: 0x1209,
            product_id: 0x0001,
        }
    }

    #[test]
    fn test_describe_all_skips_failures() {
        let found = describe_all(
            ["1-1", "1-2", "1-3"],
            |locator| DeviceId::new(*locator),
            |locator| match *locator {
                "1-2" => Err(Error::AccessDenied),
                other => Ok(info(other)),
            },
        );
        let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1-1", "1-3"]);
    }

    #[test]
    fn test_describe_all_with_every_device_failing() {
        let found = describe_all(["1-1"], |l| DeviceId::new(*l), |_| Err(Error::Busy));
        assert!(found.is_empty());
    }
}
