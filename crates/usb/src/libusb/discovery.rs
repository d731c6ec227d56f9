//! Device enumeration through libusb

use super::device::HandlePipe;
use crate::discovery::describe_all;
use crate::error::Result;
use crate::id::{DeviceId, DeviceInfo};
use crate::platform::ControlPipe;
use crate::requests;
use rusb::{Context, UsbContext};
use std::time::Duration;
use tracing::debug;

/// Port path locator such as `"1-4.2"`
pub(crate) fn device_id(device: &rusb::Device<Context>) -> DeviceId {
    let ports = device.port_numbers().unwrap_or_default();
    let path = if ports.is_empty() {
        "0".to_string()
    } else {
        ports
            .iter()
            .map(|port| port.to_string())
            .collect::<Vec<_>>()
            .join(".")
    };
    DeviceId(format!("{}-{}", device.bus_number(), path))
}

/// Every device that can be described; the rest are skipped with a warning
pub(crate) fn enumerate(context: &Context, timeout: Duration) -> Result<Vec<DeviceInfo>> {
    let devices = context.devices()?;
    Ok(describe_all(devices.iter(), device_id, |device| {
        describe(device, timeout)
    }))
}

/// Look a device up by its locator
pub(crate) fn find(context: &Context, id: &DeviceId) -> Result<Option<rusb::Device<Context>>> {
    Ok(context
        .devices()?
        .iter()
        .find(|device| &device_id(device) == id))
}

fn describe(device: &rusb::Device<Context>, timeout: Duration) -> Result<DeviceInfo> {
    let descriptor = device.device_descriptor()?;
    let mut info = DeviceInfo {
        id: device_id(device),
        manufacturer: String::new(),
        product: String::new(),
        serial: String::new(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
    };

    // Strings are best effort: devices we may not open still get listed.
    match device.open() {
        Ok(handle) => {
            let pipe = HandlePipe::new(&handle, timeout);
            read_strings(&pipe, &descriptor, &mut info);
        }
        Err(e) => debug!("Cannot open {} to read strings: {}", info.id, e),
    }
    Ok(info)
}

fn read_strings(pipe: &dyn ControlPipe, descriptor: &rusb::DeviceDescriptor, info: &mut DeviceInfo) {
    let language_id = match requests::language_ids(pipe) {
        Ok(ids) => match ids.first() {
            Some(&id) => id,
            None => return,
        },
        Err(e) => {
            debug!("No language ids on {}: {}", info.id, e);
            return;
        }
    };

    let read = |index: Option<u8>| {
        index
            .and_then(|index| requests::string_descriptor_ascii(pipe, index, language_id).ok())
            .unwrap_or_default()
    };
    info.manufacturer = read(descriptor.manufacturer_string_index());
    info.product = read(descriptor.product_string_index());
    info.serial = read(descriptor.serial_number_string_index());
}
