//! Standard descriptor requests
//!
//! Written once against [`ControlPipe`] so opened devices and enumeration
//! share them.

use crate::error::{Error, Result};
use crate::platform::ControlPipe;
use protocol::constants::DESCRIPTOR_HEADER_SIZE;
use protocol::{
    DescriptorError, DescriptorType, DeviceDescriptor, decode_string_descriptor, get_descriptor,
    parse_device_descriptor, parse_language_ids, utf16_to_ascii_lossy,
};
use tracing::debug;

/// Read a complete descriptor
///
/// First reads the two byte header to learn `bLength`, then reads exactly that
/// many bytes. A byte count that differs from what was asked for at either
/// step is an error.
pub fn read_descriptor(
    pipe: &dyn ControlPipe,
    descriptor_type: DescriptorType,
    index: u8,
    language_id: u16,
) -> Result<Vec<u8>> {
    let header = pipe.control_in(get_descriptor(
        descriptor_type,
        index,
        language_id,
        DESCRIPTOR_HEADER_SIZE as u16,
    ))?;
    if header.len() != DESCRIPTOR_HEADER_SIZE {
        return Err(Error::ShortTransfer {
            expected: DESCRIPTOR_HEADER_SIZE,
            actual: header.len(),
        });
    }

    let length = header[0] as usize;
    if length < DESCRIPTOR_HEADER_SIZE {
        return Err(DescriptorError::Malformed {
            descriptor_type: header[1],
            length,
        }
        .into());
    }

    let data = pipe.control_in(get_descriptor(
        descriptor_type,
        index,
        language_id,
        length as u16,
    ))?;
    if data.len() != length {
        return Err(Error::ShortTransfer {
            expected: length,
            actual: data.len(),
        });
    }

    debug!(
        "Read {:?} descriptor {} ({} bytes)",
        descriptor_type, index, length
    );
    Ok(data)
}

/// Read and decode the device descriptor
pub fn read_device_descriptor(pipe: &dyn ControlPipe) -> Result<DeviceDescriptor> {
    let data = read_descriptor(pipe, DescriptorType::Device, 0, 0)?;
    Ok(parse_device_descriptor(&data)?)
}

/// Language ids supported for string descriptors
pub fn language_ids(pipe: &dyn ControlPipe) -> Result<Vec<u16>> {
    let data = read_descriptor(pipe, DescriptorType::String, 0, 0)?;
    Ok(parse_language_ids(&data)?)
}

fn string_units(pipe: &dyn ControlPipe, index: u8, language_id: u16) -> Result<Vec<u16>> {
    if index == 0 {
        return Err(Error::InvalidArgument(
            "string index 0 holds the language id list".to_string(),
        ));
    }
    let data = read_descriptor(pipe, DescriptorType::String, index, language_id)?;
    Ok(decode_string_descriptor(&data))
}

/// Read string descriptor `index` in `language_id`
pub fn string_descriptor(pipe: &dyn ControlPipe, index: u8, language_id: u16) -> Result<String> {
    let units = string_units(pipe, index, language_id)?;
    Ok(String::from_utf16_lossy(&units))
}

/// Read string descriptor `index`, replacing non-ASCII characters with `?`
pub fn string_descriptor_ascii(
    pipe: &dyn ControlPipe,
    index: u8,
    language_id: u16,
) -> Result<String> {
    let units = string_units(pipe, index, language_id)?;
    Ok(utf16_to_ascii_lossy(&units))
}
