//! Standard USB descriptors and the configuration stream parser
//!
//! Descriptors are length-type-value records (USB 2.0 §9.6). A configuration
//! descriptor returned by a device is followed by its interface, endpoint and
//! any class or vendor specific descriptors, all packed back to back. This
//! module decodes those bytes into a tree of plain data.

use crate::constants::{
    CONFIGURATION_DESCRIPTOR_SIZE, DESCRIPTOR_HEADER_SIZE, DEVICE_DESCRIPTOR_SIZE,
    ENDPOINT_DESCRIPTOR_SIZE, INTERFACE_DESCRIPTOR_SIZE, descriptor_type,
};
use crate::error::{DescriptorError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Descriptor types understood by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DescriptorType {
    Device = descriptor_type::DEVICE,
    Configuration = descriptor_type::CONFIGURATION,
    String = descriptor_type::STRING,
    Interface = descriptor_type::INTERFACE,
    Endpoint = descriptor_type::ENDPOINT,
    DeviceQualifier = descriptor_type::DEVICE_QUALIFIER,
    OtherSpeedConfiguration = descriptor_type::OTHER_SPEED_CONFIGURATION,
    InterfacePower = descriptor_type::INTERFACE_POWER,
}

impl DescriptorType {
    /// The `bDescriptorType` value
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Standard device descriptor plus every configuration read from the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB specification release in BCD (e.g. 0x0200)
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    /// Maximum packet size of the default control pipe
    pub max_control_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number in BCD
    pub device_release: u16,
    /// String indices, 0 meaning "no string"
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    /// Configuration count as reported by the device
    pub num_configurations: u8,
    /// Parsed configurations. Only the first one is ever selected.
    pub configurations: Vec<ConfigurationDescriptor>,
}

/// A configuration and its interfaces, in descriptor stream order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// Interface count as reported by the device. Alternate settings mean this
    /// is not necessarily `interfaces.len()`.
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    /// Maximum power in 2 mA units
    pub max_power: u8,
    /// Interfaces and their alternate settings
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// One alternate setting of an interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    /// Endpoint count as reported by the device
    pub num_endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Raw standard endpoint descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl DeviceDescriptor {
    /// The configuration the device is opened with
    pub fn first_configuration(&self) -> Option<&ConfigurationDescriptor> {
        self.configurations.first()
    }
}

impl ConfigurationDescriptor {
    /// Find a specific alternate setting of an interface
    pub fn interface(&self, number: u8, alternate_setting: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|i| i.number == number && i.alternate_setting == alternate_setting)
    }

    /// All alternate settings sharing an interface number
    pub fn alternate_settings(&self, number: u8) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.interfaces.iter().filter(move |i| i.number == number)
    }

    /// Distinct interface numbers in the order they first appear
    ///
    /// Alternate settings of different interfaces may be interleaved, so
    /// this is not a plain `dedup` of the record stream.
    pub fn interface_numbers(&self) -> Vec<u8> {
        let mut numbers = Vec::new();
        for interface in &self.interfaces {
            if !numbers.contains(&interface.number) {
                numbers.push(interface.number);
            }
        }
        numbers
    }

    /// Find an endpoint by address in any alternate setting of an interface
    pub fn find_endpoint(&self, number: u8, address: u8) -> Option<&EndpointDescriptor> {
        self.alternate_settings(number)
            .flat_map(|i| i.endpoints.iter())
            .find(|e| e.address == address)
    }
}

fn expect_size(descriptor_type: u8, length: usize, expected: usize) -> Result<()> {
    if length != expected {
        return Err(DescriptorError::Malformed {
            descriptor_type,
            length,
        });
    }
    Ok(())
}

/// Parse a standalone device descriptor
///
/// The input must be exactly one 18 byte device descriptor.
pub fn parse_device_descriptor(data: &[u8]) -> Result<DeviceDescriptor> {
    expect_size(
        data.get(1).copied().unwrap_or(0),
        data.len(),
        DEVICE_DESCRIPTOR_SIZE,
    )?;
    if data[1] != descriptor_type::DEVICE || data[0] as usize != DEVICE_DESCRIPTOR_SIZE {
        return Err(DescriptorError::Malformed {
            descriptor_type: data[1],
            length: data[0] as usize,
        });
    }

    Ok(DeviceDescriptor {
        bcd_usb: LittleEndian::read_u16(&data[2..4]),
        device_class: data[4],
        device_sub_class: data[5],
        device_protocol: data[6],
        max_control_packet_size: data[7],
        vendor_id: LittleEndian::read_u16(&data[8..10]),
        product_id: LittleEndian::read_u16(&data[10..12]),
        device_release: LittleEndian::read_u16(&data[12..14]),
        manufacturer_index: data[14],
        product_index: data[15],
        serial_index: data[16],
        num_configurations: data[17],
        configurations: Vec::new(),
    })
}

/// Parse a configuration descriptor stream
///
/// Walks the length-type-value records in order:
/// - the configuration record fills in the configuration fields,
/// - each interface record starts a new entry in `interfaces`,
/// - each endpoint record is appended to the most recent interface,
/// - any other record (class or vendor specific) is skipped by its length.
///
/// A record whose declared length runs past the end of `data` ends the walk and
/// whatever was parsed so far is returned, so truncated captures still decode.
/// A zero length record is rejected because it would never advance.
///
/// Declared counts (`bNumInterfaces`, `bNumEndpoints`) are kept as reported and
/// not checked against what was parsed.
pub fn parse_configuration(data: &[u8]) -> Result<ConfigurationDescriptor> {
    let mut configuration: Option<ConfigurationDescriptor> = None;
    let mut interfaces: Vec<InterfaceDescriptor> = Vec::new();

    let mut offset = 0;
    while offset + DESCRIPTOR_HEADER_SIZE <= data.len() {
        let length = data[offset] as usize;
        let kind = data[offset + 1];

        if length == 0 {
            return Err(DescriptorError::ZeroLength { offset });
        }
        if offset + length > data.len() {
            break;
        }

        let record = &data[offset..offset + length];
        match kind {
            descriptor_type::CONFIGURATION => {
                expect_size(kind, length, CONFIGURATION_DESCRIPTOR_SIZE)?;
                // record[2..4] is wTotalLength, which the caller already used
                // to size `data`.
                configuration = Some(ConfigurationDescriptor {
                    num_interfaces: record[4],
                    configuration_value: record[5],
                    configuration_index: record[6],
                    attributes: record[7],
                    max_power: record[8],
                    interfaces: Vec::new(),
                });
            }
            descriptor_type::INTERFACE => {
                expect_size(kind, length, INTERFACE_DESCRIPTOR_SIZE)?;
                interfaces.push(InterfaceDescriptor {
                    number: record[2],
                    alternate_setting: record[3],
                    num_endpoints: record[4],
                    class: record[5],
                    sub_class: record[6],
                    protocol: record[7],
                    interface_index: record[8],
                    endpoints: Vec::new(),
                });
            }
            descriptor_type::ENDPOINT => {
                expect_size(kind, length, ENDPOINT_DESCRIPTOR_SIZE)?;
                let endpoint = EndpointDescriptor {
                    address: record[2],
                    attributes: record[3],
                    max_packet_size: LittleEndian::read_u16(&record[4..6]),
                    interval: record[6],
                };
                interfaces
                    .last_mut()
                    .ok_or(DescriptorError::EndpointBeforeInterface)?
                    .endpoints
                    .push(endpoint);
            }
            _ => {}
        }

        offset += length;
    }

    let mut configuration = configuration.ok_or(DescriptorError::MissingConfiguration)?;
    configuration.interfaces = interfaces;
    Ok(configuration)
}

/// Total length of a configuration stream as declared by its first record
///
/// Used when fetching a configuration in two steps: first the 9 byte header,
/// then `wTotalLength` bytes.
pub fn configuration_total_length(header: &[u8]) -> Result<u16> {
    if header.len() < CONFIGURATION_DESCRIPTOR_SIZE
        || header[1] != descriptor_type::CONFIGURATION
    {
        return Err(DescriptorError::Malformed {
            descriptor_type: header.get(1).copied().unwrap_or(0),
            length: header.len(),
        });
    }
    Ok(LittleEndian::read_u16(&header[2..4]))
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-- Device --")?;
        writeln!(f, "bcdUSB: {:#06x}", self.bcd_usb)?;
        writeln!(f, "bDeviceClass: {}", self.device_class)?;
        writeln!(f, "bDeviceSubClass: {}", self.device_sub_class)?;
        writeln!(f, "bDeviceProtocol: {}", self.device_protocol)?;
        writeln!(f, "bMaxPacketSize0: {}", self.max_control_packet_size)?;
        writeln!(f, "idVendor: {:#06x}", self.vendor_id)?;
        writeln!(f, "idProduct: {:#06x}", self.product_id)?;
        writeln!(f, "bcdDevice: {:#06x}", self.device_release)?;
        writeln!(f, "iManufacturer: {}", self.manufacturer_index)?;
        writeln!(f, "iProduct: {}", self.product_index)?;
        writeln!(f, "iSerialNumber: {}", self.serial_index)?;
        writeln!(f, "bNumConfigurations: {}", self.num_configurations)?;
        for configuration in &self.configurations {
            write!(f, "{}", configuration)?;
        }
        Ok(())
    }
}

impl fmt::Display for ConfigurationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-- Configuration --")?;
        writeln!(f, "bNumInterfaces: {}", self.num_interfaces)?;
        writeln!(f, "bConfigurationValue: {}", self.configuration_value)?;
        writeln!(f, "iConfiguration: {}", self.configuration_index)?;
        writeln!(f, "bmAttributes: {:#04x}", self.attributes)?;
        writeln!(f, "bMaxPower: {} ({} mA)", self.max_power, self.max_power as u32 * 2)?;
        for interface in &self.interfaces {
            write!(f, "{}", interface)?;
        }
        Ok(())
    }
}

impl fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "    -- Interface --")?;
        writeln!(f, "    bInterfaceNumber:   {}", self.number)?;
        writeln!(f, "    bAlternateSetting:  {}", self.alternate_setting)?;
        writeln!(f, "    bNumEndpoints:      {}", self.num_endpoints)?;
        writeln!(f, "    bInterfaceClass:    {:#04x}", self.class)?;
        writeln!(f, "    bInterfaceSubClass: {:#04x}", self.sub_class)?;
        writeln!(f, "    bInterfaceProtocol: {:#04x}", self.protocol)?;
        writeln!(f, "    iInterface:         {}", self.interface_index)?;
        for endpoint in &self.endpoints {
            write!(f, "{}", endpoint)?;
        }
        Ok(())
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "        -- Endpoint --")?;
        writeln!(f, "        bEndpointAddress: {:#04x}", self.address)?;
        writeln!(f, "        bmAttributes:     {:#04x}", self.attributes)?;
        writeln!(f, "        wMaxPacketSize:   {}", self.max_packet_size)?;
        writeln!(f, "        bInterval:        {}", self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_header(total_length: u16, num_interfaces: u8, value: u8) -> Vec<u8> {
        let [lo, hi] = total_length.to_le_bytes();
        vec![9, 0x02, lo, hi, num_interfaces, value, 0, 0x80, 50]
    }

    #[test]
    fn test_parse_device_descriptor() {
        let bytes = [
            18, 0x01, 0x00, 0x02, 0xEF, 0x02, 0x01, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2,
            3, 1,
        ];
        let desc = parse_device_descriptor(&bytes).unwrap();
        assert_eq!(desc.bcd_usb, 0x0200);
        assert_eq!(desc.device_class, 0xEF);
        assert_eq!(desc.max_control_packet_size, 64);
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id, 0x5678);
        assert_eq!(desc.device_release, 0x0100);
        assert_eq!(desc.serial_index, 3);
        assert_eq!(desc.num_configurations, 1);
        assert!(desc.configurations.is_empty());
    }

    #[test]
    fn test_parse_device_descriptor_wrong_size() {
        let err = parse_device_descriptor(&[17, 0x01, 0x00]).unwrap_err();
        assert_eq!(
            err,
            DescriptorError::Malformed {
                descriptor_type: 0x01,
                length: 3
            }
        );
    }

    #[test]
    fn test_configuration_only() {
        let desc = parse_configuration(&config_header(9, 0, 3)).unwrap();
        assert_eq!(desc.configuration_value, 3);
        assert_eq!(desc.max_power, 50);
        assert!(desc.interfaces.is_empty());
    }

    #[test]
    fn test_missing_configuration() {
        let bytes = [9, 0x04, 0, 0, 0, 0xFF, 0, 0, 0];
        assert_eq!(
            parse_configuration(&bytes).unwrap_err(),
            DescriptorError::MissingConfiguration
        );
    }

    #[test]
    fn test_wrong_configuration_size() {
        let bytes = [8, 0x02, 8, 0, 0, 1, 0, 0x80];
        assert_eq!(
            parse_configuration(&bytes).unwrap_err(),
            DescriptorError::Malformed {
                descriptor_type: 0x02,
                length: 8
            }
        );
    }

    #[test]
    fn test_zero_length_record_is_rejected() {
        let mut bytes = config_header(11, 0, 1);
        bytes.extend_from_slice(&[0, 0x24]);
        assert_eq!(
            parse_configuration(&bytes).unwrap_err(),
            DescriptorError::ZeroLength { offset: 9 }
        );
    }

    #[test]
    fn test_unknown_records_are_skipped() {
        let mut bytes = config_header(0, 1, 1);
        bytes.extend_from_slice(&[9, 0x04, 0, 0, 1, 0x01, 0x02, 0, 0]);
        // Class specific audio descriptor between interface and endpoint.
        bytes.extend_from_slice(&[5, 0x24, 0x01, 0x00, 0x01]);
        bytes.extend_from_slice(&[7, 0x05, 0x01, 0x05, 0xC0, 0x00, 1]);
        let desc = parse_configuration(&bytes).unwrap();
        assert_eq!(desc.interfaces.len(), 1);
        assert_eq!(desc.interfaces[0].endpoints.len(), 1);
        assert_eq!(desc.interfaces[0].endpoints[0].max_packet_size, 192);
    }

    #[test]
    fn test_trailing_single_byte_ignored() {
        let mut bytes = config_header(10, 0, 1);
        bytes.push(0x07);
        assert!(parse_configuration(&bytes).is_ok());
    }

    #[test]
    fn test_configuration_total_length() {
        assert_eq!(
            configuration_total_length(&config_header(0x0123, 2, 1)).unwrap(),
            0x0123
        );
        assert!(configuration_total_length(&[9, 0x02, 0]).is_err());
    }

    #[test]
    fn test_display_tree_layout() {
        let mut bytes = config_header(0, 1, 1);
        bytes.extend_from_slice(&[9, 0x04, 0, 0, 1, 0xFF, 0, 0, 0]);
        bytes.extend_from_slice(&[7, 0x05, 0x81, 0x02, 0x00, 0x02, 0]);
        let device = DeviceDescriptor {
            num_configurations: 1,
            configurations: vec![parse_configuration(&bytes).unwrap()],
            ..Default::default()
        };
        let text = device.to_string();
        assert!(text.starts_with("-- Device --\n"));
        assert!(text.contains("-- Configuration --"));
        assert!(text.contains("    -- Interface --"));
        assert!(text.contains("        bEndpointAddress: 0x81"));
    }

    #[test]
    fn test_find_endpoint_across_alternates() {
        let mut bytes = config_header(0, 1, 1);
        bytes.extend_from_slice(&[9, 0x04, 1, 0, 0, 0x01, 0x02, 0, 0]);
        bytes.extend_from_slice(&[9, 0x04, 1, 1, 1, 0x01, 0x02, 0, 0]);
        bytes.extend_from_slice(&[7, 0x05, 0x01, 0x05, 0xC0, 0x00, 1]);
        let desc = parse_configuration(&bytes).unwrap();
        assert_eq!(desc.alternate_settings(1).count(), 2);
        assert!(desc.interface(1, 1).is_some());
        assert_eq!(desc.find_endpoint(1, 0x01).unwrap().max_packet_size, 192);
        assert!(desc.find_endpoint(0, 0x01).is_none());
    }

    #[test]
    fn test_interface_numbers_with_interleaved_alternates() {
        let mut bytes = config_header(0, 2, 1);
        bytes.extend_from_slice(&[9, 0x04, 0, 0, 0, 0x01, 0x01, 0, 0]);
        bytes.extend_from_slice(&[9, 0x04, 1, 0, 0, 0x01, 0x02, 0, 0]);
        bytes.extend_from_slice(&[9, 0x04, 0, 1, 0, 0x01, 0x01, 0, 0]);
        bytes.extend_from_slice(&[9, 0x04, 1, 1, 0, 0x01, 0x02, 0, 0]);
        let desc = parse_configuration(&bytes).unwrap();
        assert_eq!(desc.interfaces.len(), 4);
        assert_eq!(desc.interface_numbers(), vec![0, 1]);
    }
}
