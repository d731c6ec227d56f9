//! Control transfer setup packets
//!
//! `bmRequestType` is built from a [`Direction`], a [`RequestType`] and a
//! [`Recipient`]; the remaining fields go on the wire little-endian.

use crate::constants::{SETUP_PACKET_SIZE, request};
use crate::descriptors::DescriptorType;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Transfer direction from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Host to device
    Out = 0x00,
    /// Device to host
    In = 0x80,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or `bmRequestType`
    pub fn from_bit(value: u8) -> Self {
        if value & 0x80 == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }
}

/// Request recipient (`bmRequestType` bits 0-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Recipient {
    Device = 0x00,
    Interface = 0x01,
    Endpoint = 0x02,
    Other = 0x03,
}

/// Request type (`bmRequestType` bits 5-6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0x00,
    Class = 0x20,
    Vendor = 0x40,
}

/// Combine direction, type and recipient into `bmRequestType`
pub fn request_type(direction: Direction, kind: RequestType, recipient: Recipient) -> u8 {
    direction as u8 | kind as u8 | recipient as u8
}

/// The eight fields of a control setup stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// Device-to-host request reading `length` bytes
    pub fn in_request(
        recipient: Recipient,
        kind: RequestType,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: request_type(Direction::In, kind, recipient),
            request,
            value,
            index,
            length,
        }
    }

    /// Host-to-device request writing `length` bytes
    pub fn out_request(
        recipient: Recipient,
        kind: RequestType,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: request_type(Direction::Out, kind, recipient),
            request,
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit(self.request_type)
    }

    /// Encode as the 8 byte setup packet
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut bytes = [0u8; SETUP_PACKET_SIZE];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        LittleEndian::write_u16(&mut bytes[2..4], self.value);
        LittleEndian::write_u16(&mut bytes[4..6], self.index);
        LittleEndian::write_u16(&mut bytes[6..8], self.length);
        bytes
    }

    /// Decode an 8 byte setup packet
    pub fn from_bytes(bytes: &[u8; SETUP_PACKET_SIZE]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        }
    }
}

/// Standard GET_DESCRIPTOR request
///
/// `wValue` carries the type in the high byte and the index in the low byte;
/// `wIndex` carries the language id for string descriptors and 0 otherwise.
pub fn get_descriptor(
    descriptor_type: DescriptorType,
    index: u8,
    language_id: u16,
    length: u16,
) -> ControlSetup {
    ControlSetup::in_request(
        Recipient::Device,
        RequestType::Standard,
        request::GET_DESCRIPTOR,
        ((descriptor_type.code() as u16) << 8) | index as u16,
        language_id,
        length,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_bits() {
        assert_eq!(
            request_type(Direction::In, RequestType::Standard, Recipient::Device),
            0x80
        );
        assert_eq!(
            request_type(Direction::Out, RequestType::Vendor, Recipient::Interface),
            0x41
        );
        assert_eq!(
            request_type(Direction::In, RequestType::Class, Recipient::Endpoint),
            0xA2
        );
    }

    #[test]
    fn test_get_descriptor_setup_bytes() {
        let setup = get_descriptor(DescriptorType::String, 2, 0x0409, 255);
        assert_eq!(
            setup.to_bytes(),
            [0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xFF, 0x00]
        );
        assert_eq!(setup.direction(), Direction::In);
    }

    #[test]
    fn test_setup_from_bytes() {
        let setup = ControlSetup::from_bytes(&[0x21, 0x0A, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(setup.request, 0x0A);
        assert_eq!(setup.index, 1);
        assert_eq!(setup.direction(), Direction::Out);
    }
}
