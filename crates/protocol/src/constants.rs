//! Numeric constants from chapter 9 of the USB 2.0 specification
//!
//! Descriptor type codes come from Table 9-5, request codes from Table 9-4 and
//! the fixed descriptor sizes from Tables 9-8, 9-10, 9-12 and 9-13.

/// Descriptor type codes (`bDescriptorType`)
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const DEVICE_QUALIFIER: u8 = 0x06;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 0x07;
    pub const INTERFACE_POWER: u8 = 0x08;
}

/// Standard request codes (`bRequest`)
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
}

/// Size of the `(bLength, bDescriptorType)` header shared by every descriptor
pub const DESCRIPTOR_HEADER_SIZE: usize = 2;

/// Size of a standard device descriptor
pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;

/// Size of a standard configuration descriptor (without its children)
pub const CONFIGURATION_DESCRIPTOR_SIZE: usize = 9;

/// Size of a standard interface descriptor
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 9;

/// Size of a standard endpoint descriptor
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 7;

/// Size of a control transfer setup packet
pub const SETUP_PACKET_SIZE: usize = 8;
