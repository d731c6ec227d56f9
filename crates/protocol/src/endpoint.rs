//! Decoded view of an endpoint descriptor

use crate::descriptors::EndpointDescriptor;
use crate::request::Direction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transfer type, bits 0-1 of `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Isochronous synchronisation type, bits 2-3 of `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Synchronisation {
    None,
    Asynchronous,
    Adaptive,
    Synchronous,
}

/// Isochronous usage type, bits 4-5 of `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Usage {
    Data,
    Feedback,
    ImplicitFeedback,
    Reserved,
}

/// Endpoint descriptor with its bit fields decoded
///
/// Always recomputable from the raw descriptor; holds no state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub direction: Direction,
    /// Endpoint number without the direction bit (0-15)
    pub number: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    /// Polling interval. Frames for full speed, `2^(interval-1)` microframes
    /// for high speed. Ignored for bulk and control endpoints.
    pub interval: u8,
    /// Only meaningful for isochronous endpoints
    pub synchronisation: Synchronisation,
    /// Only meaningful for isochronous endpoints
    pub usage: Usage,
}

impl From<&EndpointDescriptor> for EndpointInfo {
    fn from(desc: &EndpointDescriptor) -> Self {
        let transfer_type = match desc.attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        };
        let synchronisation = match (desc.attributes >> 2) & 0x03 {
            0 => Synchronisation::None,
            1 => Synchronisation::Asynchronous,
            2 => Synchronisation::Adaptive,
            _ => Synchronisation::Synchronous,
        };
        let usage = match (desc.attributes >> 4) & 0x03 {
            0 => Usage::Data,
            1 => Usage::Feedback,
            2 => Usage::ImplicitFeedback,
            _ => Usage::Reserved,
        };

        Self {
            direction: Direction::from_bit(desc.address),
            number: desc.address & 0x0F,
            transfer_type,
            max_packet_size: desc.max_packet_size,
            interval: desc.interval,
            synchronisation,
            usage,
        }
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.transfer_type {
            TransferType::Control => "Control",
            TransferType::Isochronous => "Isochronous",
            TransferType::Bulk => "Bulk",
            TransferType::Interrupt => "Interrupt",
        };
        let direction = match self.direction {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };
        write!(
            f,
            "#{} {} {} Max Packet Size: {} Interval: {}",
            self.number, kind, direction, self.max_packet_size, self.interval
        )?;

        if self.transfer_type == TransferType::Isochronous {
            let sync = match self.synchronisation {
                Synchronisation::None => "No Sync",
                Synchronisation::Asynchronous => "Async",
                Synchronisation::Adaptive => "Adaptive",
                Synchronisation::Synchronous => "Sync",
            };
            let usage = match self.usage {
                Usage::Data => "Data",
                Usage::Feedback => "Feedback",
                Usage::ImplicitFeedback => "Implicit Feedback",
                Usage::Reserved => "Reserved",
            };
            write!(f, " {}, {}", sync, usage)?;
        }
        Ok(())
    }
}
