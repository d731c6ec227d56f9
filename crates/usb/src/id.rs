//! Device identity and enumeration summaries

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque platform locator for a device
///
/// Only ever compared and looked up, never used for I/O directly. The libusb
/// backend uses the port path, e.g. `"1-4.2"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(locator: &str) -> Self {
        Self(locator.to_string())
    }
}

/// What enumeration reports about one device
///
/// Strings are best effort and empty when the device could not be asked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:04x}:{:04x}",
            self.id, self.vendor_id, self.product_id
        )?;
        if !self.manufacturer.is_empty() {
            write!(f, " {}", self.manufacturer)?;
        }
        if !self.product.is_empty() {
            write!(f, " {}", self.product)?;
        }
        Ok(())
    }
}

/// Bus speed the device negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Speed {
    Unknown,
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    Full,
    /// 480 Mbit/s
    High,
    /// 5 Gbit/s
    Super,
    /// 10 Gbit/s
    SuperPlus,
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Speed::Unknown => "unknown",
            Speed::Low => "low",
            Speed::Full => "full",
            Speed::High => "high",
            Speed::Super => "super",
            Speed::SuperPlus => "super+",
        };
        f.write_str(name)
    }
}
