//! Test utilities for the transfer engine
//!
//! Provides a scriptable in-memory [`Platform`] and descriptor byte builders so
//! the shared device layer, the isochronous scheduler and front ends can be
//! tested without hardware.
//!
//! # Example
//!
//! ```
//! use usb::test_utils::{FakeDevice, FakeInterface, FakePlatform};
//! use usb::{DeviceId, open_with};
//!
//! let fake = FakeDevice::builder()
//!     .ids(0x1234, 0x5678)
//!     .strings("Acme", "Widget", "")
//!     .interface(FakeInterface::new(0, 0, 0xFF).endpoint(0x81, 0x02, 512))
//!     .build();
//! let platform = FakePlatform::new();
//! platform.add(DeviceId::new("1-1"), fake);
//!
//! let device = open_with(&platform, &DeviceId::new("1-1")).unwrap();
//! assert_eq!(device.product(0x0409).unwrap(), "Widget");
//! ```

use crate::discovery::describe_all;
use crate::error::{Error, Result};
use crate::id::{DeviceId, DeviceInfo, Speed};
use crate::iso_buffer::IsoBuffer;
use crate::platform::{ControlPipe, IsoSubmit, Platform, PlatformDevice};
use crate::transfer::{Completion, TransferStatus};
use crate::unwind::Unwind;
use protocol::constants::{descriptor_type, request};
use protocol::{
    ConfigurationDescriptor, ControlSetup, Direction, EndpointDescriptor, parse_configuration,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Language id used by the builders (US English)
pub const DEFAULT_LANGUAGE_ID: u16 = 0x0409;

// ============================================================================
// Descriptor byte builders
// ============================================================================

/// An interface alternate setting for [`configuration_bytes`]
#[derive(Debug, Clone)]
pub struct FakeInterface {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl FakeInterface {
    pub fn new(number: u8, alternate_setting: u8, class: u8) -> Self {
        Self {
            number,
            alternate_setting,
            class,
            endpoints: Vec::new(),
        }
    }

    pub fn endpoint(mut self, address: u8, attributes: u8, max_packet_size: u16) -> Self {
        self.endpoints.push(EndpointDescriptor {
            address,
            attributes,
            max_packet_size,
            interval: 1,
        });
        self
    }
}

/// Standard 18 byte device descriptor
pub fn device_descriptor_bytes(
    vendor_id: u16,
    product_id: u16,
    string_indices: [u8; 3],
    num_configurations: u8,
) -> Vec<u8> {
    let [vid_lo, vid_hi] = vendor_id.to_le_bytes();
    let [pid_lo, pid_hi] = product_id.to_le_bytes();
    vec![
        18,
        descriptor_type::DEVICE,
        0x00,
        0x02,
        0,
        0,
        0,
        64,
        vid_lo,
        vid_hi,
        pid_lo,
        pid_hi,
        0x00,
        0x01,
        string_indices[0],
        string_indices[1],
        string_indices[2],
        num_configurations,
    ]
}

/// Configuration stream with a correct `wTotalLength`
pub fn configuration_bytes(configuration_value: u8, interfaces: &[FakeInterface]) -> Vec<u8> {
    let mut numbers: Vec<u8> = Vec::new();
    for interface in interfaces {
        if !numbers.contains(&interface.number) {
            numbers.push(interface.number);
        }
    }

    let mut bytes = vec![
        9,
        descriptor_type::CONFIGURATION,
        0,
        0,
        numbers.len() as u8,
        configuration_value,
        0,
        0x80,
        50,
    ];
    for interface in interfaces {
        bytes.extend_from_slice(&[
            9,
            descriptor_type::INTERFACE,
            interface.number,
            interface.alternate_setting,
            interface.endpoints.len() as u8,
            interface.class,
            0,
            0,
            0,
        ]);
        for endpoint in &interface.endpoints {
            let [lo, hi] = endpoint.max_packet_size.to_le_bytes();
            bytes.extend_from_slice(&[
                7,
                descriptor_type::ENDPOINT,
                endpoint.address,
                endpoint.attributes,
                lo,
                hi,
                endpoint.interval,
            ]);
        }
    }
    let [lo, hi] = (bytes.len() as u16).to_le_bytes();
    bytes[2] = lo;
    bytes[3] = hi;
    bytes
}

/// UTF-16LE string descriptor
pub fn string_bytes(text: &str) -> Vec<u8> {
    let mut bytes = vec![0, descriptor_type::STRING];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes[0] = bytes.len() as u8;
    bytes
}

/// String descriptor zero listing `ids`
pub fn language_id_bytes(ids: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0, descriptor_type::STRING];
    for id in ids {
        bytes.extend_from_slice(&id.to_le_bytes());
    }
    bytes[0] = bytes.len() as u8;
    bytes
}

// ============================================================================
// Fake device
// ============================================================================

#[derive(Default)]
struct FakeState {
    open: bool,
    frame: u64,
    close_count: usize,
    events: Vec<String>,
    control_ins: Vec<ControlSetup>,
    control_outs: Vec<(ControlSetup, Vec<u8>)>,
    pending_control: VecDeque<(ControlSetup, Completion<Vec<u8>>)>,
    pending_iso: VecDeque<(IsoBuffer, Completion<usize>)>,
    iso_submissions: Vec<(u8, u64)>,
    reject_iso: u32,
    auto_complete_iso: bool,
    short_write: Option<usize>,
    alternates: HashMap<u8, u8>,
    /// Error enumeration gets when it asks this device for its identity
    query_error: Option<Error>,
}

/// Scriptable in-memory device
pub struct FakeDevice {
    descriptors: HashMap<(u8, u8), Vec<u8>>,
    configuration: Vec<u8>,
    parsed: ConfigurationDescriptor,
    /// Interface numbers reported when claimed, by position
    reported_interfaces: Vec<u8>,
    speed: Speed,
    manufacturer: String,
    product: String,
    serial: String,
    vendor_id: u16,
    product_id: u16,
    state: Mutex<FakeState>,
}

/// Builder for [`FakeDevice`]
pub struct FakeDeviceBuilder {
    vendor_id: u16,
    product_id: u16,
    strings: [String; 3],
    interfaces: Vec<FakeInterface>,
    reported_interfaces: Option<Vec<u8>>,
    device_descriptor: Option<Vec<u8>>,
    configuration: Option<Vec<u8>>,
    speed: Speed,
}

impl FakeDeviceBuilder {
    pub fn ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }

    /// Manufacturer, product and serial strings; empty means "no string"
    pub fn strings(mut self, manufacturer: &str, product: &str, serial: &str) -> Self {
        self.strings = [
            manufacturer.to_string(),
            product.to_string(),
            serial.to_string(),
        ];
        self
    }

    pub fn interface(mut self, interface: FakeInterface) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Interface numbers the device reports when claimed, overriding the
    /// numbers in its configuration
    pub fn reported_interfaces(mut self, numbers: Vec<u8>) -> Self {
        self.reported_interfaces = Some(numbers);
        self
    }

    /// Serve these bytes as the device descriptor
    pub fn raw_device_descriptor(mut self, bytes: Vec<u8>) -> Self {
        self.device_descriptor = Some(bytes);
        self
    }

    /// Serve these bytes as configuration 0
    pub fn raw_configuration(mut self, bytes: Vec<u8>) -> Self {
        self.configuration = Some(bytes);
        self
    }

    pub fn speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn build(self) -> Arc<FakeDevice> {
        let mut indices = [0u8; 3];
        let mut descriptors = HashMap::new();
        for (slot, text) in self.strings.iter().enumerate() {
            if !text.is_empty() {
                let index = slot as u8 + 1;
                indices[slot] = index;
                descriptors.insert((descriptor_type::STRING, index), string_bytes(text));
            }
        }
        descriptors.insert(
            (descriptor_type::STRING, 0),
            language_id_bytes(&[DEFAULT_LANGUAGE_ID]),
        );
        descriptors.insert(
            (descriptor_type::DEVICE, 0),
            self.device_descriptor.unwrap_or_else(|| {
                device_descriptor_bytes(self.vendor_id, self.product_id, indices, 1)
            }),
        );

        let configuration = self
            .configuration
            .unwrap_or_else(|| configuration_bytes(1, &self.interfaces));
        let parsed = parse_configuration(&configuration).unwrap_or_default();

        let numbers = parsed.interface_numbers();

        let [manufacturer, product, serial] = self.strings;
        Arc::new(FakeDevice {
            descriptors,
            configuration,
            parsed,
            reported_interfaces: self.reported_interfaces.unwrap_or(numbers),
            speed: self.speed,
            manufacturer,
            product,
            serial,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            state: Mutex::new(FakeState::default()),
        })
    }
}

impl FakeDevice {
    pub fn builder() -> FakeDeviceBuilder {
        FakeDeviceBuilder {
            vendor_id: 0x1209,
            product_id: 0x0001,
            strings: Default::default(),
            interfaces: Vec::new(),
            reported_interfaces: None,
            device_descriptor: None,
            configuration: None,
            speed: Speed::Full,
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make enumeration unable to query this device, or able again with `None`
    pub fn set_unqueryable(&self, err: Option<Error>) {
        self.state().query_error = err;
    }

    /// Enumeration's view of the device, failing while it is unqueryable
    pub fn describe(&self, id: DeviceId) -> Result<DeviceInfo> {
        match self.state().query_error.clone() {
            Some(err) => Err(err),
            None => Ok(self.info(id)),
        }
    }

    /// What enumeration reports for this device
    pub fn info(&self, id: DeviceId) -> DeviceInfo {
        DeviceInfo {
            id,
            manufacturer: self.manufacturer.clone(),
            product: self.product.clone(),
            serial: self.serial.clone(),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
        }
    }

    /// Open, claim and release events in the order they happened
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    pub fn set_frame(&self, frame: u64) {
        self.state().frame = frame;
    }

    pub fn advance_frames(&self, frames: u64) {
        self.state().frame += frames;
    }

    /// Reject the next `count` isochronous submissions as too old
    pub fn reject_next_iso(&self, count: u32) {
        self.state().reject_iso = count;
    }

    /// Complete isochronous transfers as soon as they are submitted
    pub fn auto_complete_iso(&self, enabled: bool) {
        self.state().auto_complete_iso = enabled;
    }

    /// Acknowledge only `bytes` of every control OUT
    pub fn short_write(&self, bytes: usize) {
        self.state().short_write = Some(bytes);
    }

    pub fn control_ins(&self) -> Vec<ControlSetup> {
        self.state().control_ins.clone()
    }

    pub fn control_outs(&self) -> Vec<(ControlSetup, Vec<u8>)> {
        self.state().control_outs.clone()
    }

    /// `(endpoint, start frame)` of every accepted isochronous submission
    pub fn iso_submissions(&self) -> Vec<(u8, u64)> {
        self.state().iso_submissions.clone()
    }

    pub fn pending_control(&self) -> usize {
        self.state().pending_control.len()
    }

    pub fn pending_iso(&self) -> usize {
        self.state().pending_iso.len()
    }

    /// Buffer of the `index`th oldest pending isochronous transfer
    pub fn pending_iso_buffer(&self, index: usize) -> Option<IsoBuffer> {
        self.state()
            .pending_iso
            .get(index)
            .map(|(buffer, _)| buffer.clone())
    }

    /// Remove the oldest pending async control transfer without resolving it
    pub fn take_pending_control(&self) -> Option<(ControlSetup, Completion<Vec<u8>>)> {
        self.state().pending_control.pop_front()
    }

    /// Answer the oldest pending async control transfer from the descriptor
    /// table, as the device would have. Returns false if none was pending.
    pub fn complete_next_control(&self) -> bool {
        let Some((setup, completion)) = self.take_pending_control() else {
            return false;
        };
        completion.complete(self.answer(setup));
        true
    }

    /// Resolve the oldest pending isochronous transfer with `status`
    pub fn complete_next_iso(&self, status: TransferStatus) -> bool {
        let Some((buffer, completion)) = self.state().pending_iso.pop_front() else {
            return false;
        };
        finish_iso(&buffer, completion, status);
        true
    }

    fn answer(&self, setup: ControlSetup) -> Result<Vec<u8>> {
        let is_get_descriptor =
            setup.request == request::GET_DESCRIPTOR && setup.request_type == 0x80;
        if !is_get_descriptor {
            return Err(Error::TransferFailed(TransferStatus::Stall));
        }

        let kind = (setup.value >> 8) as u8;
        let index = (setup.value & 0xFF) as u8;
        let bytes = if kind == descriptor_type::CONFIGURATION && index == 0 {
            Some(&self.configuration)
        } else {
            self.descriptors.get(&(kind, index))
        };

        match bytes {
            Some(bytes) => {
                let length = bytes.len().min(setup.length as usize);
                Ok(bytes[..length].to_vec())
            }
            None => Err(Error::TransferFailed(TransferStatus::Stall)),
        }
    }

    fn interface_count(&self) -> u8 {
        self.parsed.interface_numbers().len() as u8
    }

    fn claim_all(&self) -> Result<()> {
        let mut unwind = Unwind::new();
        self.state().events.push("open".to_string());
        unwind.push(|| self.state().events.push("close".to_string()));

        for position in 0..self.interface_count() {
            let reported = self
                .reported_interfaces
                .get(position as usize)
                .copied()
                .unwrap_or(position);
            self.state().events.push(format!("claim {}", reported));
            unwind.push(move || self.state().events.push(format!("release {}", reported)));

            if reported != position {
                return Err(Error::InterfaceNumberMismatch { position, reported });
            }
        }

        unwind.disarm();
        let mut state = self.state();
        state.open = true;
        state.alternates.clear();
        Ok(())
    }
}

fn finish_iso(buffer: &IsoBuffer, completion: Completion<usize>, status: TransferStatus) {
    if status == TransferStatus::Completed {
        buffer.set_frame_lengths(&vec![buffer.bytes_per_frame(); buffer.num_frames()]);
    }
    completion.complete_with_status(status, buffer.len());
}

impl ControlPipe for FakeDevice {
    fn control_in(&self, setup: ControlSetup) -> Result<Vec<u8>> {
        self.state().control_ins.push(setup);
        self.answer(setup)
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize> {
        let mut state = self.state();
        state.control_outs.push((setup, data.to_vec()));
        Ok(state.short_write.unwrap_or(data.len()).min(data.len()))
    }
}

impl PlatformDevice for FakeDevice {
    fn close(&self) {
        let mut state = self.state();
        if state.open {
            state.open = false;
            state.close_count += 1;
            state.events.push("close".to_string());
        }
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn speed(&self) -> Speed {
        self.speed
    }

    fn submit_control_in(
        &self,
        setup: ControlSetup,
        completion: Completion<Vec<u8>>,
    ) -> Result<()> {
        self.state().pending_control.push_back((setup, completion));
        Ok(())
    }

    fn raw_configuration(&self, index: u8) -> Result<Vec<u8>> {
        if index == 0 {
            Ok(self.configuration.clone())
        } else {
            Err(Error::NotFound)
        }
    }

    fn create_iso_buffer(
        &self,
        direction: Direction,
        interface: u8,
        endpoint: u8,
        num_frames: usize,
        bytes_per_frame: usize,
    ) -> Result<IsoBuffer> {
        if !self.pipes(interface)?.contains(&endpoint) {
            return Err(Error::InvalidArgument(format!(
                "endpoint {:#04x} is not available on interface {}",
                endpoint, interface
            )));
        }
        IsoBuffer::new(direction, interface, endpoint, num_frames, bytes_per_frame)
    }

    fn submit_iso(
        &self,
        buffer: &IsoBuffer,
        frame: u64,
        completion: Completion<usize>,
    ) -> Result<IsoSubmit> {
        let mut state = self.state();
        if state.reject_iso > 0 {
            state.reject_iso -= 1;
            return Ok(IsoSubmit::TooOld);
        }
        if frame < state.frame {
            return Ok(IsoSubmit::TooOld);
        }

        state.iso_submissions.push((buffer.endpoint(), frame));
        if state.auto_complete_iso {
            drop(state);
            finish_iso(buffer, completion, TransferStatus::Completed);
        } else {
            state.pending_iso.push_back((buffer.clone(), completion));
        }
        Ok(IsoSubmit::Submitted)
    }

    fn bus_frame_number(&self) -> Result<u64> {
        Ok(self.state().frame)
    }

    fn num_interfaces(&self) -> u8 {
        self.interface_count()
    }

    fn set_alternate(&self, interface: u8, alternate_setting: u8) -> Result<()> {
        if self.parsed.interface(interface, alternate_setting).is_none() {
            return Err(Error::InvalidArgument(format!(
                "interface {} has no alternate setting {}",
                interface, alternate_setting
            )));
        }
        self.state().alternates.insert(interface, alternate_setting);
        Ok(())
    }

    fn pipes(&self, interface: u8) -> Result<Vec<u8>> {
        let alternate = self
            .state()
            .alternates
            .get(&interface)
            .copied()
            .unwrap_or(0);
        let setting = self
            .parsed
            .interface(interface, alternate)
            .ok_or_else(|| Error::InvalidArgument(format!("no interface {}", interface)))?;
        Ok(setting.endpoints.iter().map(|e| e.address).collect())
    }
}

// ============================================================================
// Fake platform
// ============================================================================

/// In-memory device tree
#[derive(Default)]
pub struct FakePlatform {
    devices: Mutex<Vec<(DeviceId, Arc<FakeDevice>)>>,
    enumerate_error: Mutex<Option<Error>>,
    open_error: Mutex<Option<Error>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: DeviceId, device: Arc<FakeDevice>) {
        self.devices().push((id, device));
    }

    pub fn remove(&self, id: &DeviceId) -> Option<Arc<FakeDevice>> {
        let mut devices = self.devices();
        let index = devices.iter().position(|(existing, _)| existing == id)?;
        Some(devices.remove(index).1)
    }

    /// Make the next enumeration fail as if the device tree were unreachable
    pub fn fail_enumeration(&self, err: Error) {
        *self.enumerate_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// Make the next open fail before anything is acquired
    pub fn fail_open(&self, err: Error) {
        *self.open_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    fn devices(&self) -> MutexGuard<'_, Vec<(DeviceId, Arc<FakeDevice>)>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Platform for FakePlatform {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        if let Some(err) = self
            .enumerate_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(err);
        }
        let devices = self.devices().clone();
        Ok(describe_all(
            devices,
            |(id, _)| id.clone(),
            |(id, device)| device.describe(id.clone()),
        ))
    }

    fn open(&self, id: &DeviceId) -> Result<Arc<dyn PlatformDevice>> {
        if let Some(err) = self
            .open_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(err);
        }
        let device = self
            .devices()
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, device)| device.clone())
            .ok_or(Error::NotFound)?;

        device.claim_all()?;
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_bytes() {
        assert_eq!(string_bytes("Hi"), vec![6, 0x03, b'H', 0, b'i', 0]);
        assert_eq!(language_id_bytes(&[0x0409]), vec![4, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn test_configuration_bytes_parse_back() {
        let bytes = configuration_bytes(
            1,
            &[
                FakeInterface::new(0, 0, 0x01),
                FakeInterface::new(1, 0, 0x01),
                FakeInterface::new(1, 1, 0x01).endpoint(0x01, 0x05, 192),
            ],
        );
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
        let parsed = parse_configuration(&bytes).unwrap();
        assert_eq!(parsed.num_interfaces, 2);
        assert_eq!(parsed.interfaces.len(), 3);
    }

    #[test]
    fn test_claim_mismatch_unwinds_in_reverse() {
        let fake = FakeDevice::builder()
            .interface(FakeInterface::new(0, 0, 0xFF))
            .interface(FakeInterface::new(1, 0, 0xFF))
            .interface(FakeInterface::new(2, 0, 0xFF))
            .reported_interfaces(vec![0, 1, 5])
            .build();

        let err = fake.claim_all().unwrap_err();
        assert_eq!(
            err,
            Error::InterfaceNumberMismatch {
                position: 2,
                reported: 5
            }
        );
        assert_eq!(
            fake.events(),
            vec![
                "open", "claim 0", "claim 1", "claim 5", "release 5", "release 1", "release 0",
                "close"
            ]
        );
        assert!(!fake.is_open());
    }
}
