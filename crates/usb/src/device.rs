//! Opened USB device
//!
//! [`Device`] wraps a backend's [`PlatformDevice`] with the logic every
//! platform shares: the cached descriptor tree, string helpers, control
//! transfer checks and isochronous frame scheduling.

use crate::error::{Error, Result};
use crate::id::{DeviceId, Speed};
use crate::iso_buffer::IsoBuffer;
use crate::platform::{IsoSubmit, PlatformDevice};
use crate::requests;
use crate::transfer::{IsoTransferHandle, KeepAlive, TransferHandle, WriteHandle, transfer_pair};
use protocol::{
    ControlSetup, DescriptorType, DeviceDescriptor, Direction, Recipient, RequestType,
    parse_configuration,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Start frames tried by [`Device::submit_iso_asap`] before giving up
pub const ISO_ASAP_ATTEMPTS: u32 = 32;

/// Start frames tried when continuing a stream: the tracked frame and the next
const ISO_CONTINUE_ATTEMPTS: u32 = 2;

/// An opened device
///
/// All interfaces of the first configuration are claimed for as long as the
/// device is open. Dropping a `Device` does not tear the backend down while
/// asynchronous transfers still hold it; the backend closes once the last of
/// them completes. [`Device::close`] releases it immediately.
pub struct Device {
    id: DeviceId,
    inner: Arc<dyn PlatformDevice>,
    descriptor: DeviceDescriptor,
    /// Next contiguous start frame per (interface, endpoint)
    cursors: Mutex<HashMap<(u8, u8), u64>>,
}

impl Device {
    /// Build the shared layer on top of a freshly opened backend device
    ///
    /// Reads and caches the device descriptor and every configuration. The
    /// backend is closed again if that fails.
    pub(crate) fn from_platform(id: DeviceId, inner: Arc<dyn PlatformDevice>) -> Result<Self> {
        match read_descriptor_tree(inner.as_ref()) {
            Ok(descriptor) => {
                info!(
                    "Opened device {} ({:04x}:{:04x})",
                    id, descriptor.vendor_id, descriptor.product_id
                );
                Ok(Self {
                    id,
                    inner,
                    descriptor,
                    cursors: Mutex::new(HashMap::new()),
                })
            }
            Err(e) => {
                warn!("Failed to read descriptors of {}: {}", id, e);
                inner.close();
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Release all interfaces and the device. Pending transfers fail.
    pub fn close(&self) {
        if self.inner.is_open() {
            self.inner.close();
            info!("Closed device {}", self.id);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    /// The cached descriptor tree
    pub fn descriptors(&self) -> Result<&DeviceDescriptor> {
        self.ensure_open()?;
        Ok(&self.descriptor)
    }

    pub fn vendor_id(&self) -> Result<u16> {
        self.ensure_open()?;
        Ok(self.descriptor.vendor_id)
    }

    pub fn product_id(&self) -> Result<u16> {
        self.ensure_open()?;
        Ok(self.descriptor.product_id)
    }

    pub fn speed(&self) -> Result<Speed> {
        self.ensure_open()?;
        Ok(self.inner.speed())
    }

    /// Manufacturer string in ASCII, empty if the device has none
    pub fn manufacturer(&self, language_id: u16) -> Result<String> {
        self.indexed_string(self.descriptor.manufacturer_index, language_id)
    }

    /// Product string in ASCII, empty if the device has none
    pub fn product(&self, language_id: u16) -> Result<String> {
        self.indexed_string(self.descriptor.product_index, language_id)
    }

    /// Serial number in ASCII, empty if the device has none
    pub fn serial(&self, language_id: u16) -> Result<String> {
        self.indexed_string(self.descriptor.serial_index, language_id)
    }

    fn indexed_string(&self, index: u8, language_id: u16) -> Result<String> {
        self.ensure_open()?;
        if index == 0 {
            return Ok(String::new());
        }
        requests::string_descriptor_ascii(self.inner.as_ref(), index, language_id)
    }

    pub fn language_ids(&self) -> Result<Vec<u16>> {
        self.ensure_open()?;
        requests::language_ids(self.inner.as_ref())
    }

    /// String descriptor `index`; index 0 is rejected, use [`Device::language_ids`]
    pub fn string_descriptor(&self, index: u8, language_id: u16) -> Result<String> {
        self.ensure_open()?;
        requests::string_descriptor(self.inner.as_ref(), index, language_id)
    }

    pub fn string_descriptor_ascii(&self, index: u8, language_id: u16) -> Result<String> {
        self.ensure_open()?;
        requests::string_descriptor_ascii(self.inner.as_ref(), index, language_id)
    }

    /// Read any descriptor with the header-then-body GET_DESCRIPTOR sequence
    pub fn get_descriptor(
        &self,
        descriptor_type: DescriptorType,
        index: u8,
        language_id: u16,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        requests::read_descriptor(self.inner.as_ref(), descriptor_type, index, language_id)
    }

    /// Blocking control IN transfer
    ///
    /// Returns what the device sent, which may be shorter than `length`.
    pub fn control_in_sync(
        &self,
        recipient: Recipient,
        kind: RequestType,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let setup = ControlSetup::in_request(recipient, kind, request, value, index, length);
        let data = self.inner.control_in(setup)?;
        debug!(
            "Control IN {:#04x}/{:#04x} on {}: {} of {} bytes",
            setup.request_type,
            request,
            self.id,
            data.len(),
            length
        );
        Ok(data)
    }

    /// Blocking control OUT transfer; every byte must be accepted
    pub fn control_out_sync(
        &self,
        recipient: Recipient,
        kind: RequestType,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let length = payload_length(data)?;
        let setup = ControlSetup::out_request(recipient, kind, request, value, index, length);
        let written = self.inner.control_out(setup, data)?;
        debug!(
            "Control OUT {:#04x}/{:#04x} on {}: {} of {} bytes",
            setup.request_type,
            request,
            self.id,
            written,
            data.len()
        );
        if written != data.len() {
            return Err(Error::Incomplete {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }

    /// Submit a control IN transfer without waiting for it
    pub fn control_in(
        &self,
        recipient: Recipient,
        kind: RequestType,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<TransferHandle> {
        self.ensure_open()?;
        let setup = ControlSetup::in_request(recipient, kind, request, value, index, length);
        let (handle, completion) = transfer_pair(self.keep_alive(None));
        self.inner.submit_control_in(setup, completion)?;
        debug!("Submitted async control IN {:#04x} on {}", request, self.id);
        Ok(handle)
    }

    /// Submit a control OUT transfer without waiting for it
    ///
    /// Backends without asynchronous OUT support return
    /// [`Error::UnsupportedOperation`].
    pub fn control_out(
        &self,
        recipient: Recipient,
        kind: RequestType,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    ) -> Result<WriteHandle> {
        self.ensure_open()?;
        let length = payload_length(&data)?;
        let setup = ControlSetup::out_request(recipient, kind, request, value, index, length);
        let (handle, completion) = transfer_pair(self.keep_alive(None));
        self.inner.submit_control_out(setup, data, completion)?;
        debug!("Submitted async control OUT {:#04x} on {}", request, self.id);
        Ok(handle)
    }

    /// Buffer for reading from an isochronous IN endpoint
    pub fn create_iso_read_buffer(
        &self,
        interface: u8,
        endpoint: u8,
        num_frames: usize,
        bytes_per_frame: usize,
    ) -> Result<IsoBuffer> {
        self.ensure_open()?;
        self.inner.create_iso_buffer(
            Direction::In,
            interface,
            endpoint,
            num_frames,
            bytes_per_frame,
        )
    }

    /// Buffer for writing to an isochronous OUT endpoint
    pub fn create_iso_write_buffer(
        &self,
        interface: u8,
        endpoint: u8,
        num_frames: usize,
        bytes_per_frame: usize,
    ) -> Result<IsoBuffer> {
        self.ensure_open()?;
        self.inner.create_iso_buffer(
            Direction::Out,
            interface,
            endpoint,
            num_frames,
            bytes_per_frame,
        )
    }

    /// Submit an isochronous transfer as soon as possible
    ///
    /// With `continue_stream` the transfer starts exactly where the previous
    /// one on this endpoint ended, so consecutive buffers play without a gap;
    /// if that frame has already gone by, the next one is tried once. Without
    /// it (or when nothing has been submitted on the endpoint yet) the first
    /// future frame is used, moving forward one frame per rejection up to
    /// [`ISO_ASAP_ATTEMPTS`] times.
    pub fn submit_iso_asap(
        &self,
        buffer: &IsoBuffer,
        continue_stream: bool,
    ) -> Result<IsoTransferHandle> {
        self.ensure_open()?;
        self.check_pipe(buffer)?;

        let cursor = self.next_frame(buffer.interface(), buffer.endpoint());
        let (start, attempts) = match cursor {
            Some(frame) if continue_stream => (frame, ISO_CONTINUE_ATTEMPTS),
            _ => (self.inner.bus_frame_number()? + 1, ISO_ASAP_ATTEMPTS),
        };

        for attempt in 0..attempts {
            let frame = start + attempt as u64;
            if let Some(handle) = self.try_submit_iso(buffer, frame)? {
                return Ok(handle);
            }
            debug!("Frame {} already elapsed on {}, retrying", frame, self.id);
        }

        warn!(
            "Gave up scheduling isochronous transfer on {} endpoint {:#04x}",
            self.id,
            buffer.endpoint()
        );
        Err(Error::IsoScheduleFailed { attempts })
    }

    /// Submit an isochronous transfer starting at exactly `frame`
    pub fn submit_iso_at_frame(&self, buffer: &IsoBuffer, frame: u64) -> Result<IsoTransferHandle> {
        self.ensure_open()?;
        self.check_pipe(buffer)?;
        self.try_submit_iso(buffer, frame)?
            .ok_or(Error::IsoScheduleFailed { attempts: 1 })
    }

    fn try_submit_iso(&self, buffer: &IsoBuffer, frame: u64) -> Result<Option<IsoTransferHandle>> {
        let (handle, completion) = transfer_pair(self.keep_alive(Some(buffer)));
        match self.inner.submit_iso(buffer, frame, completion)? {
            IsoSubmit::Submitted => {
                let next = frame + buffer.num_frames() as u64;
                self.cursors()
                    .insert((buffer.interface(), buffer.endpoint()), next);
                debug!(
                    "Isochronous transfer on {} endpoint {:#04x}: frames {}..{}",
                    self.id,
                    buffer.endpoint(),
                    frame,
                    next
                );
                Ok(Some(handle))
            }
            IsoSubmit::TooOld => Ok(None),
        }
    }

    fn check_pipe(&self, buffer: &IsoBuffer) -> Result<()> {
        let pipes = self.inner.pipes(buffer.interface())?;
        if !pipes.contains(&buffer.endpoint()) {
            return Err(Error::InvalidArgument(format!(
                "endpoint {:#04x} is not available on interface {}",
                buffer.endpoint(),
                buffer.interface()
            )));
        }
        Ok(())
    }

    /// Frame at which the next contiguous transfer on an endpoint must start
    ///
    /// `None` until something has been submitted there.
    pub fn next_frame(&self, interface: u8, endpoint: u8) -> Option<u64> {
        self.cursors().get(&(interface, endpoint)).copied()
    }

    pub fn bus_frame_number(&self) -> Result<u64> {
        self.ensure_open()?;
        self.inner.bus_frame_number()
    }

    pub fn num_interfaces(&self) -> Result<u8> {
        self.ensure_open()?;
        Ok(self.inner.num_interfaces())
    }

    /// Select an alternate setting; cursors of the interface's endpoints reset
    pub fn set_alternate(&self, interface: u8, alternate_setting: u8) -> Result<()> {
        self.ensure_open()?;
        self.inner.set_alternate(interface, alternate_setting)?;
        self.cursors().retain(|(iface, _), _| *iface != interface);
        info!(
            "Interface {} of {} switched to alternate setting {}",
            interface, self.id, alternate_setting
        );
        Ok(())
    }

    fn keep_alive(&self, buffer: Option<&IsoBuffer>) -> KeepAlive {
        let mut keep_alive: KeepAlive = vec![Box::new(self.inner.clone())];
        if let Some(buffer) = buffer {
            keep_alive.push(Box::new(buffer.clone()));
        }
        keep_alive
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<(u8, u8), u64>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn payload_length(data: &[u8]) -> Result<u16> {
    u16::try_from(data.len()).map_err(|_| {
        Error::InvalidArgument(format!(
            "control payload of {} bytes exceeds 65535",
            data.len()
        ))
    })
}

/// Device descriptor plus every configuration it reports
fn read_descriptor_tree(inner: &dyn PlatformDevice) -> Result<DeviceDescriptor> {
    let mut descriptor = requests::read_device_descriptor(inner).map_err(read_failed)?;
    for index in 0..descriptor.num_configurations {
        let raw = inner.raw_configuration(index).map_err(read_failed)?;
        descriptor.configurations.push(parse_configuration(&raw)?);
    }
    Ok(descriptor)
}

fn read_failed(err: Error) -> Error {
    match err {
        Error::Descriptor(_) => err,
        other => {
            debug!("Descriptor read failed: {}", other);
            Error::DescriptorReadFailed
        }
    }
}
