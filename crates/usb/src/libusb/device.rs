//! Opened libusb device
//!
//! Each device gets its own libusb context and event thread, so completions
//! of one device never wait behind another's.

use super::transfers::{self, Pending};
use crate::error::{Error, Result};
use crate::event_loop::EventContext;
use crate::id::{DeviceId, Speed};
use crate::iso_buffer::IsoBuffer;
use crate::platform::{ControlPipe, IsoSubmit, PlatformDevice};
use crate::transfer::Completion;
use crate::unwind::Unwind;
use protocol::constants::CONFIGURATION_DESCRIPTOR_SIZE;
use protocol::{
    ConfigurationDescriptor, ControlSetup, DescriptorType, Direction, configuration_total_length,
    get_descriptor, parse_configuration,
};
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::os::raw::c_uint;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long one `handle_events` call may block
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often close reports transfers that have not called back yet
const CANCEL_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Synchronous control transfers on a libusb handle
pub(crate) struct HandlePipe<'a> {
    handle: &'a DeviceHandle<Context>,
    timeout: Duration,
}

impl<'a> HandlePipe<'a> {
    pub(crate) fn new(handle: &'a DeviceHandle<Context>, timeout: Duration) -> Self {
        Self { handle, timeout }
    }
}

impl ControlPipe for HandlePipe<'_> {
    fn control_in(&self, setup: ControlSetup) -> Result<Vec<u8>> {
        let mut buffer = vec![0; setup.length as usize];
        let read = self.handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            &mut buffer,
            self.timeout,
        )?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize> {
        Ok(self.handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            self.timeout,
        )?)
    }
}

/// Full configuration descriptor stream: the 9 byte header, then
/// `wTotalLength` bytes
pub(crate) fn read_raw_configuration(pipe: &dyn ControlPipe, index: u8) -> Result<Vec<u8>> {
    let header = pipe.control_in(get_descriptor(
        DescriptorType::Configuration,
        index,
        0,
        CONFIGURATION_DESCRIPTOR_SIZE as u16,
    ))?;
    if header.len() != CONFIGURATION_DESCRIPTOR_SIZE {
        return Err(Error::ShortTransfer {
            expected: CONFIGURATION_DESCRIPTOR_SIZE,
            actual: header.len(),
        });
    }

    let total = configuration_total_length(&header)?;
    let data = pipe.control_in(get_descriptor(
        DescriptorType::Configuration,
        index,
        0,
        total,
    ))?;
    if data.len() != total as usize {
        return Err(Error::ShortTransfer {
            expected: total as usize,
            actual: data.len(),
        });
    }
    Ok(data)
}

pub(crate) fn map_speed(speed: rusb::Speed) -> Speed {
    match speed {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super => Speed::Super,
        rusb::Speed::SuperPlus => Speed::SuperPlus,
        _ => Speed::Unknown,
    }
}

pub(crate) struct State {
    /// `None` once closed
    pub(crate) handle: Option<Arc<DeviceHandle<Context>>>,
    /// Claimed interfaces and whether a kernel driver was detached from each
    claimed: Vec<(u8, bool)>,
    alternates: HashMap<u8, u8>,
    /// Addresses of submitted native transfers
    pub(crate) in_flight: Vec<usize>,
}

/// State shared by a device and its outstanding transfers
pub(crate) struct Shared {
    id: DeviceId,
    state: Mutex<State>,
    drained: Condvar,
    reaper: Mutex<mpsc::Sender<Box<Pending>>>,
    events: Mutex<Option<EventContext>>,
    configuration: ConfigurationDescriptor,
    speed: Speed,
    timeout: Duration,
    /// Start of the emulated frame clock
    opened_at: Instant,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn timeout_ms(&self) -> c_uint {
        self.timeout.as_millis().min(c_uint::MAX as u128) as c_uint
    }

    pub(crate) fn transfer_finished(&self, transfer: usize) {
        let mut state = self.state();
        state.in_flight.retain(|&t| t != transfer);
        if state.in_flight.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Hand a finished transfer to the event thread for disposal
    pub(crate) fn reap(&self, pending: Box<Pending>) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Err(mpsc::SendError(pending)) = reaper.send(pending) {
            drop(pending);
        }
    }

    fn handle(&self) -> Result<Arc<DeviceHandle<Context>>> {
        self.state().handle.clone().ok_or(Error::NotOpen)
    }

    fn close(&self) {
        let mut state = self.state();
        let Some(handle) = state.handle.take() else {
            return;
        };

        for &transfer in &state.in_flight {
            transfers::cancel(transfer);
        }
        // Interfaces stay claimed until libusb has let go of every transfer.
        // The event thread keeps pumping, so each one calls back eventually.
        let mut state = wait_for_drain(&self.drained, state, &self.id, CANCEL_WARN_INTERVAL);

        for (interface, detached) in state.claimed.drain(..).rev() {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if detached && let Err(e) = handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        state.alternates.clear();
        drop(state);
        drop(handle);

        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(events);
        info!("Closed device {}", self.id);
    }
}

/// Block until no submitted transfer is outstanding
fn wait_for_drain<'a>(
    drained: &Condvar,
    mut state: MutexGuard<'a, State>,
    id: &DeviceId,
    warn_every: Duration,
) -> MutexGuard<'a, State> {
    loop {
        let (next, _) = drained
            .wait_timeout_while(state, warn_every, |s| !s.in_flight.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state = next;
        if state.in_flight.is_empty() {
            return state;
        }
        warn!(
            "Still waiting for {} cancelled transfers on {}",
            state.in_flight.len(),
            id
        );
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

/// A device opened through libusb
pub struct LibusbDevice {
    shared: Arc<Shared>,
}

impl LibusbDevice {
    /// Open `device`, select its first configuration and claim every interface
    pub(crate) fn open(
        context: &Context,
        device: rusb::Device<Context>,
        id: DeviceId,
        timeout: Duration,
    ) -> Result<Self> {
        let speed = map_speed(device.speed());
        let handle = device.open()?;
        debug!("Opened handle for {}", id);

        let raw = read_raw_configuration(&HandlePipe::new(&handle, timeout), 0)
            .map_err(|_| Error::DescriptorReadFailed)?;
        let configuration = parse_configuration(&raw)?;

        let mut unwind = Unwind::new();
        let mut claimed = Vec::new();

        let numbers = configuration.interface_numbers();

        let mut detached = Vec::with_capacity(numbers.len());
        for &number in &numbers {
            let was_detached = match handle.kernel_driver_active(number) {
                Ok(true) => match handle.detach_kernel_driver(number) {
                    Ok(()) => {
                        debug!("Detached kernel driver from interface {}", number);
                        true
                    }
                    Err(e) => {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            number, e
                        );
                        false
                    }
                },
                Ok(false) => false,
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        number, e
                    );
                    false
                }
            };
            detached.push(was_detached);
            if was_detached {
                let handle = &handle;
                unwind.push(move || {
                    let _ = handle.attach_kernel_driver(number);
                });
            }
        }

        let active = handle.active_configuration().unwrap_or(0);
        if active != configuration.configuration_value {
            handle
                .set_active_configuration(configuration.configuration_value)
                .map_err(|e| {
                    warn!("Failed to select configuration on {}: {}", id, e);
                    Error::ConfigurationFailed
                })?;
        }

        for (position, &number) in numbers.iter().enumerate() {
            let position = position as u8;
            if number != position {
                warn!(
                    "Interface at position {} of {} reports number {}",
                    position, id, number
                );
                return Err(Error::InterfaceNumberMismatch {
                    position,
                    reported: number,
                });
            }

            handle.claim_interface(number).map_err(|e| {
                warn!("Failed to claim interface {}: {}", number, e);
                Error::from(e)
            })?;
            debug!("Claimed interface {} on {}", number, id);
            let handle = &handle;
            unwind.push(move || {
                let _ = handle.release_interface(number);
            });
            claimed.push((number, detached[position as usize]));
        }

        let (reaper, reaped) = mpsc::channel::<Box<Pending>>();
        let pump_context = context.clone();
        let events = EventContext::start(&format!("usb-{}", id), move || {
            if let Err(e) = pump_context.handle_events(Some(EVENT_POLL_INTERVAL)) {
                debug!("handle_events: {}", e);
            }
            while let Ok(pending) = reaped.try_recv() {
                drop(pending);
            }
        })?;

        unwind.disarm();

        let shared = Arc::new(Shared {
            id: id.clone(),
            state: Mutex::new(State {
                handle: Some(Arc::new(handle)),
                claimed,
                alternates: HashMap::new(),
                in_flight: Vec::new(),
            }),
            drained: Condvar::new(),
            reaper: Mutex::new(reaper),
            events: Mutex::new(Some(events)),
            configuration,
            speed,
            timeout,
            opened_at: Instant::now(),
        });

        info!("Device {} open with {} interfaces", id, numbers.len());
        Ok(Self { shared })
    }

    fn pipe<R>(&self, f: impl FnOnce(&HandlePipe<'_>) -> Result<R>) -> Result<R> {
        let handle = self.shared.handle()?;
        f(&HandlePipe::new(&handle, self.shared.timeout))
    }

    fn current_frame(&self) -> u64 {
        self.shared.opened_at.elapsed().as_millis() as u64
    }
}

impl ControlPipe for LibusbDevice {
    fn control_in(&self, setup: ControlSetup) -> Result<Vec<u8>> {
        self.pipe(|pipe| pipe.control_in(setup))
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize> {
        self.pipe(|pipe| pipe.control_out(setup, data))
    }
}

impl PlatformDevice for LibusbDevice {
    fn close(&self) {
        self.shared.close();
    }

    fn is_open(&self) -> bool {
        self.shared.state().handle.is_some()
    }

    fn speed(&self) -> Speed {
        self.shared.speed
    }

    fn submit_control_in(
        &self,
        setup: ControlSetup,
        completion: Completion<Vec<u8>>,
    ) -> Result<()> {
        transfers::submit_control_in(&self.shared, setup, completion)
    }

    fn submit_control_out(
        &self,
        setup: ControlSetup,
        data: Vec<u8>,
        completion: Completion<usize>,
    ) -> Result<()> {
        transfers::submit_control_out(&self.shared, setup, &data, completion)
    }

    fn raw_configuration(&self, index: u8) -> Result<Vec<u8>> {
        self.pipe(|pipe| read_raw_configuration(pipe, index))
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

    /// libusb has no start-frame scheduling: a frame that has not yet passed
    /// is accepted and the transfer is queued behind those already pending.
    fn submit_iso(
        &self,
        buffer: &IsoBuffer,
        frame: u64,
        completion: Completion<usize>,
    ) -> Result<IsoSubmit> {
        if frame < self.current_frame() {
            return Ok(IsoSubmit::TooOld);
        }
        transfers::submit_iso(&self.shared, buffer, completion)?;
        Ok(IsoSubmit::Submitted)
    }

    fn bus_frame_number(&self) -> Result<u64> {
        self.shared.handle()?;
        Ok(self.current_frame())
    }

    fn num_interfaces(&self) -> u8 {
        self.shared.configuration.num_interfaces
    }

    fn set_alternate(&self, interface: u8, alternate_setting: u8) -> Result<()> {
        if self
            .shared
            .configuration
            .interface(interface, alternate_setting)
            .is_none()
        {
            return Err(Error::InvalidArgument(format!(
                "interface {} has no alternate setting {}",
                interface, alternate_setting
            )));
        }
        let handle = self.shared.handle()?;
        handle.set_alternate_setting(interface, alternate_setting)?;
        self.shared
            .state()
            .alternates
            .insert(interface, alternate_setting);
        Ok(())
    }

    fn pipes(&self, interface: u8) -> Result<Vec<u8>> {
        let alternate = self
            .shared
            .state()
            .alternates
            .get(&interface)
            .copied()
            .unwrap_or(0);
        let setting = self
            .shared
            .configuration
            .interface(interface, alternate)
            .ok_or_else(|| Error::InvalidArgument(format!("no interface {}", interface)))?;
        Ok(setting.endpoints.iter().map(|e| e.address).collect())
    }
}
