//! Asynchronous libusb transfers
//!
//! A [`Pending`] block is boxed and handed to libusb through the transfer's
//! `user_data`. The completion callback runs on the device's event thread,
//! resolves the caller's [`Completion`] and passes the block to the reaper
//! channel. The event thread drops reaped blocks once `handle_events` has
//! returned, which frees the native transfer and, if it held the last
//! reference, closes the device outside of libusb's event handling.
//!
//! Isochronous transfers use the [`IsoBuffer`] storage itself as the native
//! buffer, so frames filled in after submission are what goes on the bus.

use super::device::Shared;
use crate::error::{Error, Result, rusb_error};
use crate::iso_buffer::IsoBuffer;
use crate::transfer::{Completion, TransferStatus};
use protocol::constants::SETUP_PACKET_SIZE;
use protocol::ControlSetup;
use rusb::{Context, DeviceHandle, ffi};
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::Arc;
use tracing::{error, trace};

// libusb_transfer_status
const LIBUSB_TRANSFER_COMPLETED: c_int = 0;
const LIBUSB_TRANSFER_ERROR: c_int = 1;
const LIBUSB_TRANSFER_TIMED_OUT: c_int = 2;
const LIBUSB_TRANSFER_CANCELLED: c_int = 3;
const LIBUSB_TRANSFER_STALL: c_int = 4;
const LIBUSB_TRANSFER_NO_DEVICE: c_int = 5;
const LIBUSB_TRANSFER_OVERFLOW: c_int = 6;

// libusb_transfer_type
const LIBUSB_TRANSFER_TYPE_CONTROL: u8 = 0;
const LIBUSB_TRANSFER_TYPE_ISOCHRONOUS: u8 = 1;

fn transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_ERROR => TransferStatus::Error,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

enum Kind {
    ControlIn(Completion<Vec<u8>>),
    ControlOut(Completion<usize>),
    Iso {
        buffer: IsoBuffer,
        completion: Completion<usize>,
    },
}

/// Everything a submitted transfer owns until its callback has run
pub(crate) struct Pending {
    transfer: *mut ffi::libusb_transfer,
    /// Native buffer of control transfers, starting with the setup packet
    data: Vec<u8>,
    kind: Option<Kind>,
    /// The transfer refers to this handle until its callback has run
    _handle: Arc<DeviceHandle<Context>>,
    shared: Arc<Shared>,
}

// The raw transfer is only touched by the submitting thread before submission
// and by the event thread afterwards.
unsafe impl Send for Pending {}

impl Drop for Pending {
    fn drop(&mut self) {
        // Safe because `transfer` came from libusb_alloc_transfer and libusb
        // no longer references it once the callback has run or submission
        // failed.
        unsafe { ffi::libusb_free_transfer(self.transfer) };
    }
}

impl Pending {
    fn finish(&mut self, status: TransferStatus, actual_length: usize) {
        match self.kind.take() {
            Some(Kind::ControlIn(completion)) => {
                let end = (SETUP_PACKET_SIZE + actual_length).min(self.data.len());
                let data = self.data[SETUP_PACKET_SIZE..end].to_vec();
                completion.complete_with_status(status, data);
            }
            Some(Kind::ControlOut(completion)) => {
                completion.complete_with_status(status, actual_length);
            }
            Some(Kind::Iso { buffer, completion }) => {
                let lengths = self.packet_lengths(buffer.num_frames());
                buffer.set_frame_lengths(&lengths);
                completion.complete_with_status(status, lengths.iter().sum());
            }
            None => {}
        }
    }

    fn packet_lengths(&self, count: usize) -> Vec<usize> {
        (0..count)
            .map(|i| {
                // Safe because the transfer was allocated with `count` packet
                // descriptors.
                unsafe {
                    let desc = &*(*self.transfer).iso_packet_desc.as_ptr().add(i);
                    desc.actual_length as usize
                }
            })
            .collect()
    }
}

extern "system" fn transfer_completed(transfer: *mut ffi::libusb_transfer) {
    // Safe because libusb hands back the transfer we submitted.
    let user_data = unsafe { (*transfer).user_data };
    if user_data.is_null() {
        error!("libusb completed a transfer without its context, aborting");
        std::process::abort();
    }

    // Safe because `user_data` was produced by Box::into_raw in `submit` and
    // libusb invokes the callback exactly once.
    let mut pending = unsafe { Box::from_raw(user_data as *mut Pending) };
    let (status, actual_length) =
        unsafe { ((*transfer).status, (*transfer).actual_length.max(0) as usize) };
    let status = transfer_status(status);
    trace!("Transfer completed: {:?}, {} bytes", status, actual_length);

    pending.finish(status, actual_length);
    pending.shared.transfer_finished(transfer as usize);

    let shared = pending.shared.clone();
    shared.reap(pending);
}

/// Queue a control IN transfer
pub(crate) fn submit_control_in(
    shared: &Arc<Shared>,
    setup: ControlSetup,
    completion: Completion<Vec<u8>>,
) -> Result<()> {
    let mut data = vec![0; SETUP_PACKET_SIZE + setup.length as usize];
    data[..SETUP_PACKET_SIZE].copy_from_slice(&setup.to_bytes());
    submit(
        shared,
        0,
        LIBUSB_TRANSFER_TYPE_CONTROL,
        data,
        None,
        Kind::ControlIn(completion),
    )
}

/// Queue a control OUT transfer
pub(crate) fn submit_control_out(
    shared: &Arc<Shared>,
    setup: ControlSetup,
    payload: &[u8],
    completion: Completion<usize>,
) -> Result<()> {
    let mut data = Vec::with_capacity(SETUP_PACKET_SIZE + payload.len());
    data.extend_from_slice(&setup.to_bytes());
    data.extend_from_slice(payload);
    submit(
        shared,
        0,
        LIBUSB_TRANSFER_TYPE_CONTROL,
        data,
        None,
        Kind::ControlOut(completion),
    )
}

/// Queue an isochronous transfer covering every frame of `buffer`
pub(crate) fn submit_iso(
    shared: &Arc<Shared>,
    buffer: &IsoBuffer,
    completion: Completion<usize>,
) -> Result<()> {
    submit(
        shared,
        buffer.endpoint(),
        LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
        Vec::new(),
        Some((buffer.num_frames(), buffer.bytes_per_frame())),
        Kind::Iso {
            buffer: buffer.clone(),
            completion,
        },
    )
}

/// Where libusb reads and writes a transfer's payload
///
/// Isochronous transfers go straight to the buffer's own storage, which the
/// `Kind::Iso` clone keeps alive; control transfers use `data`.
fn native_buffer(kind: Option<&Kind>, data: &mut [u8]) -> (*mut u8, usize) {
    match kind {
        Some(Kind::Iso { buffer, .. }) => (buffer.as_mut_ptr(), buffer.len()),
        _ => (data.as_mut_ptr(), data.len()),
    }
}

fn submit(
    shared: &Arc<Shared>,
    endpoint: u8,
    transfer_type: u8,
    data: Vec<u8>,
    packets: Option<(usize, usize)>,
    kind: Kind,
) -> Result<()> {
    let (num_packets, packet_size) = packets.unwrap_or((0, 0));
    let num_packets = c_int::try_from(num_packets)
        .map_err(|_| Error::InvalidArgument(format!("{} packets", num_packets)))?;

    let mut state = shared.state();
    let Some(handle) = state.handle.clone() else {
        return Err(Error::NotOpen);
    };

    // Safe because the count is non-negative; a null return is handled.
    let transfer = unsafe { ffi::libusb_alloc_transfer(num_packets) };
    if transfer.is_null() {
        return Err(rusb_error(-11).into());
    }

    let mut pending = Box::new(Pending {
        transfer,
        data,
        kind: Some(kind),
        _handle: handle.clone(),
        shared: shared.clone(),
    });

    let (buffer, length) = native_buffer(pending.kind.as_ref(), &mut pending.data);
    let length = c_int::try_from(length)
        .map_err(|_| Error::InvalidArgument(format!("{} byte transfer", length)))?;

    // Safe because `transfer` is a fresh allocation with `num_packets` packet
    // descriptors and the buffer outlives `pending`, which lives until the
    // callback runs.
    let user_data = unsafe {
        let raw = &mut *transfer;
        raw.dev_handle = handle.as_raw();
        raw.endpoint = endpoint;
        raw.transfer_type = transfer_type;
        raw.timeout = shared.timeout_ms();
        raw.buffer = buffer;
        raw.length = length;
        raw.num_iso_packets = num_packets;
        raw.callback = transfer_completed;
        for i in 0..num_packets as usize {
            let desc = &mut *raw.iso_packet_desc.as_mut_ptr().add(i);
            desc.length = packet_size as c_uint;
        }
        let user_data = Box::into_raw(pending) as *mut c_void;
        raw.user_data = user_data;
        user_data
    };

    // Safe because the transfer is fully initialised above.
    let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
    if rc != 0 {
        drop(state);
        // Safe because libusb did not take the transfer, so we still own it.
        let pending = unsafe { Box::from_raw(user_data as *mut Pending) };
        drop(pending);
        return Err(rusb_error(rc).into());
    }

    state.in_flight.push(transfer as usize);
    Ok(())
}

/// Ask libusb to cancel a submitted transfer; its callback still runs
pub(crate) fn cancel(transfer: usize) {
    // Safe because only addresses of transfers still in flight are passed in,
    // and the callback that frees them needs the state lock the caller holds.
    let rc = unsafe { ffi::libusb_cancel_transfer(transfer as *mut ffi::libusb_transfer) };
    if rc != 0 {
        trace!("Cancel returned {}", rc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Direction;

    #[test]
    fn test_transfer_status_mapping() {
        assert_eq!(transfer_status(0), TransferStatus::Completed);
        assert_eq!(transfer_status(3), TransferStatus::Cancelled);
        assert_eq!(transfer_status(4), TransferStatus::Stall);
        assert_eq!(transfer_status(5), TransferStatus::NoDevice);
        assert_eq!(transfer_status(42), TransferStatus::Error);
    }

    #[test]
    fn test_iso_transfers_use_buffer_storage() {
        let buffer = IsoBuffer::new(Direction::Out, 1, 0x01, 4, 16).unwrap();
        let (_handle, completion) = crate::transfer::transfer_pair::<usize>(Vec::new());
        let kind = Kind::Iso {
            buffer: buffer.clone(),
            completion,
        };
        let mut unused = Vec::new();

        let (ptr, length) = native_buffer(Some(&kind), &mut unused);
        assert_eq!(ptr, buffer.as_mut_ptr());
        assert_eq!(length, 64);
    }

    #[test]
    fn test_control_transfers_use_own_data() {
        let (_handle, completion) = crate::transfer::transfer_pair::<Vec<u8>>(Vec::new());
        let kind = Kind::ControlIn(completion);
        let mut data = vec![0; SETUP_PACKET_SIZE + 4];

        let (ptr, length) = native_buffer(Some(&kind), &mut data);
        assert_eq!(ptr, data.as_mut_ptr());
        assert_eq!(length, 12);
    }
}
