//! Isochronous transfer buffers

use crate::error::{Error, Result};
use protocol::Direction;
use std::sync::{Arc, Mutex, PoisonError};

struct Inner {
    direction: Direction,
    interface: u8,
    endpoint: u8,
    num_frames: usize,
    bytes_per_frame: usize,
    len: usize,
    /// Never reallocated, so backends may hand its address to native code
    data: Mutex<Box<[u8]>>,
    /// Bytes actually moved per frame, filled in on completion
    frame_lengths: Mutex<Vec<usize>>,
}

/// Fixed size storage for one isochronous transfer
///
/// Holds `num_frames * bytes_per_frame` bytes, one slot per USB frame. Clones
/// share the same storage; a pending transfer keeps its buffer alive through
/// such a clone.
#[derive(Clone)]
pub struct IsoBuffer {
    inner: Arc<Inner>,
}

impl IsoBuffer {
    pub fn new(
        direction: Direction,
        interface: u8,
        endpoint: u8,
        num_frames: usize,
        bytes_per_frame: usize,
    ) -> Result<Self> {
        if num_frames == 0 || bytes_per_frame == 0 {
            return Err(Error::InvalidArgument(format!(
                "isochronous buffer needs at least one frame and one byte per frame \
                 (got {} x {})",
                num_frames, bytes_per_frame
            )));
        }
        let len = num_frames.checked_mul(bytes_per_frame).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "isochronous buffer of {} frames x {} bytes is too large",
                num_frames, bytes_per_frame
            ))
        })?;
        if Direction::from_bit(endpoint) != direction {
            return Err(Error::InvalidArgument(format!(
                "endpoint {:#04x} is not an {:?} endpoint",
                endpoint, direction
            )));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                direction,
                interface,
                endpoint,
                num_frames,
                bytes_per_frame,
                len,
                data: Mutex::new(vec![0; len].into_boxed_slice()),
                frame_lengths: Mutex::new(vec![0; num_frames]),
            }),
        })
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Interface number the endpoint belongs to
    pub fn interface(&self) -> u8 {
        self.inner.interface
    }

    /// Endpoint address, including the direction bit
    pub fn endpoint(&self) -> u8 {
        self.inner.endpoint
    }

    pub fn num_frames(&self) -> usize {
        self.inner.num_frames
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.inner.bytes_per_frame
    }

    /// Total size in bytes
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill the whole buffer with zeroes
    pub fn zero(&self) {
        self.with_data(|data| data.fill(0));
        self.lengths().fill(0);
    }

    /// Copy `data` into the slot of frame `index`
    ///
    /// The rest of the slot is left as it was.
    pub fn write_frame(&self, index: usize, data: &[u8]) -> Result<()> {
        self.check_frame(index)?;
        if data.len() > self.inner.bytes_per_frame {
            return Err(Error::InvalidArgument(format!(
                "{} bytes do not fit a {} byte frame",
                data.len(),
                self.inner.bytes_per_frame
            )));
        }
        let start = index * self.inner.bytes_per_frame;
        self.with_data(|buffer| buffer[start..start + data.len()].copy_from_slice(data));
        Ok(())
    }

    /// Bytes received in frame `index` by the last completed transfer
    pub fn read_frame(&self, index: usize) -> Result<Vec<u8>> {
        self.check_frame(index)?;
        let length = self.lengths()[index].min(self.inner.bytes_per_frame);
        let start = index * self.inner.bytes_per_frame;
        Ok(self.with_data(|buffer| buffer[start..start + length].to_vec()))
    }

    /// Per-frame byte counts reported by the last completed transfer
    pub fn frame_lengths(&self) -> Vec<usize> {
        self.lengths().clone()
    }

    /// Record per-frame byte counts; used by platform backends on completion
    pub fn set_frame_lengths(&self, lengths: &[usize]) {
        let mut current = self.lengths();
        for (slot, length) in current.iter_mut().zip(lengths) {
            *slot = *length;
        }
    }

    /// Run `f` with exclusive access to the raw storage
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self
            .inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut data)
    }

    /// Address of the storage, stable for the buffer's whole life
    ///
    /// Native transfers read and write through it directly, so frames written
    /// after submission still go out. The pointer is valid while any clone of
    /// this buffer is alive.
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.with_data(|data| data.as_mut_ptr())
    }

    /// True if both handles refer to the same storage
    pub fn same_buffer(&self, other: &IsoBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_frame(&self, index: usize) -> Result<()> {
        if index >= self.inner.num_frames {
            return Err(Error::InvalidArgument(format!(
                "frame {} out of range for a {} frame buffer",
                index, self.inner.num_frames
            )));
        }
        Ok(())
    }

    fn lengths(&self) -> std::sync::MutexGuard<'_, Vec<usize>> {
        self.inner
            .frame_lengths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for IsoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoBuffer")
            .field("direction", &self.inner.direction)
            .field("interface", &self.inner.interface)
            .field("endpoint", &format_args!("{:#04x}", self.inner.endpoint))
            .field("num_frames", &self.inner.num_frames)
            .field("bytes_per_frame", &self.inner.bytes_per_frame)
            .finish()
    }
}
