//! Continuous isochronous output
//!
//! An [`IsochronousStream`] keeps a ring of write buffers queued back to back
//! on one OUT endpoint from a dedicated thread. Each buffer covers
//! `frames_per_transfer` bus frames and is zeroed before it is queued, so any
//! frame nobody writes goes out as silence. Callers fill individual frames of
//! already queued buffers with [`IsochronousStream::write_frame`].

use crate::device::Device;
use crate::error::{Error, Result};
use crate::iso_buffer::IsoBuffer;
use crate::transfer::IsoTransferHandle;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Ring geometry of an isochronous stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Buffers in flight. At least two.
    pub num_transfers: usize,
    /// Bus frames covered by each buffer
    pub frames_per_transfer: usize,
    /// Frames between "now" and the start of the first buffer
    pub lead_frames: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            num_transfers: 4,
            frames_per_transfer: 64,
            lead_frames: 16,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_transfers < 2 {
            return Err(Error::InvalidArgument(
                "an isochronous stream needs at least two transfers".to_string(),
            ));
        }
        if self.frames_per_transfer == 0 {
            return Err(Error::InvalidArgument(
                "frames_per_transfer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of [`IsochronousStream::write_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWrite {
    Written,
    /// No queued buffer covers the frame yet
    TooEarly,
    /// The frame has already been sent
    TooLate,
}

struct Shared {
    device: Arc<Device>,
    buffers: Vec<IsoBuffer>,
    /// Start frame of each queued buffer; `None` while a slot is being reused
    starts: Mutex<Vec<Option<u64>>>,
    frames_per_transfer: u64,
    quit: AtomicBool,
    submitted: AtomicU64,
    failure: Mutex<Option<Error>>,
}

impl Shared {
    fn starts(&self) -> MutexGuard<'_, Vec<Option<u64>>> {
        self.starts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, err: Error) {
        error!("Isochronous stream stopped: {}", err);
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }
}

/// Gap-free isochronous output on one endpoint
///
/// Dropping the stream stops the submission thread and waits for every queued
/// transfer to finish.
pub struct IsochronousStream {
    shared: Arc<Shared>,
    bytes_per_frame: usize,
    thread: Option<JoinHandle<()>>,
}

impl IsochronousStream {
    /// Allocate the ring and start submitting
    pub fn start(
        device: Arc<Device>,
        interface: u8,
        endpoint: u8,
        bytes_per_frame: usize,
        config: StreamConfig,
    ) -> Result<Self> {
        config.validate()?;

        let buffers = (0..config.num_transfers)
            .map(|_| {
                device.create_iso_write_buffer(
                    interface,
                    endpoint,
                    config.frames_per_transfer,
                    bytes_per_frame,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let first_frame = device.bus_frame_number()? + config.lead_frames;

        let shared = Arc::new(Shared {
            device,
            starts: Mutex::new(vec![None; buffers.len()]),
            buffers,
            frames_per_transfer: config.frames_per_transfer as u64,
            quit: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            failure: Mutex::new(None),
        });

        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("iso-stream".to_string())
            .spawn(move || submit_loop(&worker, first_frame))
            .map_err(|e| Error::Platform {
                code: e.raw_os_error().unwrap_or(-1),
                message: format!("Failed to spawn isochronous stream thread: {}", e),
            })?;

        info!(
            "Isochronous stream started on endpoint {:#04x} at frame {}",
            endpoint, first_frame
        );

        Ok(Self {
            shared,
            bytes_per_frame,
            thread: Some(thread),
        })
    }

    pub fn current_frame_number(&self) -> Result<u64> {
        self.shared.device.bus_frame_number()
    }

    /// Fill one frame of an already queued buffer
    ///
    /// `data` may be shorter than a frame; the rest stays zero. Frames that
    /// are not covered by a queued buffer, or that the bus has already passed,
    /// are reported rather than treated as errors.
    pub fn write_frame(&self, frame: u64, data: &[u8]) -> Result<FrameWrite> {
        if data.len() > self.bytes_per_frame {
            return Err(Error::InvalidArgument(format!(
                "{} bytes do not fit a {} byte frame",
                data.len(),
                self.bytes_per_frame
            )));
        }

        let current = self.current_frame_number()?;
        if frame <= current {
            return Ok(FrameWrite::TooLate);
        }

        let span = self.shared.frames_per_transfer;
        // Held while writing so the slot cannot be recycled underneath us.
        let starts = self.shared.starts();
        let slot = starts.iter().enumerate().find_map(|(index, start)| {
            start
                .filter(|&start| start <= frame && frame < start + span)
                .map(|start| (index, start))
        });

        match slot {
            Some((index, start)) => {
                self.shared.buffers[index].write_frame((frame - start) as usize, data)?;
                Ok(FrameWrite::Written)
            }
            None => {
                let earliest = starts.iter().flatten().min().copied();
                match earliest {
                    Some(earliest) if frame < earliest => Ok(FrameWrite::TooLate),
                    _ => Ok(FrameWrite::TooEarly),
                }
            }
        }
    }

    /// Number of buffers queued so far
    pub fn submitted_transfers(&self) -> u64 {
        self.shared.submitted.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// The error that stopped the stream, if any
    pub fn failure(&self) -> Option<Error> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop submitting and wait for queued transfers to drain
    pub fn stop(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Isochronous stream thread panicked");
            } else {
                info!(
                    "Isochronous stream stopped after {} transfers",
                    self.submitted_transfers()
                );
            }
        }
    }
}

impl Drop for IsochronousStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn submit_loop(shared: &Shared, first_frame: u64) {
    let count = shared.buffers.len();
    let mut handles: Vec<Option<IsoTransferHandle>> = (0..count).map(|_| None).collect();
    let mut submission_frame = first_frame;
    let mut slot = 0;

    while !shared.quit.load(Ordering::Acquire) {
        // Wait on the second oldest transfer rather than the oldest: completion
        // is reported slightly before the hardware has consumed the frames.
        let wait = (slot + 1) % count;
        if let Some(handle) = &handles[wait]
            && let Err(e) = handle.result(true)
        {
            shared.fail(e);
            break;
        }

        shared.starts()[slot] = None;
        let buffer = &shared.buffers[slot];
        buffer.zero();

        match shared.device.submit_iso_at_frame(buffer, submission_frame) {
            Ok(handle) => handles[slot] = Some(handle),
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
        shared.starts()[slot] = Some(submission_frame);
        shared.submitted.fetch_add(1, Ordering::AcqRel);
        debug!("Queued slot {} at frame {}", slot, submission_frame);

        submission_frame += shared.frames_per_transfer;
        slot = (slot + 1) % count;
    }

    for (index, handle) in handles.iter().enumerate() {
        if let Some(handle) = handle
            && let Err(e) = handle.result(true)
        {
            warn!("Queued transfer {} failed while draining: {}", index, e);
        }
    }
}
