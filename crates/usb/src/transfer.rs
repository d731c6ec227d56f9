//! Asynchronous transfer lifetime
//!
//! Every asynchronous submission creates one shared state block and splits it
//! into two halves:
//! - a [`Transfer`] handle returned to the caller, and
//! - a [`Completion`] handed to the platform backend, which resolves it from
//!   the device's event thread when the native operation finishes.
//!
//! The block also carries keep-alive references to everything the native
//! operation may still touch (device handle, isochronous buffer). It is freed
//! only when both halves are gone, so a caller may drop its `Device` or its
//! handle at any time without invalidating memory a pending completion writes
//! into.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Final status of a native transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    /// Map a non-`Completed` status to an error; `Completed` yields `None`
    pub fn into_error(self) -> Option<Error> {
        match self {
            TransferStatus::Completed => None,
            TransferStatus::NoDevice => Some(Error::NotFound),
            status => Some(Error::TransferFailed(status)),
        }
    }
}

/// References kept alive for as long as a transfer is outstanding
pub type KeepAlive = Vec<Box<dyn Any + Send + Sync>>;

struct State<T> {
    outcome: Option<Result<T>>,
    /// Dropped together with the state block
    _keep_alive: KeepAlive,
}

struct TransferState<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T> TransferState<T> {
    fn finish(&self, outcome: Result<T>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.outcome.is_none() {
            state.outcome = Some(outcome);
        }
        self.done.notify_all();
    }
}

/// Caller side of an asynchronous transfer
pub struct Transfer<T> {
    shared: Arc<TransferState<T>>,
}

/// Handle to an asynchronous control IN transfer, yielding the data read
pub type TransferHandle = Transfer<Vec<u8>>;

/// Handle to an isochronous transfer, yielding the number of bytes moved
pub type IsoTransferHandle = Transfer<usize>;

/// Handle to an asynchronous control OUT transfer, yielding the bytes written
pub type WriteHandle = Transfer<usize>;

/// Native side of an asynchronous transfer
///
/// Resolving it wakes every waiter on the matching [`Transfer`]. A completion
/// that is dropped without being resolved reports
/// [`TransferStatus::Cancelled`], so waiters never hang.
pub struct Completion<T> {
    shared: Option<Arc<TransferState<T>>>,
}

/// Create the two halves of a new transfer
pub fn transfer_pair<T>(keep_alive: KeepAlive) -> (Transfer<T>, Completion<T>) {
    let shared = Arc::new(TransferState {
        state: Mutex::new(State {
            outcome: None,
            _keep_alive: keep_alive,
        }),
        done: Condvar::new(),
    });
    (
        Transfer {
            shared: shared.clone(),
        },
        Completion {
            shared: Some(shared),
        },
    )
}

impl<T: Clone> Transfer<T> {
    /// Outcome of the transfer
    ///
    /// With `block == false` this returns [`Error::NotFinished`] until the
    /// completion has fired. With `block == true` it waits for it. Once
    /// finished, every call returns the same outcome.
    pub fn result(&self, block: bool) -> Result<T> {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let state = if block {
            self.shared
                .done
                .wait_while(state, |s| s.outcome.is_none())
                .unwrap_or_else(PoisonError::into_inner)
        } else {
            state
        };

        state.outcome.clone().unwrap_or(Err(Error::NotFinished))
    }

    /// Wait up to `timeout` for the outcome
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .shared
            .done
            .wait_timeout_while(state, timeout, |s| s.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.outcome.clone().unwrap_or(Err(Error::NotFinished))
    }
}

impl<T> Transfer<T> {
    pub fn is_finished(&self) -> bool {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outcome
            .is_some()
    }
}

impl<T> Completion<T> {
    /// Resolve the transfer
    pub fn complete(mut self, outcome: Result<T>) {
        if let Some(shared) = self.shared.take() {
            shared.finish(outcome);
        }
    }

    /// Resolve the transfer from a native status and the value it produced
    pub fn complete_with_status(self, status: TransferStatus, value: T) {
        match status.into_error() {
            None => self.complete(Ok(value)),
            Some(err) => self.complete(Err(err)),
        }
    }

    /// True once the caller has dropped its handle
    pub fn is_abandoned(&self) -> bool {
        self.shared
            .as_ref()
            .is_none_or(|shared| Arc::strong_count(shared) == 1)
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            trace!("Completion dropped unresolved; reporting cancellation");
            shared.finish(Err(Error::TransferFailed(TransferStatus::Cancelled)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::thread;

    #[test]
    fn test_not_finished_then_idempotent() {
        let (handle, completion) = transfer_pair::<Vec<u8>>(Vec::new());
        assert_eq!(handle.result(false), Err(Error::NotFinished));
        assert!(!handle.is_finished());

        completion.complete(Ok(vec![1, 2, 3]));
        assert!(handle.is_finished());
        assert_eq!(handle.result(false), Ok(vec![1, 2, 3]));
        assert_eq!(handle.result(true), Ok(vec![1, 2, 3]));
        assert_eq!(handle.result(false), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_blocking_result_waits_for_other_thread() {
        let (handle, completion) = transfer_pair::<usize>(Vec::new());
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completion.complete_with_status(TransferStatus::Completed, 64);
        });
        assert_eq!(handle.result(true), Ok(64));
        worker.join().unwrap();
    }

    #[test]
    fn test_failure_status_maps_to_error() {
        let (handle, completion) = transfer_pair::<usize>(Vec::new());
        completion.complete_with_status(TransferStatus::Stall, 0);
        assert_eq!(
            handle.result(true),
            Err(Error::TransferFailed(TransferStatus::Stall))
        );
    }

    #[test]
    fn test_dropped_completion_reports_cancelled() {
        let (handle, completion) = transfer_pair::<usize>(Vec::new());
        drop(completion);
        assert_eq!(
            handle.result(true),
            Err(Error::TransferFailed(TransferStatus::Cancelled))
        );
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (handle, _completion) = transfer_pair::<usize>(Vec::new());
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(5)),
            Err(Error::NotFinished)
        );
    }

    #[test]
    fn test_keep_alive_released_by_last_holder() {
        let resource = Arc::new(vec![0u8; 16]);
        let weak: Weak<Vec<u8>> = Arc::downgrade(&resource);
        let (handle, completion) = transfer_pair::<usize>(vec![Box::new(resource)]);

        drop(handle);
        assert!(completion.is_abandoned());
        assert!(weak.upgrade().is_some());

        completion.complete(Ok(16));
        assert!(weak.upgrade().is_none());
    }
}
