//! Per-device event thread
//!
//! Native completions are delivered on a dedicated thread owned by each opened
//! device. The thread repeatedly runs a pump closure supplied by the backend
//! (for libusb, `handle_events` with a short timeout) until it is told to stop.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// A running event thread
///
/// [`EventContext::start`] returns only once the thread is up. Stopping (or
/// dropping) signals the thread and joins it, so no completion runs after
/// the context is gone.
pub struct EventContext {
    name: String,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventContext {
    /// Spawn the thread and wait until it is running
    ///
    /// `pump` must return regularly so the stop flag gets checked.
    pub fn start<F>(name: &str, mut pump: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel();

        let flag = running.clone();
        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                debug!("Event thread {} started", thread_name);
                while flag.load(Ordering::Acquire) {
                    pump();
                }
                debug!("Event thread {} stopped", thread_name);
            })
            .map_err(|e| Error::Platform {
                code: e.raw_os_error().unwrap_or(-1),
                message: format!("Failed to spawn event thread: {}", e),
            })?;

        ready_rx.recv().map_err(|_| Error::Platform {
            code: -1,
            message: "Event thread exited before becoming ready".to_string(),
        })?;
        info!("Event context {} ready", name);

        Ok(Self {
            name: name.to_string(),
            running,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.running.load(Ordering::Acquire)
    }

    /// Signal the thread and wait for it to finish
    ///
    /// When called from the event thread itself (the last reference to the
    /// device was released inside a completion) the thread is left to exit on
    /// its own instead of joining itself.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return;
        };

        if thread.thread().id() == thread::current().id() {
            debug!("Event context {} stopped from its own thread", self.name);
            return;
        }

        if thread.join().is_err() {
            error!("Event thread {} panicked", self.name);
        } else {
            info!("Event context {} stopped", self.name);
        }
    }
}

impl Drop for EventContext {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_start_runs_pump_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut context = EventContext::start("test-events", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
        })
        .unwrap();

        assert!(context.is_running());
        thread::sleep(Duration::from_millis(20));
        context.stop();
        assert!(!context.is_running());

        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_thread_is_named() {
        let (tx, rx) = mpsc::channel();
        let context = EventContext::start("named-events", move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
            thread::sleep(Duration::from_millis(1));
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("named-events"));
        drop(context);
    }

    #[test]
    fn test_drop_on_own_thread_does_not_deadlock() {
        let slot: Arc<std::sync::Mutex<Option<EventContext>>> = Arc::default();
        let inner = slot.clone();
        let (done_tx, done_rx) = mpsc::channel();

        let context = EventContext::start("self-drop", move || {
            if let Some(context) = inner.lock().unwrap().take() {
                drop(context);
                let _ = done_tx.send(());
            }
            thread::sleep(Duration::from_millis(1));
        })
        .unwrap();
        *slot.lock().unwrap() = Some(context);

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
