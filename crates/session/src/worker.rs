//! Event thread
//!
//! Dedicated thread that keeps a session's event loop turning, so
//! completions and hot-plug notifications are delivered without the
//! application driving `handle_events` itself. Each pass is bounded by the
//! configured poll interval, which is how often a stop request is noticed
//! when nothing else wakes the native wait.

use crate::session::{Session, SessionInner};
use common::{Error, Result};
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Handle to a running event thread; stops and joins on drop
pub struct EventThread {
    stop: Arc<AtomicBool>,
    session: Weak<SessionInner>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    pub(crate) fn spawn(session: &Session, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let weak = session.downgrade();

        let thread_stop = stop.clone();
        let thread_session = weak.clone();
        let handle = thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || run(thread_session, thread_stop, interval))?;

        Ok(Self {
            stop,
            session: weak,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the thread to exit and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if let Some(session) = Session::upgrade(&self.session) {
            session.interrupt_event_handler();
        }

        // Dropped from one of its own callbacks: it will see the flag and exit
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("USB event thread panicked");
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(session: Weak<SessionInner>, stop: Arc<AtomicBool>, interval: Duration) {
    info!("USB event thread started");

    while !stop.load(Ordering::Acquire) {
        let Some(session) = Session::upgrade(&session) else {
            debug!("Session dropped, event thread exiting");
            break;
        };

        match session.handle_events(Some(interval)) {
            Ok(count) => {
                if count > 0 {
                    trace!("Handled {} USB events", count);
                }
            }
            Err(Error::Interrupted) => {
                // Interrupted, but not fatal - continue
                debug!("USB event handling interrupted");
            }
            Err(Error::SessionClosed) => {
                debug!("Session closed, event thread exiting");
                break;
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                thread::sleep(interval);
            }
        }
    }

    info!("USB event thread stopped");
}
