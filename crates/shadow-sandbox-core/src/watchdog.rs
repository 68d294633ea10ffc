//! Timeout supervision for test bodies.
//!
//! A watchdog thread waits for the body to finish. When the deadline passes
//! first it raises the designated thread's interrupt flag; if the body is
//! still running after the grace period it escalates, which releases the
//! blocked caller and leaves the designated thread abandoned. A running
//! thread is never killed.

use crate::interrupt::InterruptFlag;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

/// What the watchdog did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchdogReport {
    pub timed_out: bool,
    pub escalated: bool,
}

pub struct Watchdog {
    cancel: mpsc::Sender<()>,
    handle: Option<JoinHandle<WatchdogReport>>,
    fired: Arc<AtomicBool>,
    timeout: Duration,
}

impl Watchdog {
    /// Start supervising. `escalate` runs on the watchdog thread if the body
    /// ignores the interrupt for `grace` after the deadline.
    pub fn start<F>(
        timeout: Duration,
        grace: Duration,
        interrupt: Arc<InterruptFlag>,
        escalate: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = fired.clone();

        let handle = thread::Builder::new()
            .name("shadow-sandbox-watchdog".to_string())
            .spawn(move || {
                let mut report = WatchdogReport::default();
                match cancelled.recv_timeout(timeout) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return report,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                report.timed_out = true;
                fired_flag.store(true, Ordering::SeqCst);
                interrupt.raise();

                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(grace) {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        grace_ms = grace.as_millis() as u64,
                        "test body ignored interrupt, abandoning designated thread"
                    );
                    report.escalated = true;
                    escalate();
                }
                report
            })
            .context("failed to spawn watchdog thread")?;

        Ok(Self {
            cancel,
            handle: Some(handle),
            fired,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the deadline has passed.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Stop supervising and collect the report. Always call this once the
    /// body returns.
    pub fn stop(mut self) -> WatchdogReport {
        self.finish()
    }

    fn finish(&mut self) -> WatchdogReport {
        let _ = self.cancel.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("watchdog thread panicked");
                WatchdogReport {
                    timed_out: self.has_fired(),
                    escalated: false,
                }
            }),
            None => WatchdogReport {
                timed_out: self.has_fired(),
                escalated: false,
            },
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.finish();
        }
    }
}
