//! Cooperative interruption of the designated thread.
//!
//! The watchdog never touches sandboxed state: it only raises the
//! [`InterruptFlag`] of the designated thread. Code running there observes it
//! through [`check`] and [`sleep`], which fail with [`Interrupted`].

use parking_lot::{Condvar, Mutex};
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

thread_local! {
    static CURRENT_FLAG: RefCell<Option<Arc<InterruptFlag>>> = const { RefCell::new(None) };
}

#[derive(Default)]
pub struct InterruptFlag {
    raised: Mutex<bool>,
    cv: Condvar,
}

impl InterruptFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raise(&self) {
        *self.raised.lock() = true;
        self.cv.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    /// Lower the flag; returns whether it was raised.
    pub fn clear(&self) -> bool {
        std::mem::replace(&mut *self.raised.lock(), false)
    }

    /// Block for up to `timeout`. Returns `true` as soon as the flag is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = self.raised.lock();
        while !*raised {
            if self.cv.wait_until(&mut raised, deadline).timed_out() {
                break;
            }
        }
        *raised
    }
}

impl fmt::Debug for InterruptFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptFlag")
            .field("raised", &self.is_raised())
            .finish()
    }
}

/// Raised on the designated thread when an interrupt is observed.
#[derive(Debug, Clone)]
pub struct Interrupted {
    /// Where the interrupt was observed.
    pub backtrace: String,
}

impl Interrupted {
    fn capture() -> Self {
        Self {
            backtrace: Backtrace::force_capture().to_string(),
        }
    }
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("thread interrupted")
    }
}

impl std::error::Error for Interrupted {}

/// Make `flag` the current thread's interrupt flag.
pub fn install(flag: Arc<InterruptFlag>) {
    CURRENT_FLAG.with(|c| *c.borrow_mut() = Some(flag));
}

pub fn current() -> Option<Arc<InterruptFlag>> {
    CURRENT_FLAG.with(|c| c.borrow().clone())
}

/// Fail with [`Interrupted`] if the current thread has been interrupted.
pub fn check() -> anyhow::Result<()> {
    match current() {
        Some(flag) if flag.is_raised() => Err(Interrupted::capture().into()),
        _ => Ok(()),
    }
}

/// Sleep that wakes early, with [`Interrupted`], when the thread is interrupted.
/// Threads without a flag sleep uninterruptibly.
pub fn sleep(duration: Duration) -> anyhow::Result<()> {
    match current() {
        Some(flag) => {
            if flag.wait_timeout(duration) {
                Err(Interrupted::capture().into())
            } else {
                Ok(())
            }
        }
        None => {
            std::thread::sleep(duration);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_clear() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_raised());
        flag.raise();
        assert!(flag.is_raised());
        assert!(flag.clear());
        assert!(!flag.clear());
    }

    #[test]
    fn test_sleep_wakes_on_interrupt() {
        let flag = InterruptFlag::new();
        let raiser = flag.clone();
        let handle = std::thread::spawn(move || {
            install(flag);
            let started = Instant::now();
            let result = sleep(Duration::from_secs(5));
            (result, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        raiser.raise();

        let (result, elapsed) = handle.join().unwrap();
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<Interrupted>().is_some());
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_check_without_flag_is_ok() {
        let handle = std::thread::spawn(|| check().is_ok());
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_sleep_without_interrupt_completes() {
        let handle = std::thread::spawn(|| {
            install(InterruptFlag::new());
            sleep(Duration::from_millis(5)).is_ok()
        });
        assert!(handle.join().unwrap());
    }
}
