//! The designated thread of a sandbox.
//!
//! Every test body runs on one long-lived thread per sandbox; callers submit
//! work over a channel and block until it completes. Work submitted from the
//! designated thread itself runs inline.

use crate::errors::panic_message;
use crate::interrupt::{self, InterruptFlag};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How submitted work ended.
#[derive(Debug)]
pub enum Completion<R> {
    Finished(R),
    Panicked(String),
    /// The caller stopped waiting; the work may still be running.
    Abandoned,
}

/// Lets a supervisor release the caller blocked on a job.
#[derive(Clone)]
pub struct AbandonHandle {
    release: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl AbandonHandle {
    fn new<F: FnOnce() + Send + 'static>(release: F) -> Self {
        Self {
            release: Arc::new(Mutex::new(Some(Box::new(release)))),
        }
    }

    /// Release the waiting caller with [`Completion::Abandoned`]. Only the
    /// first call has an effect.
    pub fn abandon(&self) {
        if let Some(release) = self.release.lock().take() {
            release();
        }
    }
}

pub struct DesignatedThread {
    name: String,
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
    interrupt: Arc<InterruptFlag>,
    abandoned: AtomicBool,
}

impl DesignatedThread {
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let interrupt = InterruptFlag::new();
        let flag = interrupt.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                interrupt::install(flag);
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .with_context(|| format!("failed to spawn designated thread '{}'", name))?;
        let thread_id = handle.thread().id();
        debug!(thread = %name, "designated thread started");

        Ok(Self {
            name,
            sender: Some(sender),
            handle: Some(handle),
            thread_id,
            interrupt,
            abandoned: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn interrupt_flag(&self) -> &Arc<InterruptFlag> {
        &self.interrupt
    }

    /// Run `work` on the designated thread and wait for it. `work` receives
    /// a handle a supervisor can use to stop the wait early.
    pub fn execute<R, F>(&self, work: F) -> Result<Completion<R>>
    where
        R: Send + 'static,
        F: FnOnce(AbandonHandle) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Completion<R>>();
        let abandon_tx = tx.clone();
        let handle = AbandonHandle::new(move || {
            let _ = abandon_tx.send(Completion::Abandoned);
        });

        let job = move || {
            let completion = match catch_unwind(AssertUnwindSafe(|| work(handle))) {
                Ok(result) => Completion::Finished(result),
                Err(payload) => Completion::Panicked(panic_message(payload.as_ref())),
            };
            // The caller is gone if the job was abandoned.
            let _ = tx.send(completion);
        };

        if self.is_current() {
            job();
        } else {
            let sender = self
                .sender
                .as_ref()
                .ok_or_else(|| anyhow!("designated thread '{}' is shut down", self.name))?;
            sender
                .send(Box::new(job))
                .map_err(|_| anyhow!("designated thread '{}' has stopped", self.name))?;
        }

        rx.recv()
            .with_context(|| format!("designated thread '{}' dropped the job", self.name))
    }

    /// Run `work` on the designated thread and return its result. A panic in
    /// `work` becomes an error.
    pub fn run<R, F>(&self, work: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        match self.execute(move |_| work())? {
            Completion::Finished(result) => Ok(result),
            Completion::Panicked(message) => Err(anyhow!(
                "work panicked on designated thread '{}': {}",
                self.name,
                message
            )),
            Completion::Abandoned => Err(anyhow!(
                "work on designated thread '{}' was abandoned",
                self.name
            )),
        }
    }

    /// The thread is stuck in abandoned work; do not join it on drop.
    pub fn mark_abandoned(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

impl Drop for DesignatedThread {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.sender.take();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.is_abandoned() {
            warn!(thread = %self.name, "leaving abandoned designated thread detached");
            return;
        }
        if self.is_current() {
            return;
        }
        if handle.join().is_err() {
            warn!(thread = %self.name, "designated thread exited with a panic");
        }
    }
}

impl std::fmt::Debug for DesignatedThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesignatedThread")
            .field("name", &self.name)
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_runs_on_designated_thread() {
        let thread = DesignatedThread::spawn("designated-test").unwrap();
        let name = thread
            .run(|| thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(name.as_deref(), Some("designated-test"));
    }

    #[test]
    fn test_panic_becomes_error_and_thread_survives() {
        let thread = DesignatedThread::spawn("designated-panic").unwrap();
        let err = thread.run(|| -> u32 { panic!("kaboom") }).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert_eq!(thread.run(|| 7).unwrap(), 7);
    }

    #[test]
    fn test_interrupt_flag_installed_on_thread() {
        let thread = DesignatedThread::spawn("designated-flag").unwrap();
        let flag = thread.interrupt_flag().clone();
        let seen = thread
            .run(move || interrupt::current().is_some_and(|f| Arc::ptr_eq(&f, &flag)))
            .unwrap();
        assert!(seen);
    }

    #[test]
    fn test_abandon_releases_caller() {
        let thread = DesignatedThread::spawn("designated-abandon").unwrap();
        let completion = thread
            .execute(|abandon| {
                abandon.abandon();
                std::thread::sleep(Duration::from_millis(50));
                1
            })
            .unwrap();
        assert!(matches!(completion, Completion::Abandoned));
    }
}
