//! The thread's current execution context.
//!
//! Installing a sandbox swaps it in as the current context and
//! [`ContextGuard`] restores the previous one on every exit path, including
//! unwinding.

use crate::sandbox::SandboxRuntime;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<Arc<SandboxRuntime>>> = const { RefCell::new(None) };
}

/// Restores the previous context when dropped.
#[must_use = "the context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<Arc<SandboxRuntime>>,
}

impl ContextGuard {
    pub fn install(runtime: Arc<SandboxRuntime>) -> Self {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(runtime));
        Self { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

/// Runtime installed on this thread, if any.
pub fn current() -> Option<Arc<SandboxRuntime>> {
    CURRENT.with(|c| c.borrow().clone())
}
