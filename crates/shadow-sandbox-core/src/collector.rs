//! Process-wide collection of background-thread failures.
//!
//! Threads started with [`spawn_background`] inherit the id of the test that
//! spawned them. If such a thread returns an error or panics, the failure is
//! recorded against that test and surfaced when the test reports.

use crate::errors::panic_message;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::LazyLock;
use std::thread::JoinHandle;
use tracing::warn;
use uuid::Uuid;

static COLLECTOR: LazyLock<ExceptionCollector> = LazyLock::new(ExceptionCollector::default);

thread_local! {
    static CURRENT_TEST: Cell<Option<Uuid>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundFailure {
    pub thread: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ExceptionCollector {
    failures: Mutex<HashMap<Uuid, Vec<BackgroundFailure>>>,
}

impl ExceptionCollector {
    pub fn global() -> &'static ExceptionCollector {
        &COLLECTOR
    }

    /// Start collecting for `test`, discarding anything recorded for it before.
    pub fn begin(&self, test: Uuid) {
        self.failures.lock().insert(test, Vec::new());
    }

    pub fn record(&self, test: Uuid, failure: BackgroundFailure) {
        let mut failures = self.failures.lock();
        match failures.get_mut(&test) {
            Some(list) => list.push(failure),
            None => warn!(
                test = %test,
                thread = %failure.thread,
                error = %failure.message,
                "background failure after its test finished reporting"
            ),
        }
    }

    /// Stop collecting for `test` and return what was recorded, oldest first.
    pub fn drain(&self, test: Uuid) -> Vec<BackgroundFailure> {
        self.failures.lock().remove(&test).unwrap_or_default()
    }

    pub fn pending(&self, test: Uuid) -> usize {
        self.failures.lock().get(&test).map_or(0, Vec::len)
    }
}

/// Attributes work on this thread to a test until dropped.
pub struct TestScope {
    previous: Option<Uuid>,
}

impl TestScope {
    pub fn enter(test: Option<Uuid>) -> Self {
        let previous = CURRENT_TEST.with(|c| c.replace(test));
        Self { previous }
    }
}

impl Drop for TestScope {
    fn drop(&mut self) {
        CURRENT_TEST.with(|c| c.set(self.previous));
    }
}

/// Test the current thread is working for.
pub fn current_test() -> Option<Uuid> {
    CURRENT_TEST.with(Cell::get)
}

pub struct BackgroundHandle {
    name: String,
    handle: JoinHandle<()>,
}

impl BackgroundHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread. Its failure, if any, is already recorded.
    pub fn join(self) {
        // The body runs under catch_unwind, so the thread itself cannot panic.
        let _ = self.handle.join();
    }
}

/// Spawn a thread whose failure is attributed to the current test.
pub fn spawn_background<F>(name: impl Into<String>, f: F) -> Result<BackgroundHandle>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let name = name.into();
    let test = current_test();
    let thread_name = name.clone();

    let handle = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let _scope = TestScope::enter(test);
            let message = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            let failure = BackgroundFailure {
                thread: thread_name,
                message,
                at: Utc::now(),
            };
            match test {
                Some(test) => ExceptionCollector::global().record(test, failure),
                None => warn!(
                    thread = %failure.thread,
                    error = %failure.message,
                    "background thread failed outside any test"
                ),
            }
        })
        .with_context(|| format!("failed to spawn background thread '{}'", name))?;

    Ok(BackgroundHandle { name, handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_attributed_to_spawning_test() {
        let collector = ExceptionCollector::global();
        let test = Uuid::new_v4();
        collector.begin(test);

        let _scope = TestScope::enter(Some(test));
        spawn_background("bg-ok", || Ok(())).unwrap().join();
        spawn_background("bg-err", || Err(anyhow::anyhow!("disk full")))
            .unwrap()
            .join();
        spawn_background("bg-panic", || panic!("boom")).unwrap().join();

        let failures = collector.drain(test);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].thread, "bg-err");
        assert!(failures[0].message.contains("disk full"));
        assert!(failures[1].message.contains("boom"));
        assert!(collector.drain(test).is_empty());
    }

    #[test]
    fn test_begin_resets_previous_failures() {
        let collector = ExceptionCollector::default();
        let test = Uuid::new_v4();
        collector.begin(test);
        collector.record(
            test,
            BackgroundFailure {
                thread: "t".to_string(),
                message: "m".to_string(),
                at: Utc::now(),
            },
        );
        assert_eq!(collector.pending(test), 1);
        collector.begin(test);
        assert_eq!(collector.pending(test), 0);
    }

    #[test]
    fn test_scope_restores_previous_test() {
        let outer = Uuid::new_v4();
        let _outer = TestScope::enter(Some(outer));
        {
            let _inner = TestScope::enter(None);
            assert_eq!(current_test(), None);
        }
        assert_eq!(current_test(), Some(outer));
    }
}
