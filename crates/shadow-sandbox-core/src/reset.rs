//! Process-wide reset hooks.
//!
//! Code that keeps global state outside any sandbox graph registers a hook
//! here. Hooks run when a sandbox is built and, for reused sandboxes, after
//! every test.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

type ResetHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

static REGISTRY: LazyLock<ResetRegistry> = LazyLock::new(ResetRegistry::default);

#[derive(Default)]
pub struct ResetRegistry {
    hooks: Mutex<Vec<(String, ResetHook)>>,
}

impl ResetRegistry {
    pub fn global() -> &'static ResetRegistry {
        &REGISTRY
    }

    /// Register `hook` under `name`, replacing any hook with the same name.
    pub fn register<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut hooks = self.hooks.lock();
        hooks.retain(|(n, _)| n != &name);
        hooks.push((name, Arc::new(hook)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.hooks.lock();
        let before = hooks.len();
        hooks.retain(|(n, _)| n != name);
        hooks.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Run every hook in registration order. All hooks run even when some
    /// fail; the failures are combined into one error.
    pub fn run_all(&self) -> Result<()> {
        // Hooks may register or unregister other hooks.
        let hooks: Vec<_> = self.hooks.lock().clone();
        let mut failures = Vec::new();
        for (name, hook) in hooks {
            if let Err(e) = hook() {
                warn!(hook = %name, error = %e, "reset hook failed");
                failures.push(format!("{}: {:#}", name, e));
            }
        }
        debug!(failed = failures.len(), "ran reset hooks");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("reset hooks failed: {}", failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_run_all_runs_every_hook() {
        let registry = ResetRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        registry.register("counter", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.register("broken", || Err(anyhow!("cache locked")));
        let c = calls.clone();
        registry.register("after", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = registry.run_all().unwrap_err();
        assert!(err.to_string().contains("broken: cache locked"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_replaces_by_name() {
        let registry = ResetRegistry::default();
        registry.register("a", || Ok(()));
        registry.register("a", || Err(anyhow!("second")));
        assert_eq!(registry.names(), vec!["a".to_string()]);
        assert!(registry.run_all().is_err());
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.run_all().is_ok());
    }
}
