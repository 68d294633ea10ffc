//! Call-site interceptors.
//!
//! Interceptors replace members the sandbox cannot meaningfully emulate
//! (clocks, device drivers, host logging). They are consulted before the
//! dispatch table and always win over overrides. The default registry is
//! built once per process and shared by every sandbox.

use crate::classes::{body, MemberBody};
use crate::dispatcher::CallContext;
use shadow_sandbox_types::{MemberSignature, MethodRef, TypeName, Value, CONSTRUCTOR};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

pub const SYSTEM_CLOCK: &str = "platform.SystemClock";
pub const DEVICE_DRIVER: &str = "platform.hardware.DeviceDriver";
pub const LOG: &str = "platform.util.Log";
pub const HOST_SYSTEM: &str = "std.System";

static DEFAULT_INTERCEPTORS: LazyLock<Arc<Interceptors>> =
    LazyLock::new(|| Arc::new(build_default_interceptors()));

/// A registered replacement.
#[derive(Clone)]
pub struct Interceptor {
    pub method: MethodRef,
    pub behavior: MemberBody,
}

/// Immutable set of interceptors. Exact member entries beat wildcard entries.
#[derive(Clone, Default)]
pub struct Interceptors {
    entries: Vec<Interceptor>,
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide default registry.
    pub fn defaults() -> Arc<Interceptors> {
        DEFAULT_INTERCEPTORS.clone()
    }

    pub fn with<F>(mut self, method: MethodRef, f: F) -> Self
    where
        F: Fn(&CallContext, &[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.entries.push(Interceptor {
            method,
            behavior: body(f),
        });
        self
    }

    /// Copy of `self` where every ref without a registered behavior becomes a
    /// no-op returning the member's default value.
    pub fn extended_with_no_ops<'a, I>(&self, refs: I) -> Interceptors
    where
        I: IntoIterator<Item = &'a MethodRef>,
    {
        let mut extended = self.clone();
        for method in refs {
            if !self.entries.iter().any(|e| &e.method == method) {
                extended.entries.push(Interceptor {
                    method: method.clone(),
                    behavior: body(no_op),
                });
            }
        }
        extended
    }

    pub fn find(&self, class: &TypeName, signature: &MemberSignature) -> Option<&MemberBody> {
        if signature.name() == CONSTRUCTOR {
            return None;
        }
        let mut wildcard = None;
        for entry in &self.entries {
            if &entry.method.class != class {
                continue;
            }
            if entry.method.member == signature.name() {
                return Some(&entry.behavior);
            }
            if entry.method.is_wildcard() && wildcard.is_none() {
                wildcard = Some(&entry.behavior);
            }
        }
        wildcard
    }

    pub fn method_refs(&self) -> impl Iterator<Item = &MethodRef> {
        self.entries.iter().map(|e| &e.method)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| e.method.to_string()))
            .finish()
    }
}

fn no_op(ctx: &CallContext, _args: &[Value]) -> anyhow::Result<Value> {
    Ok(ctx.default_return())
}

fn build_default_interceptors() -> Interceptors {
    let clock = |member: &str| MethodRef::new(SYSTEM_CLOCK, member);

    Interceptors::new()
        // ============================================================
        // Time: served from the sandbox clock, never the host clock
        // ============================================================
        .with(clock("uptimeMillis"), |ctx, _| {
            Ok(Value::Int(ctx.clock().uptime_millis() as i64))
        })
        .with(clock("currentTimeMillis"), |ctx, _| {
            Ok(Value::Int(ctx.clock().current_time_millis() as i64))
        })
        .with(clock("nanoTime"), |ctx, _| {
            Ok(Value::Int(ctx.clock().nano_time() as i64))
        })
        .with(clock("sleep"), |ctx, args| {
            let ms = args.first().and_then(Value::as_int).unwrap_or(0).max(0);
            ctx.clock().advance(Duration::from_millis(ms as u64));
            Ok(Value::Unit)
        })
        // ============================================================
        // Hardware: physical no-ops in the sandbox
        // ============================================================
        .with(MethodRef::all(DEVICE_DRIVER), no_op)
        // ============================================================
        // Host bridges
        // ============================================================
        .with(MethodRef::new(LOG, "println"), |ctx, args| {
            let rendered: Vec<String> = args
                .iter()
                .map(|a| match a {
                    Value::Str(s) => s.clone(),
                    other => format!("{other:?}"),
                })
                .collect();
            tracing::debug!(
                target: "shadow_sandbox::platform_log",
                sandbox = %ctx.sandbox_id(),
                "{}",
                rendered.join(" ")
            );
            Ok(Value::Int(rendered.iter().map(String::len).sum::<usize>() as i64))
        })
        .with(MethodRef::new(HOST_SYSTEM, "identityHashCode"), |_, args| {
            Ok(match args.first() {
                Some(Value::Object(obj)) => Value::Int(obj.id() as i64),
                _ => Value::Int(0),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_beats_wildcard() {
        let registry = Interceptors::new()
            .with(MethodRef::all("platform.Foo"), |_, _| Ok(Value::str("wildcard")))
            .with(MethodRef::new("platform.Foo", "bar"), |_, _| Ok(Value::str("exact")));
        let foo = TypeName::new("platform.Foo");
        let bar = registry.find(&foo, &MemberSignature::nullary("bar")).unwrap();
        let other = registry.find(&foo, &MemberSignature::nullary("baz")).unwrap();
        assert!(!Arc::ptr_eq(bar, other));
        assert!(registry
            .find(&TypeName::new("platform.Other"), &MemberSignature::nullary("bar"))
            .is_none());
    }

    #[test]
    fn test_constructors_never_intercepted() {
        let registry = Interceptors::new().with(MethodRef::all("platform.Foo"), no_op);
        assert!(registry
            .find(&TypeName::new("platform.Foo"), &MemberSignature::constructor(["int"]))
            .is_none());
    }

    #[test]
    fn test_defaults_cover_clock_and_drivers() {
        let defaults = Interceptors::defaults();
        let clock = TypeName::new(SYSTEM_CLOCK);
        assert!(defaults.find(&clock, &MemberSignature::nullary("uptimeMillis")).is_some());
        assert!(defaults.find(&clock, &MemberSignature::nullary("elapsedRealtime")).is_none());
        assert!(defaults
            .find(&TypeName::new(DEVICE_DRIVER), &MemberSignature::new("write", ["bytes"]))
            .is_some());
        assert!(Arc::ptr_eq(&defaults, &Interceptors::defaults()));
    }

    #[test]
    fn test_extended_with_no_ops_keeps_existing_behavior() {
        let base = Interceptors::new().with(MethodRef::new("platform.A", "m"), no_op);
        let refs = [MethodRef::new("platform.A", "m"), MethodRef::new("platform.B", "n")];
        let extended = base.extended_with_no_ops(refs.iter());
        assert_eq!(extended.len(), 2);
        assert_eq!(base.len(), 1);
    }
}
