//! Runtime dispatch for rewritten call-sites.
//!
//! Every call into a sandboxed member is described by an [`InvocationProfile`]
//! and turned into a [`Plan`]:
//!
//! 1. a matching interceptor always wins;
//! 2. members of types that are not instrumented run their original body;
//! 3. otherwise the active [`DispatchTable`] is consulted: a resolved override
//!    member runs, an override without the member either calls through or does
//!    nothing, and no override calls the original.
//!
//! Plans are cached per `(class, signature)` and the cache is dropped whenever
//! the sandbox is reconfigured.

use crate::classes::{MemberBody, MemberKind};
use crate::clock::SandboxClock;
use crate::collector::{self, BackgroundHandle};
use crate::context::{self, ContextGuard};
use crate::dispatch_table::{DispatchTable, MatchKind, MemberResolution};
use crate::errors::SandboxError;
use crate::interceptors::Interceptors;
use crate::interrupt;
use crate::overrides::{OverrideDef, OverrideMember};
use crate::sandbox::SandboxRuntime;
use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use shadow_sandbox_types::{
    MemberSignature, ObjectRef, SdkLevel, StaticFields, TypeName, Value,
};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Maximum number of cached plans per sandbox.
pub const PLAN_CACHE_CAPACITY: usize = 500;

type PlanKey = (TypeName, MemberSignature);

/// Describes one intercepted call. Built at the call-site and consumed
/// immediately.
#[derive(Debug, Clone)]
pub struct InvocationProfile {
    /// Class declaring the member.
    pub class: TypeName,
    pub signature: MemberSignature,
    pub kind: MemberKind,
    pub returns: TypeName,
    /// Whether the declaring class was rewritten for dispatch.
    pub instrumented: bool,
}

impl InvocationProfile {
    pub fn is_static(&self) -> bool {
        self.kind.is_static()
    }
}

impl fmt::Display for InvocationProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.signature)
    }
}

/// What to do for a call.
#[derive(Clone)]
pub enum Plan {
    Intercept(MemberBody),
    Override {
        declared_by: Arc<OverrideDef>,
        member: Arc<OverrideMember>,
        via: MatchKind,
    },
    CallOriginal,
    /// Return the member's default value without running anything.
    DoNothing,
}

impl Plan {
    pub fn label(&self) -> &'static str {
        match self {
            Plan::Intercept(_) => "intercept",
            Plan::Override { .. } => "override",
            Plan::CallOriginal => "call-original",
            Plan::DoNothing => "do-nothing",
        }
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Override {
                declared_by,
                member,
                via,
            } => f
                .debug_struct("Override")
                .field("declared_by", &declared_by.name)
                .field("member", &member.signature.to_string())
                .field("via", via)
                .finish(),
            other => f.write_str(other.label()),
        }
    }
}

struct DispatchState {
    table: DispatchTable,
    interceptors: Arc<Interceptors>,
}

/// Per-sandbox dispatcher: the active table, the interceptor registry and
/// the plan cache.
pub struct Dispatcher {
    sdk: SdkLevel,
    state: RwLock<DispatchState>,
    plans: Mutex<LruCache<PlanKey, Plan>>,
}

impl Dispatcher {
    pub fn new(sdk: SdkLevel) -> Self {
        let capacity = NonZeroUsize::new(PLAN_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            sdk,
            state: RwLock::new(DispatchState {
                table: DispatchTable::new(),
                interceptors: Arc::new(Interceptors::new()),
            }),
            plans: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn sdk(&self) -> SdkLevel {
        self.sdk
    }

    /// Swap in a new table and registry. Cached plans are discarded.
    pub fn configure(&self, table: DispatchTable, interceptors: Arc<Interceptors>) {
        let mut state = self.state.write();
        debug!(
            version = table.version(),
            overrides = table.len(),
            interceptors = interceptors.len(),
            "configured dispatcher"
        );
        state.table = table;
        state.interceptors = interceptors;
        self.plans.lock().clear();
    }

    pub fn table(&self) -> DispatchTable {
        self.state.read().table.clone()
    }

    pub fn interceptors(&self) -> Arc<Interceptors> {
        self.state.read().interceptors.clone()
    }

    pub fn cached_plans(&self) -> usize {
        self.plans.lock().len()
    }

    /// Plan for `profile`, computed on first use. Contract violations are
    /// returned as errors and never cached.
    pub fn plan_for(&self, profile: &InvocationProfile) -> Result<Plan, SandboxError> {
        // Held until the plan is cached: a concurrent `configure` must not
        // clear the cache between computing and inserting.
        let state = self.state.read();
        let key = (profile.class.clone(), profile.signature.clone());
        if let Some(plan) = self.plans.lock().get(&key) {
            return Ok(plan.clone());
        }

        let plan = self.compute_plan(&state, profile)?;
        debug!(call = %profile, plan = ?plan, "computed dispatch plan");
        self.plans.lock().put(key, plan.clone());
        Ok(plan)
    }

    fn compute_plan(
        &self,
        state: &DispatchState,
        profile: &InvocationProfile,
    ) -> Result<Plan, SandboxError> {
        if let Some(behavior) = state.interceptors.find(&profile.class, &profile.signature) {
            return Ok(Plan::Intercept(behavior.clone()));
        }
        if !profile.instrumented {
            return Ok(Plan::CallOriginal);
        }

        match state
            .table
            .resolve_member(&profile.class, &profile.signature, self.sdk)
        {
            MemberResolution::Member {
                declared_by,
                member,
                via,
                ..
            } => {
                check_contract(profile, &declared_by, &member)?;
                Ok(Plan::Override {
                    declared_by,
                    member,
                    via,
                })
            }
            // A missing `<clinit>` never skips the real static initializer.
            MemberResolution::NoMember { .. } if profile.signature.is_static_initializer() => {
                Ok(Plan::CallOriginal)
            }
            MemberResolution::NoMember { active } if active.call_through_by_default => {
                Ok(Plan::CallOriginal)
            }
            MemberResolution::NoMember { .. } => Ok(Plan::DoNothing),
            MemberResolution::NoOverride => Ok(Plan::CallOriginal),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sdk", &self.sdk)
            .field("table", &self.table())
            .field("cached_plans", &self.cached_plans())
            .finish()
    }
}

fn check_contract(
    profile: &InvocationProfile,
    declared_by: &OverrideDef,
    member: &OverrideMember,
) -> Result<(), SandboxError> {
    let mismatch = |reason: String| SandboxError::SignatureMismatch {
        target: profile.class.clone(),
        member: profile.signature.clone(),
        override_name: declared_by.name.clone(),
        reason,
    };

    // A static override member may stand in for an instance member; the
    // receiver is simply not passed. The reverse has no receiver to bind.
    if profile.is_static() && !member.is_static {
        return Err(mismatch(if profile.signature.is_static_initializer() {
            "static initializer override is not static".to_string()
        } else {
            "instance member cannot override a static member".to_string()
        }));
    }
    if let Some(returns) = &member.returns {
        if returns != &profile.returns && !returns.is_generic() && !profile.returns.is_generic() {
            return Err(mismatch(format!(
                "returns {} but the target returns {}",
                returns, profile.returns
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Call context
// =============================================================================

struct Frame {
    profile: InvocationProfile,
    this: Option<ObjectRef>,
    /// Set while an override member runs.
    override_name: Option<String>,
}

/// Handle passed to every member body, interceptor and test hook.
///
/// It is the only way sandboxed code reaches other sandboxed code: every call
/// made through it is routed through the sandbox's dispatcher.
#[derive(Clone)]
pub struct CallContext {
    runtime: Arc<SandboxRuntime>,
    frame: Option<Arc<Frame>>,
}

impl CallContext {
    pub(crate) fn root(runtime: Arc<SandboxRuntime>) -> Self {
        Self {
            runtime,
            frame: None,
        }
    }

    pub(crate) fn framed(
        &self,
        profile: InvocationProfile,
        this: Option<ObjectRef>,
        override_name: Option<String>,
    ) -> Self {
        Self {
            runtime: self.runtime.clone(),
            frame: Some(Arc::new(Frame {
                profile,
                this,
                override_name,
            })),
        }
    }

    /// Context of the sandbox installed on this thread, if any.
    pub fn current() -> Option<Self> {
        context::current().map(Self::root)
    }

    pub fn sandbox_id(&self) -> Uuid {
        self.runtime.id()
    }

    pub fn sdk(&self) -> SdkLevel {
        self.runtime.sdk()
    }

    pub fn clock(&self) -> &SandboxClock {
        self.runtime.clock()
    }

    /// Opaque resource and manifest data supplied when the sandbox was built.
    pub fn environment(&self) -> &serde_json::Value {
        self.runtime.environment()
    }

    pub fn platform_artifact(&self) -> Option<&Path> {
        self.runtime.platform_artifact()
    }

    /// The call being executed, if any.
    pub fn profile(&self) -> Option<&InvocationProfile> {
        self.frame.as_ref().map(|f| &f.profile)
    }

    /// Receiver of the current call.
    pub fn this(&self) -> Result<&ObjectRef> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| anyhow!("no call in progress"))?;
        frame
            .this
            .as_ref()
            .ok_or_else(|| anyhow!("{} has no receiver", frame.profile))
    }

    /// Default value of the current member's return type.
    pub fn default_return(&self) -> Value {
        self.profile()
            .map(|p| Value::default_for(&p.returns))
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Create an instance of `class`, picking the constructor whose arity
    /// matches `args`.
    pub fn new_instance(&self, class: &str, args: &[Value]) -> Result<ObjectRef> {
        self.runtime
            .new_instance(&TypeName::new(class), None, args)
    }

    /// Create an instance through an explicit constructor, e.g. `"<init>(int)"`.
    pub fn new_instance_with(&self, class: &str, constructor: &str, args: &[Value]) -> Result<ObjectRef> {
        let signature: MemberSignature = constructor.parse()?;
        self.runtime
            .new_instance(&TypeName::new(class), Some(&signature), args)
    }

    /// Virtual call: the member is looked up from the receiver's runtime class
    /// upwards.
    pub fn invoke(&self, target: &ObjectRef, signature: &str, args: &[Value]) -> Result<Value> {
        let signature: MemberSignature = signature.parse()?;
        self.runtime
            .invoke_instance(target.class(), target, &signature, args)
    }

    /// Non-virtual call starting at `class`, e.g. a call to a superclass
    /// implementation.
    pub fn invoke_special(
        &self,
        class: &str,
        target: &ObjectRef,
        signature: &str,
        args: &[Value],
    ) -> Result<Value> {
        let signature: MemberSignature = signature.parse()?;
        self.runtime
            .invoke_instance(&TypeName::new(class), target, &signature, args)
    }

    pub fn invoke_static(&self, class: &str, signature: &str, args: &[Value]) -> Result<Value> {
        let signature: MemberSignature = signature.parse()?;
        self.runtime
            .invoke_static(&TypeName::new(class), &signature, args)
    }

    /// Run the original body of the member being executed, bypassing every
    /// override and interceptor.
    pub fn call_through(&self, args: &[Value]) -> Result<Value> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| anyhow!("call_through outside of a dispatched call"))?;
        self.runtime
            .call_through(&frame.profile, frame.this.clone(), args)
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    pub fn get_static(&self, class: &str, field: &str) -> Result<Value> {
        Ok(self.runtime.bootstrap(&TypeName::new(class))?.statics.get(field))
    }

    /// Returns the previous value.
    pub fn set_static(&self, class: &str, field: &str, value: Value) -> Result<Option<Value>> {
        Ok(self
            .runtime
            .bootstrap(&TypeName::new(class))?
            .statics
            .set(field, value))
    }

    /// Static state owned by the override currently executing. Cleared by the
    /// override's resetter.
    pub fn override_statics(&self) -> Result<Arc<StaticFields>> {
        let name = self
            .frame
            .as_ref()
            .and_then(|f| f.override_name.as_deref())
            .ok_or_else(|| anyhow!("override statics are only reachable from an override"))?;
        Ok(self.runtime.graph().override_statics(name))
    }

    /// Field of the shadow state bound to the receiver.
    pub fn shadow_get(&self, field: &str) -> Result<Value> {
        Ok(self.this()?.shadow_get(field))
    }

    pub fn shadow_set(&self, field: &str, value: Value) -> Result<()> {
        let this = self.this()?;
        if this.shadow_set(field, value) {
            Ok(())
        } else {
            Err(anyhow!("{} has no shadow state", this.class()))
        }
    }

    // -------------------------------------------------------------------------
    // Threads
    // -------------------------------------------------------------------------

    /// Fails with [`interrupt::Interrupted`] when the test has been interrupted.
    pub fn check_interrupted(&self) -> Result<()> {
        interrupt::check()
    }

    /// Interruptible sleep on real time.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        interrupt::sleep(duration)
    }

    /// Start a background thread running inside this sandbox. Its failure is
    /// reported against the current test.
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<BackgroundHandle>
    where
        F: FnOnce(CallContext) -> Result<()> + Send + 'static,
    {
        let runtime = self.runtime.clone();
        collector::spawn_background(name, move || {
            let _guard = ContextGuard::install(runtime.clone());
            f(CallContext::root(runtime))
        })
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("sandbox", &self.runtime.id())
            .field("call", &self.profile().map(ToString::to_string))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::body;
    use shadow_sandbox_types::MethodRef;

    fn profile(class: &str, sig: &str, kind: MemberKind, returns: &str) -> InvocationProfile {
        InvocationProfile {
            class: TypeName::new(class),
            signature: sig.parse().unwrap(),
            kind,
            returns: TypeName::new(returns),
            instrumented: true,
        }
    }

    fn dispatcher_with(defs: Vec<OverrideDef>, interceptors: Interceptors) -> Dispatcher {
        let dispatcher = Dispatcher::new(30);
        dispatcher.configure(
            DispatchTable::from_overrides(defs.into_iter().map(Arc::new)),
            Arc::new(interceptors),
        );
        dispatcher
    }

    #[test]
    fn test_interceptor_beats_override() {
        let def = OverrideDef::new("ShadowClock", "platform.SystemClock")
            .static_member("uptimeMillis()", |_, _| Ok(Value::Int(1)))
            .unwrap();
        let interceptors = Interceptors::new()
            .with(MethodRef::new("platform.SystemClock", "uptimeMillis"), |_, _| {
                Ok(Value::Int(2))
            });
        let dispatcher = dispatcher_with(vec![def], interceptors);
        let plan = dispatcher
            .plan_for(&profile("platform.SystemClock", "uptimeMillis()", MemberKind::Static, "long"))
            .unwrap();
        assert!(matches!(plan, Plan::Intercept(_)));
    }

    #[test]
    fn test_call_through_by_default_controls_missing_members() {
        let calling = OverrideDef::new("ShadowA", "platform.A");
        let silent = OverrideDef::new("ShadowB", "platform.B").with_call_through_by_default(false);
        let dispatcher = dispatcher_with(vec![calling, silent], Interceptors::new());

        let a = dispatcher
            .plan_for(&profile("platform.A", "run()", MemberKind::Instance, "void"))
            .unwrap();
        let b = dispatcher
            .plan_for(&profile("platform.B", "run()", MemberKind::Instance, "void"))
            .unwrap();
        assert!(matches!(a, Plan::CallOriginal));
        assert!(matches!(b, Plan::DoNothing));
    }

    #[test]
    fn test_uninstrumented_calls_original() {
        let def = OverrideDef::new("ShadowA", "platform.A")
            .member("run()", |_, _| Ok(Value::Unit))
            .unwrap();
        let dispatcher = dispatcher_with(vec![def], Interceptors::new());
        let mut p = profile("platform.A", "run()", MemberKind::Instance, "void");
        p.instrumented = false;
        assert!(matches!(dispatcher.plan_for(&p).unwrap(), Plan::CallOriginal));
    }

    #[test]
    fn test_contract_violations_are_not_cached() {
        let def = OverrideDef::new("ShadowBuild", "platform.os.Build")
            .member("getSerial()", |_, _| Ok(Value::str("x")))
            .unwrap()
            .with_member(
                OverrideMember::new(
                    "getRadioVersion()".parse().unwrap(),
                    body(|_, _| Ok(Value::Int(1))),
                )
                .with_static(true)
                .with_returns("int"),
            );
        let dispatcher = dispatcher_with(vec![def], Interceptors::new());

        let err = dispatcher
            .plan_for(&profile("platform.os.Build", "getSerial()", MemberKind::Static, "string"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::SignatureMismatch { .. }));
        let rendered = err.to_string();
        assert!(rendered.contains("platform.os.Build"));
        assert!(rendered.contains("getSerial()"));

        let err = dispatcher
            .plan_for(&profile(
                "platform.os.Build",
                "getRadioVersion()",
                MemberKind::Static,
                "string",
            ))
            .unwrap_err();
        assert!(err.to_string().contains("returns int"));
        assert_eq!(dispatcher.cached_plans(), 0);
    }

    #[test]
    fn test_static_override_member_may_replace_instance_member() {
        let def = OverrideDef::new("ShadowQueue", "platform.os.MessageQueue")
            .static_member("nativeInit()", |_, _| Ok(Value::Int(7)))
            .unwrap();
        let dispatcher = dispatcher_with(vec![def], Interceptors::new());
        let plan = dispatcher
            .plan_for(&profile(
                "platform.os.MessageQueue",
                "nativeInit()",
                MemberKind::Instance,
                "long",
            ))
            .unwrap();
        assert!(matches!(plan, Plan::Override { via: MatchKind::Exact, .. }));
    }

    #[test]
    fn test_configure_clears_plan_cache() {
        let dispatcher = dispatcher_with(vec![], Interceptors::new());
        dispatcher
            .plan_for(&profile("platform.A", "run()", MemberKind::Instance, "void"))
            .unwrap();
        assert_eq!(dispatcher.cached_plans(), 1);

        let def = OverrideDef::new("ShadowA", "platform.A")
            .member("run()", |_, _| Ok(Value::Unit))
            .unwrap();
        dispatcher.configure(
            DispatchTable::from_overrides([Arc::new(def)]),
            Arc::new(Interceptors::new()),
        );
        assert_eq!(dispatcher.cached_plans(), 0);
        let plan = dispatcher
            .plan_for(&profile("platform.A", "run()", MemberKind::Instance, "void"))
            .unwrap();
        assert!(matches!(plan, Plan::Override { .. }));
    }

    #[test]
    fn test_missing_static_initializer_runs_original() {
        let silent = OverrideDef::new("SilentBuild", "platform.os.Build")
            .with_call_through_by_default(false);
        let dispatcher = dispatcher_with(vec![silent], Interceptors::new());

        let clinit = dispatcher
            .plan_for(&profile("platform.os.Build", "<clinit>()", MemberKind::StaticInit, "void"))
            .unwrap();
        let other = dispatcher
            .plan_for(&profile("platform.os.Build", "getSerial()", MemberKind::Static, "string"))
            .unwrap();
        assert!(matches!(clinit, Plan::CallOriginal));
        assert!(matches!(other, Plan::DoNothing));
    }

    #[test]
    fn test_instance_static_initializer_override_is_rejected() {
        let def = OverrideDef::new("ShadowBuild", "platform.os.Build")
            .member("<clinit>()", |_, _| Ok(Value::Unit))
            .unwrap();
        let dispatcher = dispatcher_with(vec![def], Interceptors::new());
        let err = dispatcher
            .plan_for(&profile("platform.os.Build", "<clinit>()", MemberKind::StaticInit, "void"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::SignatureMismatch { .. }));
        assert!(err.to_string().contains("is not static"));
    }

    #[test]
    fn test_plans_never_outlive_a_concurrent_configure() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let old_table = || {
            let def = OverrideDef::new("OldA", "platform.A")
                .member("run()", |_, _| Ok(Value::Unit))
                .unwrap();
            DispatchTable::from_overrides([Arc::new(def)])
        };
        let dispatcher = Arc::new(dispatcher_with(vec![], Interceptors::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let run = profile("platform.A", "run()", MemberKind::Instance, "void");

        let planner = {
            let dispatcher = dispatcher.clone();
            let stop = stop.clone();
            let run = run.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    dispatcher.plan_for(&run).unwrap();
                }
            })
        };
        for _ in 0..200 {
            dispatcher.configure(old_table(), Arc::new(Interceptors::new()));
            dispatcher.configure(DispatchTable::new(), Arc::new(Interceptors::new()));
        }
        stop.store(true, Ordering::SeqCst);
        planner.join().unwrap();

        // The last table has no override, so no cached plan may name one.
        assert!(matches!(dispatcher.plan_for(&run).unwrap(), Plan::CallOriginal));
    }

    #[test]
    fn test_plan_cache_is_bounded() {
        let dispatcher = dispatcher_with(vec![], Interceptors::new());
        for i in 0..(PLAN_CACHE_CAPACITY + 20) {
            dispatcher
                .plan_for(&profile("platform.A", &format!("m{}()", i), MemberKind::Instance, "void"))
                .unwrap();
        }
        assert_eq!(dispatcher.cached_plans(), PLAN_CACHE_CAPACITY);
    }
}
