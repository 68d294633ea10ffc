//! Sandboxes.
//!
//! A [`Sandbox`] owns one isolated graph, one dispatcher and one designated
//! thread. Dropping the sandbox drops the graph, and with it every static
//! value its classes ever held.

use crate::classes::{ClassPath, MemberKind};
use crate::clock::SandboxClock;
use crate::config::Configuration;
use crate::context::ContextGuard;
use crate::designated::{AbandonHandle, Completion, DesignatedThread};
use crate::dispatch_table::DispatchTable;
use crate::dispatcher::{CallContext, Dispatcher, InvocationProfile, Plan};
use crate::errors::{panic_message, SandboxError};
use crate::graph::{IsolatedGraph, LoadedClass};
use crate::interceptors::Interceptors;
use crate::interrupt::InterruptFlag;
use crate::overrides::OverrideDef;
use crate::reset::ResetRegistry;
use crate::rewriter::{EntryPoint, RewrittenMember};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use shadow_sandbox_types::{Instance, MemberSignature, ObjectRef, SdkLevel, TypeName, Value, LATEST_SDK};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deepest superclass chain walked during member lookup.
const MAX_HIERARCHY_DEPTH: usize = 256;

// =============================================================================
// Runtime
// =============================================================================

/// The state shared by every call made inside one sandbox.
pub struct SandboxRuntime {
    id: Uuid,
    sdk: SdkLevel,
    graph: IsolatedGraph,
    dispatcher: Dispatcher,
    clock: SandboxClock,
    environment: serde_json::Value,
    platform_artifact: Option<PathBuf>,
}

impl SandboxRuntime {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sdk(&self) -> SdkLevel {
        self.sdk
    }

    pub fn graph(&self) -> &IsolatedGraph {
        &self.graph
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn clock(&self) -> &SandboxClock {
        &self.clock
    }

    pub fn environment(&self) -> &serde_json::Value {
        &self.environment
    }

    pub fn platform_artifact(&self) -> Option<&Path> {
        self.platform_artifact.as_deref()
    }

    pub fn config(&self) -> &Arc<Configuration> {
        self.graph.config()
    }

    /// Load `name` into the graph. The first load initializes the superclass
    /// and then runs `<clinit>` through the dispatcher; other threads block
    /// until it finishes. A failed or panicking initialization is remembered
    /// and every later load fails the same way.
    pub(crate) fn bootstrap(self: &Arc<Self>, name: &TypeName) -> Result<Arc<LoadedClass>> {
        let (loaded, fresh) = self.graph.load(name)?;
        if !fresh {
            return Ok(loaded);
        }
        let initialized = catch_unwind(AssertUnwindSafe(|| self.initialize(&loaded)))
            .unwrap_or_else(|payload| {
                Err(anyhow!(
                    "static initializer panicked: {}",
                    panic_message(payload.as_ref())
                ))
            });
        if let Err(e) = initialized {
            let message = format!("{:#}", e);
            self.graph.mark_failed(name, message.clone());
            return Err(SandboxError::InitializationFailed {
                class: name.clone(),
                message,
            }
            .into());
        }
        self.graph.mark_ready(name);
        Ok(loaded)
    }

    fn initialize(self: &Arc<Self>, loaded: &LoadedClass) -> Result<()> {
        if let Some(superclass) = &loaded.class.superclass {
            if self.graph.definition(superclass).is_some() {
                self.bootstrap(superclass)?;
            }
        }

        let Some(clinit) = loaded.class.member(&MemberSignature::static_initializer()) else {
            return Ok(());
        };
        // Host types share one set of statics per process, so their
        // initializer runs once no matter how many sandboxes load them.
        if !loaded.is_isolated() && !self.graph.class_path().mark_host_initialized(loaded.name()) {
            return Ok(());
        }
        debug!(sandbox = %self.id, class = %loaded.name(), "running static initializer");
        self.dispatch(loaded, clinit, None, &[]).map(|_| ())
    }

    pub(crate) fn dispatch(
        self: &Arc<Self>,
        loaded: &LoadedClass,
        member: &RewrittenMember,
        this: Option<ObjectRef>,
        args: &[Value],
    ) -> Result<Value> {
        let profile = InvocationProfile {
            class: loaded.name().clone(),
            signature: member.signature.clone(),
            kind: member.kind,
            returns: member.returns.clone(),
            instrumented: member.entry == EntryPoint::Dispatch,
        };
        let root = CallContext::root(self.clone());

        match self.dispatcher.plan_for(&profile)? {
            Plan::Intercept(behavior) => behavior(&root.framed(profile, this, None), args),
            Plan::Override {
                declared_by,
                member: replacement,
                ..
            } => {
                let ctx = root.framed(profile, this, Some(declared_by.name.clone()));
                (replacement.body)(&ctx, args)
            }
            Plan::CallOriginal => run_original(&root, member, profile, this, args),
            Plan::DoNothing => Ok(Value::default_for(&member.returns)),
        }
    }

    pub(crate) fn call_through(
        self: &Arc<Self>,
        profile: &InvocationProfile,
        this: Option<ObjectRef>,
        args: &[Value],
    ) -> Result<Value> {
        let loaded = self.bootstrap(&profile.class)?;
        let member = loaded
            .class
            .member(&profile.signature)
            .ok_or_else(|| SandboxError::UnknownMember {
                class: profile.class.clone(),
                signature: profile.signature.clone(),
            })?;
        run_original(&CallContext::root(self.clone()), member, profile.clone(), this, args)
    }

    pub(crate) fn invoke_instance(
        self: &Arc<Self>,
        start: &TypeName,
        target: &ObjectRef,
        signature: &MemberSignature,
        args: &[Value],
    ) -> Result<Value> {
        let (loaded, member) = self.find_member(start, signature, |k| k == MemberKind::Instance)?;
        self.dispatch(&loaded, &member, Some(target.clone()), args)
    }

    pub(crate) fn invoke_static(
        self: &Arc<Self>,
        class: &TypeName,
        signature: &MemberSignature,
        args: &[Value],
    ) -> Result<Value> {
        let (loaded, member) = self.find_member(class, signature, |k| k == MemberKind::Static)?;
        self.dispatch(&loaded, &member, None, args)
    }

    pub(crate) fn new_instance(
        self: &Arc<Self>,
        class: &TypeName,
        constructor: Option<&MemberSignature>,
        args: &[Value],
    ) -> Result<ObjectRef> {
        let loaded = self.bootstrap(class)?;
        if loaded.class.is_interface {
            bail!("cannot instantiate interface {}", class);
        }

        let unknown = |signature: MemberSignature| SandboxError::UnknownMember {
            class: class.clone(),
            signature,
        };
        let constructor = match constructor {
            Some(signature) => Some(
                loaded
                    .class
                    .member(signature)
                    .filter(|m| m.kind == MemberKind::Constructor)
                    .cloned()
                    .ok_or_else(|| unknown(signature.clone()))?,
            ),
            None => {
                let candidates: Vec<&RewrittenMember> = loaded
                    .class
                    .members()
                    .filter(|m| m.kind == MemberKind::Constructor && m.signature.arity() == args.len())
                    .collect();
                match candidates.as_slice() {
                    [] if args.is_empty() && !loaded.class.has_constructors() => None,
                    [] => {
                        return Err(unknown(MemberSignature::constructor(
                            std::iter::repeat(TypeName::generic()).take(args.len()),
                        ))
                        .into())
                    }
                    [only] => Some((*only).clone()),
                    _ => bail!(
                        "{} has {} constructors taking {} arguments; name one explicitly",
                        class,
                        candidates.len(),
                        args.len()
                    ),
                }
            }
        };

        let instance = Instance::new(class.clone());
        if loaded.class.is_instrumented() {
            if let Some(def) = self.shadow_for(class) {
                instance.bind_shadow(def.name.clone());
            }
        }
        if let Some(constructor) = constructor {
            self.dispatch(&loaded, &constructor, Some(instance.clone()), args)?;
        }
        Ok(instance)
    }

    /// Find `signature` on `start` or the nearest superclass declaring it.
    fn find_member(
        self: &Arc<Self>,
        start: &TypeName,
        signature: &MemberSignature,
        wanted: impl Fn(MemberKind) -> bool,
    ) -> Result<(Arc<LoadedClass>, RewrittenMember)> {
        let mut current = Some(start.clone());
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let Some(name) = current else { break };
            let loaded = self.bootstrap(&name)?;
            let found = loaded
                .class
                .member(signature)
                .filter(|m| wanted(m.kind))
                .cloned();
            if let Some(member) = found {
                return Ok((loaded, member));
            }
            current = loaded
                .class
                .superclass
                .clone()
                .filter(|s| self.graph.definition(s).is_some());
        }
        Err(SandboxError::UnknownMember {
            class: start.clone(),
            signature: signature.clone(),
        }
        .into())
    }

    /// Override whose shadow state new instances of `class` carry: the one
    /// for the class itself, else the nearest superclass with one.
    fn shadow_for(&self, class: &TypeName) -> Option<Arc<OverrideDef>> {
        let table = self.dispatcher.table();
        if let Some(def) = table.resolve_at(class, self.sdk) {
            return Some(def.clone());
        }
        self.graph
            .ancestry(class)
            .iter()
            .skip(1)
            .find_map(|c| table.resolve_at(&c.name, self.sdk).cloned())
    }

    /// Run the resetters of every override in the active table, parents
    /// included, against their static state.
    pub(crate) fn reset_override_statics(&self) {
        let table = self.dispatcher.table();
        let mut seen = HashSet::new();
        for (_, def) in table.entries() {
            for d in std::iter::once(def).chain(def.ancestors()) {
                if !seen.insert(d.name.clone()) {
                    continue;
                }
                if let Some(resetter) = &d.resetter {
                    resetter(&self.graph.override_statics(&d.name));
                }
            }
        }
    }
}

fn run_original(
    root: &CallContext,
    member: &RewrittenMember,
    profile: InvocationProfile,
    this: Option<ObjectRef>,
    args: &[Value],
) -> Result<Value> {
    match member.direct() {
        Some(original) => original(&root.framed(profile, this, None), args),
        None => Ok(Value::default_for(&member.returns)),
    }
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("id", &self.id)
            .field("sdk", &self.sdk)
            .field("graph", &self.graph)
            .finish()
    }
}

// =============================================================================
// Sandbox
// =============================================================================

pub struct Sandbox {
    runtime: Arc<SandboxRuntime>,
    thread: DesignatedThread,
    class_setup: Mutex<HashMap<String, Result<(), String>>>,
    poisoned: AtomicBool,
    fingerprint: String,
}

impl Sandbox {
    pub fn builder(class_path: Arc<ClassPath>, config: Arc<Configuration>) -> SandboxBuilder {
        SandboxBuilder::new(class_path, config)
    }

    pub fn id(&self) -> Uuid {
        self.runtime.id
    }

    pub fn sdk(&self) -> SdkLevel {
        self.runtime.sdk
    }

    pub fn runtime(&self) -> &Arc<SandboxRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &Arc<Configuration> {
        self.runtime.config()
    }

    /// Isolation fingerprint of the configuration the sandbox was built with.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn interrupt_flag(&self) -> &Arc<InterruptFlag> {
        self.thread.interrupt_flag()
    }

    pub fn is_designated_thread(&self) -> bool {
        self.thread.is_current()
    }

    /// Validate `table` against the graph and make it the active table.
    ///
    /// Every override target must be on the class path and every member an
    /// override declares must exist on the target. All problems are reported
    /// together; on error the previous table stays active.
    pub fn configure(&self, table: DispatchTable, interceptors: Arc<Interceptors>) -> Result<()> {
        let graph = &self.runtime.graph;
        let sdk = self.runtime.sdk;
        let mut errors = Vec::new();

        for (target, def) in table.entries() {
            if !def.is_active_at(sdk) {
                continue;
            }
            let ancestry = graph.ancestry(target);
            if ancestry.is_empty() {
                errors.push(SandboxError::UnresolvedTarget {
                    target: target.clone(),
                    override_name: def.name.clone(),
                });
                continue;
            }
            if let Err(e) = graph.rewriter().verify_override(def, &ancestry, sdk) {
                errors.push(e);
            }
            let config = graph.config();
            if !config.should_acquire(target) || !config.should_instrument(target) {
                warn!(
                    target = %target,
                    override_name = %def.name,
                    "override target is not instrumented; its members will never dispatch"
                );
            }
        }

        match errors.len() {
            0 => {}
            1 => return Err(errors.remove(0).into()),
            _ => return Err(SandboxError::Multiple(errors).into()),
        }

        let interceptors = Arc::new(interceptors.extended_with_no_ops(graph.config().intercepted()));
        self.runtime.dispatcher.configure(table, interceptors);
        Ok(())
    }

    /// Isolated counterpart of `name`, rewritten and initialized on first
    /// request. Initialization runs on the designated thread.
    pub fn bootstrap(&self, name: &str) -> Result<Arc<LoadedClass>> {
        let runtime = self.runtime.clone();
        let name = TypeName::new(name);
        self.thread.run(move || {
            let _guard = ContextGuard::install(runtime.clone());
            runtime.bootstrap(&name)
        })?
    }

    /// Run `work` on the designated thread with this sandbox installed as the
    /// current context, blocking until it completes.
    pub fn run_on_designated_thread<R, F>(&self, work: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&CallContext) -> R + Send + 'static,
    {
        let runtime = self.runtime.clone();
        self.thread.run(move || {
            let _guard = ContextGuard::install(runtime.clone());
            work(&CallContext::root(runtime))
        })
    }

    /// Like [`Sandbox::run_on_designated_thread`], but `work` gets a handle
    /// that can release the caller before `work` finishes.
    pub fn execute<R, F>(&self, work: F) -> Result<Completion<R>>
    where
        R: Send + 'static,
        F: FnOnce(&CallContext, AbandonHandle) -> R + Send + 'static,
    {
        let runtime = self.runtime.clone();
        self.thread.execute(move |abandon| {
            let _guard = ContextGuard::install(runtime.clone());
            work(&CallContext::root(runtime), abandon)
        })
    }

    /// Run `setup` the first time `key` is seen. Later calls return the
    /// remembered outcome without running anything.
    pub fn run_class_setup_once<F>(&self, key: &str, setup: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if let Some(outcome) = self.class_setup.lock().get(key).cloned() {
            return outcome.map_err(|message| anyhow!(message));
        }

        let outcome = match catch_unwind(AssertUnwindSafe(setup)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        debug!(sandbox = %self.id(), key, ok = outcome.is_ok(), "ran class setup");
        self.class_setup
            .lock()
            .insert(key.to_string(), outcome.clone());
        outcome.map_err(|message| anyhow!(message))
    }

    pub fn has_run_class_setup(&self, key: &str) -> bool {
        self.class_setup.lock().contains_key(key)
    }

    /// Run the process-wide reset hooks and the active overrides' resetters,
    /// and rewind the clock.
    pub fn reset_state(&self) -> Result<()> {
        let hooks = ResetRegistry::global().run_all();
        self.runtime.reset_override_statics();
        self.runtime.clock.reset();
        hooks
    }

    /// Never reuse this sandbox; its designated thread is stuck.
    pub fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            warn!(sandbox = %self.id(), "sandbox poisoned");
        }
        self.thread.mark_abandoned();
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.runtime.id)
            .field("sdk", &self.runtime.sdk)
            .field("thread", &self.thread)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct SandboxBuilder {
    class_path: Arc<ClassPath>,
    config: Arc<Configuration>,
    sdk: SdkLevel,
    clock: SandboxClock,
    environment: serde_json::Value,
    platform_artifact: Option<PathBuf>,
    table: DispatchTable,
    interceptors: Arc<Interceptors>,
}

impl SandboxBuilder {
    pub fn new(class_path: Arc<ClassPath>, config: Arc<Configuration>) -> Self {
        Self {
            class_path,
            config,
            sdk: LATEST_SDK,
            clock: SandboxClock::default(),
            environment: serde_json::Value::Null,
            platform_artifact: None,
            table: DispatchTable::new(),
            interceptors: Interceptors::defaults(),
        }
    }

    pub fn with_sdk(mut self, sdk: SdkLevel) -> Self {
        self.sdk = sdk;
        self
    }

    pub fn with_clock(mut self, clock: SandboxClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_environment(mut self, environment: serde_json::Value) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_platform_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.platform_artifact = Some(path.into());
        self
    }

    pub fn with_dispatch_table(mut self, table: DispatchTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_interceptors(mut self, interceptors: Arc<Interceptors>) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Build the sandbox, validate its dispatch table and run the reset hooks.
    pub fn build(self) -> Result<Sandbox> {
        let id = Uuid::new_v4();
        let fingerprint = self.config.isolation_fingerprint();
        let runtime = Arc::new(SandboxRuntime {
            id,
            sdk: self.sdk,
            graph: IsolatedGraph::new(self.class_path, self.config),
            dispatcher: Dispatcher::new(self.sdk),
            clock: self.clock,
            environment: self.environment,
            platform_artifact: self.platform_artifact,
        });
        let thread = DesignatedThread::spawn(format!("shadow-sandbox-{}", &id.simple().to_string()[..8]))?;

        let sandbox = Sandbox {
            runtime,
            thread,
            class_setup: Mutex::new(HashMap::new()),
            poisoned: AtomicBool::new(false),
            fingerprint,
        };
        sandbox
            .configure(self.table, self.interceptors)
            .context("invalid dispatch table")?;
        sandbox
            .reset_state()
            .context("reset hooks failed while building sandbox")?;

        info!(sandbox = %id, sdk = sandbox.sdk(), "created sandbox");
        Ok(sandbox)
    }
}
