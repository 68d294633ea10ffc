//! Test orchestration.
//!
//! [`TestRunner`] drives every test method through the same sequence:
//!
//! ```text
//! BUILD_CONFIG -> ACQUIRE_SANDBOX -> INSTALL_CONTEXT -> CLASS_SETUP (once)
//!   -> BEFORE_HOOKS -> RUN_BODY -> AFTER_HOOKS (always) -> RESTORE_CONTEXT -> REPORT
//! ```
//!
//! Hooks and the body run on the sandbox's designated thread with the sandbox
//! installed as the current context. The body is supervised by a
//! [`Watchdog`]; failures of background threads spawned during the test are
//! gathered by the [`ExceptionCollector`] and surfaced when the test itself
//! passed.
//!
//! Sandboxes are cached per test class by isolation fingerprint, SDK level
//! and environment, and reconfigured with each test's dispatch table.

use crate::artifacts::{DependencyResolver, SdkProvider};
use crate::classes::ClassPath;
use crate::collector::{BackgroundFailure, ExceptionCollector, TestScope};
use crate::config::{Configuration, ConfigurationBuilder, OverrideScope};
use crate::declared::{ConfigSource, DeclaredConfig, StaticConfigSource};
use crate::designated::{AbandonHandle, Completion};
use crate::dispatch_table::DispatchTable;
use crate::dispatcher::CallContext;
use crate::errors::{panic_message, TestFailure};
use crate::interceptors::Interceptors;
use crate::interrupt::{InterruptFlag, Interrupted};
use crate::overrides::OverrideCatalog;
use crate::perf::{report_all, Metadata, Metric, PerfReporter, PerfStats};
use crate::providers::{NoResources, ResourceProvider};
use crate::sandbox::Sandbox;
use crate::watchdog::{Watchdog, WatchdogReport};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use shadow_sandbox_types::env_utils::{
    env_bool_or, env_list, env_millis_or, env_var, env_var_or, prefixed,
};
use shadow_sandbox_types::{SdkLevel, SdkRange, Value, LATEST_SDK, OLDEST_SDK};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Setup, teardown or body of a test.
pub type Hook = Arc<dyn Fn(&CallContext) -> Result<()> + Send + Sync>;

/// Arguments of one run of a parameterized test.
pub type Parameters = Vec<Value>;

/// Body of a parameterized test, called once per parameter set.
pub type ParameterizedHook = Arc<dyn Fn(&CallContext, &[Value]) -> Result<()> + Send + Sync>;

// =============================================================================
// Runner configuration
// =============================================================================

/// Runner-wide settings. Every field can be overridden from the environment,
/// see [`RunnerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Deadline for a test body unless the test declares its own.
    pub timeout: Duration,
    /// How long a timed-out body may ignore its interrupt before the
    /// designated thread is abandoned.
    pub grace: Duration,
    /// SDK used when a test declares none.
    pub default_sdk: SdkLevel,
    /// Levels outside this range are skipped.
    pub supported: SdkRange,
    /// Reuse sandboxes across tests of one class when their isolation
    /// settings match.
    pub reuse_sandboxes: bool,
    /// Run reset hooks after every test that leaves its sandbox for reuse.
    pub reset_after_each: bool,
    pub instrumented_packages: Vec<String>,
    pub pass_through_packages: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            grace: Duration::from_secs(5),
            default_sdk: LATEST_SDK,
            supported: SdkRange::new(OLDEST_SDK, Some(LATEST_SDK)),
            reuse_sandboxes: true,
            reset_after_each: true,
            instrumented_packages: Vec::new(),
            pass_through_packages: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Defaults overridden by `SHADOW_SANDBOX_TIMEOUT_MS`, `_GRACE_MS`, `_SDK`,
    /// `_MIN_SDK`, `_MAX_SDK`, `_REUSE_SANDBOXES`, `_RESET_AFTER_EACH`,
    /// `_INSTRUMENTED_PACKAGES` and `_PASS_THROUGH_PACKAGES`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut instrumented_packages = defaults.instrumented_packages.clone();
        instrumented_packages.extend(env_list(&prefixed("INSTRUMENTED_PACKAGES")));
        let mut pass_through_packages = defaults.pass_through_packages.clone();
        pass_through_packages.extend(env_list(&prefixed("PASS_THROUGH_PACKAGES")));

        Self {
            timeout: env_millis_or(&prefixed("TIMEOUT_MS"), defaults.timeout),
            grace: env_millis_or(&prefixed("GRACE_MS"), defaults.grace),
            default_sdk: env_var_or(&prefixed("SDK"), defaults.default_sdk),
            supported: SdkRange::new(
                env_var_or(&prefixed("MIN_SDK"), defaults.supported.min),
                env_var(&prefixed("MAX_SDK")).or(defaults.supported.max),
            ),
            reuse_sandboxes: env_bool_or(&prefixed("REUSE_SANDBOXES"), defaults.reuse_sandboxes),
            reset_after_each: env_bool_or(&prefixed("RESET_AFTER_EACH"), defaults.reset_after_each),
            instrumented_packages,
            pass_through_packages,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_default_sdk(mut self, sdk: SdkLevel) -> Self {
        self.default_sdk = sdk;
        self
    }

    pub fn with_supported(mut self, supported: SdkRange) -> Self {
        self.supported = supported;
        self
    }

    pub fn with_reuse_sandboxes(mut self, reuse: bool) -> Self {
        self.reuse_sandboxes = reuse;
        self
    }

    pub fn with_reset_after_each(mut self, reset: bool) -> Self {
        self.reset_after_each = reset;
        self
    }

    pub fn with_instrumented_package(mut self, package: impl Into<String>) -> Self {
        self.instrumented_packages.push(package.into());
        self
    }

    pub fn with_pass_through_package(mut self, package: impl Into<String>) -> Self {
        self.pass_through_packages.push(package.into());
        self
    }
}

// =============================================================================
// Test definitions
// =============================================================================

pub struct TestMethod {
    pub name: String,
    body: MethodBody,
    timeout: Option<Duration>,
}

enum MethodBody {
    Plain(Hook),
    Parameterized {
        sets: Vec<Parameters>,
        body: ParameterizedHook,
    },
}

/// One sandboxed run of a method body.
struct Invocation {
    /// Position of the parameter set, for parameterized methods.
    index: Option<usize>,
    body: Hook,
}

impl TestMethod {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&CallContext) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: MethodBody::Plain(Arc::new(body)),
            timeout: None,
        }
    }

    /// A method run once per parameter set, each run in its own sandboxed
    /// execution and reported as `Class.method[i]`.
    pub fn parameterized<F>(
        name: impl Into<String>,
        sets: impl IntoIterator<Item = Parameters>,
        body: F,
    ) -> Self
    where
        F: Fn(&CallContext, &[Value]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: MethodBody::Parameterized {
                sets: sets.into_iter().collect(),
                body: Arc::new(body),
            },
            timeout: None,
        }
    }

    pub fn is_parameterized(&self) -> bool {
        matches!(self.body, MethodBody::Parameterized { .. })
    }

    fn invocations(&self) -> Vec<Invocation> {
        match &self.body {
            MethodBody::Plain(body) => vec![Invocation {
                index: None,
                body: body.clone(),
            }],
            MethodBody::Parameterized { sets, body } => sets
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, set)| {
                    let body = body.clone();
                    Invocation {
                        index: Some(index),
                        body: Arc::new(move |ctx: &CallContext| body(ctx, &set)),
                    }
                })
                .collect(),
        }
    }

    /// Deadline for this method; beats declared and runner timeouts.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A test class: its methods plus class- and method-level hooks.
pub struct TestClass {
    pub name: String,
    before_class: Vec<Hook>,
    before_each: Vec<Hook>,
    after_each: Vec<Hook>,
    methods: Vec<TestMethod>,
}

impl TestClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before_class: Vec::new(),
            before_each: Vec::new(),
            after_each: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Runs once per sandbox, before the first method that uses it.
    pub fn with_before_class<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallContext) -> Result<()> + Send + Sync + 'static,
    {
        self.before_class.push(Arc::new(hook));
        self
    }

    pub fn with_before_each<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallContext) -> Result<()> + Send + Sync + 'static,
    {
        self.before_each.push(Arc::new(hook));
        self
    }

    /// After hooks run in reverse registration order, even when the body failed.
    pub fn with_after_each<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallContext) -> Result<()> + Send + Sync + 'static,
    {
        self.after_each.push(Arc::new(hook));
        self
    }

    pub fn with_method(mut self, method: TestMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn test<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&CallContext) -> Result<()> + Send + Sync + 'static,
    {
        self.with_method(TestMethod::new(name, body))
    }

    pub fn methods(&self) -> impl Iterator<Item = &TestMethod> {
        self.methods.iter()
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    Passed,
    Skipped(String),
    Failed(TestFailure),
}

impl TestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Skipped(_) => "skipped",
            TestOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }

    pub fn failure(&self) -> Option<&TestFailure> {
        match self {
            TestOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result of one test method at one SDK level.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub id: Uuid,
    pub class: String,
    pub method: String,
    /// `Class.method`, suffixed with the parameter index `[i]` and with
    /// `[sdk=N]` when the method runs at several levels.
    pub name: String,
    pub sdk: SdkLevel,
    pub parameter_index: Option<usize>,
    pub sandbox: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: TestOutcome,
    pub teardown_failures: Vec<String>,
    pub background_failures: Vec<BackgroundFailure>,
    pub metrics: Vec<Metric>,
}

impl TestReport {
    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::default()
            .with("test", &self.name)
            .with("class", &self.class)
            .with("method", &self.method)
            .with("sdk", self.sdk)
            .with("outcome", self.outcome.label())
            .with("duration_ms", self.duration.as_millis());
        if let Some(sandbox) = self.sandbox {
            metadata = metadata.with("sandbox", sandbox);
        }
        if let Some(index) = self.parameter_index {
            metadata = metadata.with("index", index);
        }
        if let Some(failure) = self.outcome.failure() {
            metadata = metadata
                .with("failure", failure.kind())
                .with("message", failure);
        }
        metadata
    }
}

/// Every report of a run, in class then method order.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub reports: Vec<TestReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, TestOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TestOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, TestOutcome::Skipped(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn find(&self, name: &str) -> Option<&TestReport> {
        self.reports.iter().find(|r| r.name == name)
    }

    fn count(&self, pred: impl Fn(&TestOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Declarative config of one method, per scope.
struct DeclaredScopes {
    global: DeclaredConfig,
    class: DeclaredConfig,
    method: DeclaredConfig,
}

impl DeclaredScopes {
    fn effective(&self) -> DeclaredConfig {
        DeclaredConfig::merge(&DeclaredConfig::merge(&self.global, &self.class), &self.method)
    }

    fn by_scope(&self) -> [(OverrideScope, &DeclaredConfig); 3] {
        [
            (OverrideScope::Global, &self.global),
            (OverrideScope::Class, &self.class),
            (OverrideScope::Method, &self.method),
        ]
    }
}

/// Sandboxes kept for reuse within one test class.
#[derive(Default)]
struct SandboxPool {
    sandboxes: HashMap<(String, SdkLevel, String), Arc<Sandbox>>,
}

/// What the designated thread reports back for one test.
struct TestPhases {
    before: std::result::Result<(), TestFailure>,
    body: Option<std::result::Result<(), TestFailure>>,
    teardown_failures: Vec<String>,
}

/// Everything a test method needs besides the sandbox.
struct MethodRun<'a> {
    class: &'a TestClass,
    method: &'a TestMethod,
    name: String,
    sdk: SdkLevel,
    index: Option<usize>,
    body: Hook,
}

pub struct TestRunner {
    class_path: Arc<ClassPath>,
    catalog: Arc<OverrideCatalog>,
    config: RunnerConfig,
    isolation: ConfigurationBuilder,
    config_source: Arc<dyn ConfigSource>,
    resolver: Option<Arc<dyn DependencyResolver>>,
    sdk_provider: SdkProvider,
    resources: Arc<dyn ResourceProvider>,
    reporters: Vec<Arc<dyn PerfReporter>>,
    interceptors: Arc<Interceptors>,
}

impl TestRunner {
    pub fn new(class_path: Arc<ClassPath>, catalog: Arc<OverrideCatalog>) -> Self {
        Self {
            class_path,
            catalog,
            config: RunnerConfig::default(),
            isolation: Configuration::builder(),
            config_source: Arc::new(StaticConfigSource::new()),
            resolver: None,
            sdk_provider: SdkProvider::default(),
            resources: Arc::new(NoResources),
            reporters: Vec::new(),
            interceptors: Interceptors::defaults(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Base isolation rules; declared overrides and packages are added per test.
    pub fn with_isolation(mut self, isolation: ConfigurationBuilder) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = source;
        self
    }

    /// Resolve the platform artifact for every sandbox. Resolution failure
    /// fails the test with a configuration error.
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_sdk_provider(mut self, provider: SdkProvider) -> Self {
        self.sdk_provider = provider;
        self
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn PerfReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn with_interceptors(mut self, interceptors: Arc<Interceptors>) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run distinct classes in parallel. Each class owns its sandboxes.
    pub fn run_suite(&self, classes: &[TestClass]) -> SuiteReport {
        let reports: Vec<Vec<TestReport>> =
            classes.par_iter().map(|class| self.run_class(class)).collect();
        let suite = SuiteReport {
            reports: reports.into_iter().flatten().collect(),
        };
        info!(
            passed = suite.passed(),
            failed = suite.failed(),
            skipped = suite.skipped(),
            "suite finished"
        );
        suite
    }

    /// Run every method of `class` sequentially.
    pub fn run_class(&self, class: &TestClass) -> Vec<TestReport> {
        let mut pool = SandboxPool::default();
        let mut reports = Vec::new();
        for method in &class.methods {
            reports.extend(self.run_method(&mut pool, class, method));
        }
        reports
    }

    fn run_method(
        &self,
        pool: &mut SandboxPool,
        class: &TestClass,
        method: &TestMethod,
    ) -> Vec<TestReport> {
        let base_name = format!("{}.{}", class.name, method.name);
        let invocations = method.invocations();
        let default_sdk = self.config.default_sdk;
        let run_for = |invocation: &Invocation, sdk: SdkLevel, tag_sdk: bool| MethodRun {
            class,
            method,
            name: run_name(&base_name, invocation.index, tag_sdk.then_some(sdk)),
            sdk,
            index: invocation.index,
            body: invocation.body.clone(),
        };

        if invocations.is_empty() {
            let run = MethodRun {
                class,
                method,
                name: base_name.clone(),
                sdk: default_sdk,
                index: None,
                body: Arc::new(|_: &CallContext| Ok(())),
            };
            let outcome = TestOutcome::Skipped("no parameter sets".to_string());
            return vec![self.finish(self.bare_report(&run, outcome))];
        }

        let scopes = match self.declared_scopes(&class.name, &method.name) {
            Ok(scopes) => scopes,
            Err(e) => {
                let message = format!("{:#}", e);
                return invocations
                    .iter()
                    .map(|invocation| {
                        let run = run_for(invocation, default_sdk, false);
                        let outcome = TestOutcome::Failed(TestFailure::Configuration(message.clone()));
                        self.finish(self.bare_report(&run, outcome))
                    })
                    .collect();
            }
        };
        let effective = scopes.effective();

        let sdks = self.select_sdks(&effective);
        if sdks.is_empty() {
            return invocations
                .iter()
                .map(|invocation| {
                    let run = run_for(invocation, default_sdk, false);
                    let outcome =
                        TestOutcome::Skipped("no known sdk satisfies the declared range".to_string());
                    self.finish(self.bare_report(&run, outcome))
                })
                .collect();
        }

        let multi = sdks.len() > 1;
        let mut reports = Vec::with_capacity(sdks.len() * invocations.len());
        for sdk in sdks {
            for invocation in &invocations {
                let run = run_for(invocation, sdk, multi);
                if !self.config.supported.contains(sdk) {
                    let reason = format!(
                        "sdk {} is outside the supported range {}",
                        sdk, self.config.supported
                    );
                    reports.push(self.finish(self.bare_report(&run, TestOutcome::Skipped(reason))));
                    continue;
                }
                let report = self.run_at(pool, &run, &scopes, &effective);
                reports.push(self.finish(report));
            }
        }
        reports
    }

    fn declared_scopes(&self, class: &str, method: &str) -> Result<DeclaredScopes> {
        Ok(DeclaredScopes {
            global: self.config_source.global().context("failed to read global config")?,
            class: self
                .config_source
                .for_class(class)
                .with_context(|| format!("failed to read config for {}", class))?,
            method: self
                .config_source
                .for_method(class, method)
                .with_context(|| format!("failed to read config for {}.{}", class, method))?,
        })
    }

    /// Declared levels; otherwise every known level inside a declared
    /// `min_sdk`/`max_sdk` window; otherwise the default.
    fn select_sdks(&self, declared: &DeclaredConfig) -> Vec<SdkLevel> {
        if !declared.sdk.is_empty() {
            let mut sdks = Vec::with_capacity(declared.sdk.len());
            for sdk in &declared.sdk {
                if !sdks.contains(sdk) {
                    sdks.push(*sdk);
                }
            }
            return sdks;
        }
        if declared.min_sdk.is_some() || declared.max_sdk.is_some() {
            let window = SdkRange::new(declared.min_sdk.unwrap_or(0), declared.max_sdk);
            return self
                .sdk_provider
                .supported_levels()
                .filter(|sdk| window.contains(*sdk))
                .collect();
        }
        vec![self.config.default_sdk]
    }

    /// Isolation configuration and composed dispatch table for one test.
    /// The table layers catalog defaults, then global, class and method
    /// declarations; narrower layers win per target.
    fn prepare(&self, scopes: &DeclaredScopes, effective: &DeclaredConfig) -> Result<(Configuration, DispatchTable)> {
        let mut builder = self.isolation.clone();
        for package in self.config.instrumented_packages.iter().chain(&effective.instrumented_packages) {
            builder = builder.instrument_package(package);
        }
        for package in &self.config.pass_through_packages {
            builder = builder.pass_through_package(package);
        }
        for (scope, declared) in scopes.by_scope() {
            for name in &declared.overrides {
                let def = self.catalog.resolve(name)?;
                builder = builder.declare_override(def.target.clone(), name.clone(), scope);
            }
        }
        let configuration = builder.build()?;

        let mut table = self.catalog.default_table();
        for scope in OverrideScope::ALL {
            let layer = configuration
                .declarations_in(scope)
                .map(|d| self.catalog.resolve(&d.override_name))
                .collect::<Result<Vec<_>>>()?;
            if !layer.is_empty() {
                table = table.overlaid_with(&DispatchTable::from_overrides(layer));
            }
        }
        Ok((configuration, table))
    }

    /// A cached sandbox with the same isolation settings, reconfigured with
    /// `table`, or a fresh one. Returns whether the sandbox was reused.
    fn acquire(
        &self,
        pool: &mut SandboxPool,
        configuration: Configuration,
        table: DispatchTable,
        sdk: SdkLevel,
        effective: &DeclaredConfig,
    ) -> Result<(Arc<Sandbox>, bool)> {
        let environment = self
            .resources
            .environment(sdk, effective)
            .context("resource provider failed")?;
        let key = (configuration.isolation_fingerprint(), sdk, environment.to_string());

        if self.config.reuse_sandboxes {
            if let Some(sandbox) = pool.sandboxes.get(&key).cloned() {
                if sandbox.is_poisoned() {
                    pool.sandboxes.remove(&key);
                } else {
                    sandbox
                        .configure(table, self.interceptors.clone())
                        .context("invalid dispatch table")?;
                    debug!(sandbox = %sandbox.id(), sdk, "reusing sandbox");
                    return Ok((sandbox, true));
                }
            }
        }

        let mut builder = Sandbox::builder(self.class_path.clone(), Arc::new(configuration))
            .with_sdk(sdk)
            .with_environment(environment)
            .with_dispatch_table(table)
            .with_interceptors(self.interceptors.clone());
        if let Some(resolver) = &self.resolver {
            builder = builder.with_platform_artifact(self.sdk_provider.resolve(sdk, resolver.as_ref())?);
        }
        let sandbox = Arc::new(builder.build()?);
        if self.config.reuse_sandboxes {
            pool.sandboxes.insert(key, sandbox.clone());
        }
        Ok((sandbox, false))
    }

    fn run_at(
        &self,
        pool: &mut SandboxPool,
        run: &MethodRun<'_>,
        scopes: &DeclaredScopes,
        effective: &DeclaredConfig,
    ) -> TestReport {
        let mut report = self.bare_report(run, TestOutcome::Passed);
        let started = Instant::now();
        let stats = Arc::new(PerfStats::new());
        info!(test = %run.name, sdk = run.sdk, "running test");

        let acquired = stats
            .measure("configure", || self.prepare(scopes, effective))
            .and_then(|(configuration, table)| {
                stats.measure("acquire_sandbox", || {
                    self.acquire(pool, configuration, table, run.sdk, effective)
                })
            });
        let (sandbox, reused) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                report.outcome = TestOutcome::Failed(TestFailure::Configuration(format!("{:#}", e)));
                report.duration = started.elapsed();
                report.metrics = stats.metrics();
                return report;
            }
        };
        report.sandbox = Some(sandbox.id());
        debug!(test = %run.name, sandbox = %sandbox.id(), reused, "acquired sandbox");

        let test_id = report.id;
        let collector = ExceptionCollector::global();
        collector.begin(test_id);

        let class_setup = stats.measure("class_setup", || {
            let hooks = run.class.before_class.clone();
            sandbox.run_class_setup_once(&run.class.name, || {
                sandbox.run_on_designated_thread(move |ctx| -> Result<()> {
                    let _scope = TestScope::enter(Some(test_id));
                    for hook in &hooks {
                        run_hook(hook, ctx).map_err(anyhow::Error::new)?;
                    }
                    Ok(())
                })?
            })
        });

        let phases = match class_setup {
            Ok(()) => self.run_phases(&sandbox, run, effective, test_id, &stats),
            Err(e) => TestPhases {
                before: Err(TestFailure::ClassSetup(format!("{:#}", e))),
                body: None,
                teardown_failures: Vec::new(),
            },
        };

        if self.config.reuse_sandboxes {
            self.recycle(pool, &sandbox, &stats);
        }

        report.background_failures = collector.drain(test_id);
        report.teardown_failures = phases.teardown_failures;
        report.outcome = match phases.before.and(phases.body.unwrap_or(Ok(()))) {
            Err(failure) => TestOutcome::Failed(failure),
            Ok(()) => {
                if let Some(first) = report.teardown_failures.first() {
                    TestOutcome::Failed(TestFailure::Error(format!("after hook failed: {}", first)))
                } else if let Some(first) = report.background_failures.first() {
                    TestOutcome::Failed(TestFailure::Background {
                        thread: first.thread.clone(),
                        message: first.message.clone(),
                    })
                } else {
                    TestOutcome::Passed
                }
            }
        };
        report.duration = started.elapsed();
        report.metrics = stats.metrics();
        report
    }

    /// Before hooks, the supervised body and after hooks, in one job on the
    /// designated thread.
    fn run_phases(
        &self,
        sandbox: &Sandbox,
        run: &MethodRun<'_>,
        effective: &DeclaredConfig,
        test_id: Uuid,
        stats: &Arc<PerfStats>,
    ) -> TestPhases {
        let timeout = run
            .method
            .timeout
            .or(effective.timeout_ms.map(Duration::from_millis))
            .unwrap_or(self.config.timeout);
        let grace = self.config.grace;
        let before = run.class.before_each.clone();
        let after = run.class.after_each.clone();
        let body = run.body.clone();
        let flag = sandbox.interrupt_flag().clone();
        let stats = stats.clone();
        let name = run.name.clone();

        let job = move |ctx: &CallContext, abandon: AbandonHandle| {
            let _scope = TestScope::enter(Some(test_id));

            let started = Instant::now();
            let before_result = before.iter().try_for_each(|hook| run_hook(hook, ctx));
            stats.record("before_hooks", started.elapsed(), before_result.is_ok());

            let body_result = if before_result.is_ok() {
                let started = Instant::now();
                let result = run_body(ctx, &body, timeout, grace, flag.clone(), abandon);
                stats.record("body", started.elapsed(), result.is_ok());
                Some(result)
            } else {
                None
            };

            let started = Instant::now();
            let mut teardown_failures = Vec::new();
            for hook in after.iter().rev() {
                if let Err(failure) = run_hook(hook, ctx) {
                    warn!(test = %name, error = %failure, "after hook failed");
                    teardown_failures.push(failure.to_string());
                }
            }
            stats.record("after_hooks", started.elapsed(), teardown_failures.is_empty());

            if flag.clear() {
                warn!(test = %name, "designated thread was left interrupted; flag cleared");
            }

            TestPhases {
                before: before_result,
                body: body_result,
                teardown_failures,
            }
        };

        match sandbox.execute(job) {
            Ok(Completion::Finished(phases)) => phases,
            Ok(Completion::Panicked(message)) => TestPhases {
                before: Err(TestFailure::Panicked(message)),
                body: None,
                teardown_failures: Vec::new(),
            },
            Ok(Completion::Abandoned) => {
                sandbox.poison();
                TestPhases {
                    before: Ok(()),
                    body: Some(Err(TestFailure::Timeout {
                        timeout,
                        backtrace: None,
                        forced: true,
                    })),
                    teardown_failures: vec![
                        "after hooks not awaited: designated thread abandoned".to_string()
                    ],
                }
            }
            Err(e) => {
                sandbox.poison();
                TestPhases {
                    before: Err(TestFailure::Error(format!("{:#}", e))),
                    body: None,
                    teardown_failures: Vec::new(),
                }
            }
        }
    }

    /// Reset a sandbox kept for the next test, or drop it from the pool.
    fn recycle(&self, pool: &mut SandboxPool, sandbox: &Arc<Sandbox>, stats: &PerfStats) {
        let evict = if sandbox.is_poisoned() {
            true
        } else if self.config.reset_after_each {
            match stats.measure("reset", || sandbox.reset_state()) {
                Ok(()) => false,
                Err(e) => {
                    warn!(sandbox = %sandbox.id(), error = %format!("{:#}", e), "reset after test failed, discarding sandbox");
                    true
                }
            }
        } else {
            false
        };
        if evict {
            pool.sandboxes.retain(|_, cached| !Arc::ptr_eq(cached, sandbox));
        }
    }

    fn bare_report(&self, run: &MethodRun<'_>, outcome: TestOutcome) -> TestReport {
        TestReport {
            id: Uuid::new_v4(),
            class: run.class.name.clone(),
            method: run.method.name.clone(),
            name: run.name.clone(),
            sdk: run.sdk,
            parameter_index: run.index,
            sandbox: None,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            outcome,
            teardown_failures: Vec::new(),
            background_failures: Vec::new(),
            metrics: Vec::new(),
        }
    }

    fn finish(&self, report: TestReport) -> TestReport {
        match &report.outcome {
            TestOutcome::Passed => info!(test = %report.name, duration_ms = report.duration.as_millis() as u64, "test passed"),
            TestOutcome::Skipped(reason) => info!(test = %report.name, reason = %reason, "test skipped"),
            TestOutcome::Failed(failure) => info!(test = %report.name, kind = failure.kind(), error = %failure, "test failed"),
        }
        report_all(&self.reporters, &report.metadata(), &report.metrics);
        report
    }
}

// =============================================================================
// Phase helpers
// =============================================================================

/// `Class.method`, then `[i]` for a parameter set, then `[sdk=N]`.
fn run_name(base: &str, index: Option<usize>, sdk: Option<SdkLevel>) -> String {
    let mut name = base.to_string();
    if let Some(index) = index {
        name.push_str(&format!("[{}]", index));
    }
    if let Some(sdk) = sdk {
        name.push_str(&format!("[sdk={}]", sdk));
    }
    name
}

fn run_hook(hook: &Hook, ctx: &CallContext) -> std::result::Result<(), TestFailure> {
    match catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TestFailure::Error(format!("{:#}", e))),
        Err(payload) => Err(TestFailure::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Run `body` under a watchdog. Escalation releases the waiting caller.
fn run_body(
    ctx: &CallContext,
    body: &Hook,
    timeout: Duration,
    grace: Duration,
    flag: Arc<InterruptFlag>,
    abandon: AbandonHandle,
) -> std::result::Result<(), TestFailure> {
    let watchdog = Watchdog::start(timeout, grace, flag, move || abandon.abandon())
        .map_err(|e| TestFailure::Error(format!("{:#}", e)))?;
    let result = catch_unwind(AssertUnwindSafe(|| body(ctx)));
    let report = watchdog.stop();
    classify_body(result, report, timeout)
}

/// A fired watchdog makes the body a timeout whatever it returned.
fn classify_body(
    result: std::thread::Result<Result<()>>,
    report: WatchdogReport,
    timeout: Duration,
) -> std::result::Result<(), TestFailure> {
    if report.timed_out {
        let backtrace = match &result {
            Ok(Err(e)) => e.downcast_ref::<Interrupted>().map(|i| i.backtrace.clone()),
            _ => None,
        };
        return Err(TestFailure::Timeout {
            timeout,
            backtrace,
            forced: report.escalated,
        });
    }
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TestFailure::Error(format!("{:#}", e))),
        Err(payload) => Err(TestFailure::Panicked(panic_message(payload.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::OverrideDef;
    use anyhow::anyhow;

    fn runner() -> TestRunner {
        let mut catalog = OverrideCatalog::new();
        catalog.register_default(OverrideDef::new("DefaultView", "platform.view.View"));
        catalog.register(OverrideDef::new("ClassView", "platform.view.View"));
        catalog.register(OverrideDef::new("MethodView", "platform.view.View"));
        catalog.register(OverrideDef::new("ShadowToast", "platform.widget.Toast"));
        TestRunner::new(Arc::new(ClassPath::new()), Arc::new(catalog))
    }

    fn scopes(global: &[&str], class: &[&str], method: &[&str]) -> DeclaredScopes {
        DeclaredScopes {
            global: DeclaredConfig::default().with_overrides(global.iter().copied()),
            class: DeclaredConfig::default().with_overrides(class.iter().copied()),
            method: DeclaredConfig::default().with_overrides(method.iter().copied()),
        }
    }

    #[test]
    fn test_run_names_tag_index_before_sdk() {
        assert_eq!(run_name("T.m", None, None), "T.m");
        assert_eq!(run_name("T.m", Some(2), None), "T.m[2]");
        assert_eq!(run_name("T.m", Some(0), Some(28)), "T.m[0][sdk=28]");
    }

    #[test]
    fn test_prepare_method_override_beats_class_override() {
        let runner = runner();
        let scopes = scopes(&[], &["ClassView", "ShadowToast"], &["MethodView"]);
        let (_, table) = runner.prepare(&scopes, &scopes.effective()).unwrap();

        assert_eq!(table.resolve(&"platform.view.View".into()).unwrap().name, "MethodView");
        assert_eq!(table.resolve(&"platform.widget.Toast".into()).unwrap().name, "ShadowToast");
    }

    #[test]
    fn test_prepare_keeps_catalog_default_without_declarations() {
        let runner = runner();
        let scopes = scopes(&[], &[], &[]);
        let (_, table) = runner.prepare(&scopes, &scopes.effective()).unwrap();
        assert_eq!(table.resolve(&"platform.view.View".into()).unwrap().name, "DefaultView");
    }

    #[test]
    fn test_prepare_rejects_conflicts_and_unknown_names() {
        let runner = runner();
        let conflicting = scopes(&[], &["ClassView", "MethodView"], &[]);
        let err = runner.prepare(&conflicting, &conflicting.effective()).unwrap_err();
        assert!(err.to_string().contains("conflicting class-level declarations"));

        let unknown = scopes(&["Nope"], &[], &[]);
        let err = runner.prepare(&unknown, &unknown.effective()).unwrap_err();
        assert!(err.to_string().contains("unknown override 'Nope'"));
    }

    #[test]
    fn test_select_sdks() {
        let runner = runner().with_sdk_provider(
            SdkProvider::empty().with_build(28, "9").with_build(30, "11").with_build(33, "13"),
        );

        assert_eq!(runner.select_sdks(&DeclaredConfig::default()), vec![LATEST_SDK]);
        assert_eq!(
            runner.select_sdks(&DeclaredConfig::default().with_sdk([30, 28, 30])),
            vec![30, 28]
        );
        let window = DeclaredConfig {
            min_sdk: Some(29),
            ..Default::default()
        };
        assert_eq!(runner.select_sdks(&window), vec![30, 33]);
    }

    #[test]
    fn test_classify_body_timeout_wins_over_result() {
        let report = WatchdogReport {
            timed_out: true,
            escalated: false,
        };
        let failure = classify_body(Ok(Ok(())), report, Duration::from_millis(50)).unwrap_err();
        assert_eq!(failure.to_string(), "test timed out after 50 milliseconds");

        let failure = classify_body(
            Ok(Err(anyhow!("boom"))),
            WatchdogReport::default(),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert_eq!(failure, TestFailure::Error("boom".to_string()));
    }

    #[test]
    fn test_runner_config_from_env() {
        std::env::set_var("SHADOW_SANDBOX_TIMEOUT_MS", "250");
        std::env::set_var("SHADOW_SANDBOX_REUSE_SANDBOXES", "off");
        std::env::set_var("SHADOW_SANDBOX_MAX_SDK", "30");
        let config = RunnerConfig::from_env();
        std::env::remove_var("SHADOW_SANDBOX_TIMEOUT_MS");
        std::env::remove_var("SHADOW_SANDBOX_REUSE_SANDBOXES");
        std::env::remove_var("SHADOW_SANDBOX_MAX_SDK");

        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!(!config.reuse_sandboxes);
        assert_eq!(config.supported, SdkRange::new(OLDEST_SDK, Some(30)));
    }
}
