//! Shadow Sandbox Core
//!
//! Sandboxed test execution and dispatch engine.
//!
//! Tests run against a platform API surface whose types are registered on a
//! [`ClassPath`]. Each test gets a [`Sandbox`]: an isolated copy of the
//! platform's static state plus a dispatch table that routes calls on
//! platform types to substitute implementations (overrides), fixed
//! replacements (interceptors) or the original behavior.
//!
//! # Core Modules
//!
//! - [`config`]: which types are isolated, rewritten or passed through
//! - [`rewriter`] / [`graph`]: rewriting and the per-sandbox isolated graph
//! - [`dispatch_table`] / [`overrides`]: target to override mappings, composed in layers
//! - [`interceptors`]: always-wins replacements
//! - [`dispatcher`]: per-call routing and the [`CallContext`] seen by sandboxed code
//! - [`sandbox`]: sandbox construction and the designated thread
//! - [`orchestrator`]: the test runner
//!
//! # Example
//!
//! ```ignore
//! use shadow_sandbox_core::{ClassPath, OverrideCatalog, TestClass, TestRunner};
//! use std::sync::Arc;
//!
//! let runner = TestRunner::new(Arc::new(class_path), Arc::new(catalog));
//! let suite = runner.run_suite(&[TestClass::new("ButtonTest").test("clicks", |ctx| {
//!     let button = ctx.new_instance("platform.widget.Button", &[])?;
//!     ctx.invoke(&button, "performClick()", &[])?;
//!     Ok(())
//! })]);
//! assert!(suite.is_success());
//! ```

#![allow(clippy::type_complexity)]

// Object model and isolation
pub mod classes;
pub mod config;
pub mod graph;
pub mod rewriter;

// Dispatch
pub mod dispatch_table;
pub mod dispatcher;
pub mod interceptors;
pub mod overrides;

// Sandboxes and their threads
pub mod clock;
pub mod collector;
pub mod context;
pub mod designated;
pub mod interrupt;
pub mod reset;
pub mod sandbox;
pub mod watchdog;

// Test running and collaborators
pub mod artifacts;
pub mod declared;
pub mod errors;
pub mod orchestrator;
pub mod perf;
pub mod providers;
pub mod report_log;

// Re-export main types at crate root for convenience
pub use artifacts::{
    ArtifactCoordinates, DependencyResolver, LocalRepositoryResolver, MockResolver, NoopResolver,
    SdkProvider,
};
pub use classes::{ClassDef, ClassPath, MemberBody, MemberDef, MemberKind};
pub use config::{Configuration, ConfigurationBuilder, OverrideScope};
pub use declared::{ConfigSource, DeclaredConfig, PackageFileSource, StaticConfigSource};
pub use dispatch_table::DispatchTable;
pub use dispatcher::{CallContext, Dispatcher, Plan};
pub use errors::{SandboxError, TestFailure};
pub use interceptors::Interceptors;
pub use orchestrator::{
    Parameters, RunnerConfig, SuiteReport, TestClass, TestMethod, TestOutcome, TestReport,
    TestRunner,
};
pub use overrides::{OverrideCatalog, OverrideDef, OverrideMember};
pub use perf::{LoggingReporter, Metadata, Metric, PerfReporter, PrometheusReporter};
pub use providers::{NoResources, ResourceProvider, StaticResourceProvider};
pub use report_log::{JsonlReporter, RunLog};
pub use reset::ResetRegistry;
pub use sandbox::{Sandbox, SandboxBuilder};
