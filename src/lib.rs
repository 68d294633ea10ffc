//! Shadow Sandbox
//!
//! Runs tests against a platform API surface inside per-test isolated
//! sandboxes, routing calls on platform types to substitute implementations.
//!
//! - **Object model and isolation**: see [`core::classes`] and [`core::graph`]
//! - **Dispatch**: see [`core::dispatch_table`] and [`core::dispatcher`]
//! - **Test running**: see [`core::orchestrator`]
//!
//! The `shadow-sandbox` binary inspects declarative configuration, resolves
//! platform artifacts and summarizes run logs.

#![allow(clippy::type_complexity)]

pub use shadow_sandbox_core as core;
pub use shadow_sandbox_types as types;

pub use shadow_sandbox_core::{
    ClassDef, ClassPath, Configuration, DeclaredConfig, DispatchTable, Interceptors,
    OverrideCatalog, OverrideDef, RunnerConfig, Sandbox, SandboxError, SuiteReport, TestClass,
    TestFailure, TestMethod, TestOutcome, TestReport, TestRunner,
};
pub use shadow_sandbox_types::{MethodRef, SdkLevel, SdkRange, Value};
