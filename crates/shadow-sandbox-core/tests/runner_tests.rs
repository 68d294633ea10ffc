//! End-to-end tests for the test runner: configuration layering, sandbox
//! reuse, timeouts, background failures and reporting.

mod common;

use anyhow::{anyhow, ensure};
use common::*;
use shadow_sandbox_core::{
    DeclaredConfig, JsonlReporter, RunLog, RunnerConfig, StaticConfigSource, TestClass,
    TestFailure, TestMethod, TestOutcome, TestRunner,
};
use shadow_sandbox_types::{SdkRange, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn runner() -> TestRunner {
    TestRunner::new(class_path(), catalog())
        .with_isolation(shadow_sandbox_core::Configuration::builder().instrument_package("platform"))
        .with_config(RunnerConfig::default().with_default_sdk(30))
}

fn text(ctx: &shadow_sandbox_core::CallContext) -> anyhow::Result<Value> {
    let view = ctx.new_instance(TEXT_VIEW, &[Value::str("original")])?;
    ctx.invoke(&view, "getText()", &[])
}

/// Method-level declarations beat class-level ones for the same target.
#[test]
fn test_method_override_beats_class_override() {
    let source = StaticConfigSource::new()
        .with_class("TextViewTest", DeclaredConfig::default().with_overrides(["ClassTextView"]))
        .with_method(
            "TextViewTest",
            "method_level",
            DeclaredConfig::default().with_overrides(["MethodTextView"]),
        );
    let runner = runner().with_config_source(Arc::new(source));

    let class = TestClass::new("TextViewTest")
        .test("class_level", |ctx| {
            ensure!(text(ctx)? == Value::str("class"), "expected class override");
            Ok(())
        })
        .test("method_level", |ctx| {
            ensure!(text(ctx)? == Value::str("method"), "expected method override");
            Ok(())
        });

    let reports = runner.run_class(&class);
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert_eq!(report.outcome, TestOutcome::Passed, "{}", report.name);
    }
}

/// Without reuse every test sees freshly initialized statics.
#[test]
fn test_fresh_sandboxes_do_not_share_statics() {
    let runner = runner().with_config(
        RunnerConfig::default()
            .with_default_sdk(30)
            .with_reuse_sandboxes(false),
    );
    let class = TestClass::new("BuildTest")
        .test("writes", |ctx| {
            ctx.invoke_static(BUILD, "setModel(string)", &[Value::str("pixel")])?;
            Ok(())
        })
        .test("reads", |ctx| {
            let model = ctx.invoke_static(BUILD, "getModel()", &[])?;
            ensure!(model == Value::str("generic"), "leaked model {:?}", model.as_str());
            Ok(())
        });

    let reports = runner.run_class(&class);
    assert!(reports.iter().all(|r| r.outcome.is_passed()));
    assert_ne!(reports[0].sandbox, reports[1].sandbox);
}

/// A 50ms deadline on a body sleeping 1000ms is reported as a timeout.
#[test]
fn test_timeout_reports_configured_deadline() {
    let class = TestClass::new("SlowTest").with_method(
        TestMethod::new("sleeps", |ctx| {
            ctx.sleep(Duration::from_millis(1000))?;
            Ok(())
        })
        .with_timeout(Duration::from_millis(50)),
    );

    let reports = runner().run_class(&class);
    let failure = reports[0].outcome.failure().expect("test should fail");
    assert_eq!(failure.to_string(), "test timed out after 50 milliseconds");
    match failure {
        TestFailure::Timeout {
            backtrace, forced, ..
        } => {
            assert!(backtrace.is_some());
            assert!(!forced);
        }
        other => panic!("unexpected failure: {:?}", other),
    }
    assert!(reports[0].duration < Duration::from_millis(1000));
}

/// A body ignoring its interrupt is abandoned and its sandbox never reused.
#[test]
fn test_ignored_interrupt_poisons_sandbox() {
    let runner = runner().with_config(
        RunnerConfig::default()
            .with_default_sdk(30)
            .with_grace(Duration::from_millis(50)),
    );
    let class = TestClass::new("StuckTest")
        .with_method(
            TestMethod::new("spins", |_| {
                std::thread::sleep(Duration::from_millis(600));
                Ok(())
            })
            .with_timeout(Duration::from_millis(20)),
        )
        .test("next", |_| Ok(()));

    let reports = runner.run_class(&class);
    match reports[0].outcome.failure() {
        Some(TestFailure::Timeout { forced, .. }) => assert!(*forced),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(reports[1].outcome.is_passed());
    assert_ne!(reports[0].sandbox, reports[1].sandbox);
    assert_eq!(
        reports[0].teardown_failures,
        vec!["after hooks not awaited: designated thread abandoned".to_string()]
    );
}

/// Each parameter set gets its own named run with its own statics.
#[test]
fn test_parameterized_method_runs_once_per_set() {
    let runner = runner().with_config(
        RunnerConfig::default()
            .with_default_sdk(30)
            .with_reuse_sandboxes(false),
    );
    let models = ["pixel", "nexus", "fold"];
    let class = TestClass::new("ModelTest").with_method(TestMethod::parameterized(
        "sets_model",
        models.iter().map(|m| vec![Value::str(*m)]),
        |ctx, args| {
            let before = ctx.invoke_static(BUILD, "getModel()", &[])?;
            ensure!(before == Value::str("generic"), "leaked model {:?}", before.as_str());
            ctx.invoke_static(BUILD, "setModel(string)", &[args[0].clone()])?;
            ensure!(ctx.invoke_static(BUILD, "getModel()", &[])? == args[0], "model not set");
            Ok(())
        },
    ));

    let reports = runner.run_class(&class);
    assert_eq!(reports.len(), models.len());
    for (i, report) in reports.iter().enumerate() {
        assert_eq!(report.name, format!("ModelTest.sets_model[{}]", i));
        assert_eq!(report.parameter_index, Some(i));
        assert_eq!(report.outcome, TestOutcome::Passed, "{}", report.name);
    }
    assert_ne!(reports[0].sandbox, reports[1].sandbox);
    assert_ne!(reports[1].sandbox, reports[2].sandbox);
}

/// A failing parameter set does not affect its neighbours.
#[test]
fn test_parameterized_failure_is_reported_per_index() {
    let class = TestClass::new("EvenTest").with_method(TestMethod::parameterized(
        "is_even",
        [vec![Value::Int(2)], vec![Value::Int(3)], vec![Value::Int(4)]],
        |_, args| {
            let n = args[0].as_int().ok_or_else(|| anyhow!("not an int"))?;
            ensure!(n % 2 == 0, "{} is odd", n);
            Ok(())
        },
    ));

    let reports = runner().run_class(&class);
    let passed: Vec<bool> = reports.iter().map(|r| r.outcome.is_passed()).collect();
    assert_eq!(passed, vec![true, false, true]);
    assert_eq!(reports[1].name, "EvenTest.is_even[1]");
}

/// After hooks run even when the body fails and never mask its failure.
#[test]
fn test_after_hooks_always_run() {
    let after_runs = Arc::new(AtomicUsize::new(0));
    let counter = after_runs.clone();
    let class = TestClass::new("TeardownTest")
        .with_after_each(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("teardown exploded"))
        })
        .test("fails", |_| Err(anyhow!("assertion failed")))
        .test("passes", |_| Ok(()));

    let reports = runner().run_class(&class);
    assert_eq!(after_runs.load(Ordering::SeqCst), 2);

    assert_eq!(
        reports[0].outcome,
        TestOutcome::Failed(TestFailure::Error("assertion failed".to_string()))
    );
    assert_eq!(reports[0].teardown_failures, vec!["teardown exploded".to_string()]);

    match reports[1].outcome.failure() {
        Some(TestFailure::Error(message)) => assert!(message.contains("teardown exploded")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

/// A failed background thread fails an otherwise passing test.
#[test]
fn test_background_failure_surfaces_when_test_passes() {
    let class = TestClass::new("BackgroundTest")
        .test("passes_but_worker_fails", |ctx| {
            let handle = ctx.spawn("worker", |_| Err(anyhow!("worker crashed")))?;
            handle.join();
            Ok(())
        })
        .test("fails_and_worker_fails", |ctx| {
            ctx.spawn("worker", |_| Err(anyhow!("worker crashed")))?.join();
            Err(anyhow!("body failed"))
        });

    let reports = runner().run_class(&class);
    assert_eq!(
        reports[0].outcome,
        TestOutcome::Failed(TestFailure::Background {
            thread: "worker".to_string(),
            message: "worker crashed".to_string(),
        })
    );
    assert_eq!(
        reports[1].outcome,
        TestOutcome::Failed(TestFailure::Error("body failed".to_string()))
    );
    assert_eq!(reports[1].background_failures.len(), 1);
}

/// Class setup runs once per sandbox; its failure fails every method.
#[test]
fn test_class_setup_once_per_sandbox() {
    let setups = Arc::new(AtomicUsize::new(0));
    let counter = setups.clone();
    let class = TestClass::new("SetupTest")
        .with_before_class(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .test("one", |_| Ok(()))
        .test("two", |_| Ok(()));
    let reports = runner().run_class(&class);
    assert!(reports.iter().all(|r| r.outcome.is_passed()));
    assert_eq!(setups.load(Ordering::SeqCst), 1);

    let broken = TestClass::new("BrokenSetupTest")
        .with_before_class(|_| Err(anyhow!("no display")))
        .test("one", |_| Ok(()))
        .test("two", |_| Ok(()));
    for report in runner().run_class(&broken) {
        match report.outcome.failure() {
            Some(TestFailure::ClassSetup(message)) => assert!(message.contains("no display")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}

/// Declared SDK lists fan out; unsupported levels are skipped.
#[test]
fn test_multi_sdk_names_and_skips() {
    let source = StaticConfigSource::new().with_method(
        "SdkTest",
        "everywhere",
        DeclaredConfig::default().with_sdk([28, 30, 40]),
    );
    let runner = runner()
        .with_config_source(Arc::new(source))
        .with_config(
            RunnerConfig::default()
                .with_default_sdk(30)
                .with_supported(SdkRange::new(21, Some(34))),
        );
    let class = TestClass::new("SdkTest")
        .test("everywhere", |ctx| {
            ensure!(ctx.sdk() == 28 || ctx.sdk() == 30, "ran at {}", ctx.sdk());
            Ok(())
        })
        .test("default", |ctx| {
            ensure!(ctx.sdk() == 30, "ran at {}", ctx.sdk());
            Ok(())
        });

    let reports = runner.run_class(&class);
    let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "SdkTest.everywhere[sdk=28]",
            "SdkTest.everywhere[sdk=30]",
            "SdkTest.everywhere[sdk=40]",
            "SdkTest.default",
        ]
    );
    assert!(reports[0].outcome.is_passed());
    assert!(reports[1].outcome.is_passed());
    assert!(matches!(reports[2].outcome, TestOutcome::Skipped(_)));
    assert!(reports[3].outcome.is_passed());
}

/// Unknown override names are configuration failures, not panics.
#[test]
fn test_unknown_override_is_configuration_failure() {
    let source = StaticConfigSource::new()
        .with_class("MisconfiguredTest", DeclaredConfig::default().with_overrides(["Missing"]));
    let runner = runner().with_config_source(Arc::new(source));
    let reports = runner.run_class(&TestClass::new("MisconfiguredTest").test("any", |_| Ok(())));

    match reports[0].outcome.failure() {
        Some(TestFailure::Configuration(message)) => assert!(message.contains("unknown override 'Missing'")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

/// Suites run classes in parallel and report every test to the run log.
#[test]
fn test_suite_reports_to_run_log() {
    let temp_dir = tempfile::tempdir().unwrap();
    let reporter = Arc::new(JsonlReporter::new(
        RunLog::with_log_dir(temp_dir.path().to_path_buf()).unwrap(),
    ));
    let runner = runner().with_reporter(reporter.clone());

    let classes: Vec<TestClass> = (0..4)
        .map(|i| {
            TestClass::new(format!("ParallelTest{}", i))
                .test("passes", |_| Ok(()))
                .test("fails", |_| Err(anyhow!("nope")))
        })
        .collect();
    let suite = runner.run_suite(&classes);

    assert_eq!(suite.passed(), 4);
    assert_eq!(suite.failed(), 4);
    assert!(!suite.is_success());
    assert!(suite.find("ParallelTest2.fails").is_some());

    let summary =
        shadow_sandbox_core::report_log::summarize_run(temp_dir.path(), &reporter.run_id()).unwrap();
    assert_eq!(summary.tests, 8);
    assert_eq!(summary.by_outcome["passed"], 4);
    assert_eq!(summary.by_outcome["failed"], 4);
}
