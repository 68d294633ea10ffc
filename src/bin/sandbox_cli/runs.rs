use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use shadow_sandbox_core::report_log::{default_log_dir, summarize_run, RunLog, RunSummary};

#[derive(Parser, Debug)]
#[command(author, version, about = "List and summarize run logs")]
pub struct RunsCmd {
    /// Log directory (default: $SHADOW_SANDBOX_LOG_DIR or ~/.shadow-sandbox-logs)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    action: RunsAction,
}

#[derive(Subcommand, Debug)]
enum RunsAction {
    /// List recorded run ids
    List,

    /// Summarize one run
    Show {
        /// Run id to summarize
        run_id: Option<String>,

        /// Summarize the most recently written run
        #[arg(long, conflicts_with = "run_id")]
        latest: bool,

        /// Also print each failed test
        #[arg(long)]
        failures: bool,
    },
}

#[derive(Debug, Serialize)]
struct RunView {
    run_id: String,
    #[serde(flatten)]
    summary: RunSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<FailureView>,
}

#[derive(Debug, Serialize)]
struct FailureView {
    test: String,
    message: String,
}

impl RunsCmd {
    pub fn execute(&self, json_output: bool) -> Result<()> {
        let log_dir = match &self.log_dir {
            Some(dir) => dir.clone(),
            None => default_log_dir()?,
        };

        match &self.action {
            RunsAction::List => {
                let runs = RunLog::list_runs(&log_dir)?;
                if json_output {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&runs).context("serialize run ids")?
                    );
                } else if runs.is_empty() {
                    println!("No runs recorded under {}", log_dir.display());
                } else {
                    for run in runs {
                        println!("{}", run);
                    }
                }
                Ok(())
            }
            RunsAction::Show {
                run_id,
                latest,
                failures,
            } => {
                let run_id = match (run_id, latest) {
                    (Some(id), _) => id.clone(),
                    (None, true) => latest_run(&log_dir)?,
                    (None, false) => return Err(anyhow!("pass a run id or --latest")),
                };
                let view = RunView {
                    summary: summarize_run(&log_dir, &run_id)?,
                    failures: if *failures {
                        failed_tests(&log_dir, &run_id)?
                    } else {
                        Vec::new()
                    },
                    run_id,
                };
                if json_output {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&view).context("serialize run summary")?
                    );
                } else {
                    print_view(&view);
                }
                Ok(())
            }
        }
    }
}

/// The run whose log file was modified last.
fn latest_run(log_dir: &std::path::Path) -> Result<String> {
    let mut newest: Option<(std::time::SystemTime, String)> = None;
    for run_id in RunLog::list_runs(log_dir)? {
        let path = log_dir.join("runs").join(format!("{run_id}.jsonl"));
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
            newest = Some((modified, run_id));
        }
    }
    newest
        .map(|(_, run_id)| run_id)
        .ok_or_else(|| anyhow!("no runs recorded under {}", log_dir.display()))
}

fn failed_tests(log_dir: &std::path::Path, run_id: &str) -> Result<Vec<FailureView>> {
    Ok(RunLog::load(log_dir, run_id)?
        .into_iter()
        .filter(|record| record.outcome.as_deref() == Some("failed"))
        .map(|record| FailureView {
            test: record.test.unwrap_or_else(|| "<unnamed>".to_string()),
            message: record.metadata.get("message").cloned().unwrap_or_default(),
        })
        .collect())
}

fn print_view(view: &RunView) {
    println!("Run {}", view.run_id);
    println!("  tests: {}", view.summary.tests);
    for (outcome, count) in &view.summary.by_outcome {
        println!("  {:<8} {}", format!("{}:", outcome), count);
    }
    println!(
        "  elapsed: {:.1} ms",
        view.summary.total_elapsed_ns as f64 / 1_000_000.0
    );
    if !view.failures.is_empty() {
        println!();
        for failure in &view.failures {
            println!("[FAIL] {}: {}", failure.test, failure.message);
        }
    }
}
