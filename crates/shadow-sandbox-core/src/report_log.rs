//! Append-only run log of test results.
//!
//! Every test reported through [`JsonlReporter`] becomes one line of JSON in the
//! run's log file. Runs never share a file.
//!
//! ## Storage Structure
//!
//! ```text
//! ~/.shadow-sandbox-logs/
//! └── runs/
//!     └── {run_id}.jsonl      # One TestRecord per line (append-only)
//! ```

use crate::perf::{Metadata, Metric, PerfReporter};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shadow_sandbox_types::env_utils;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default log directory, relative to the home directory.
pub const DEFAULT_LOG_DIR: &str = ".shadow-sandbox-logs";

/// Environment variable (after prefixing) that overrides the log directory.
pub const LOG_DIR_ENV: &str = "LOG_DIR";

/// One reported test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    /// Test name, if the reporter was told one.
    pub test: Option<String>,
    /// `passed`, `failed` or `skipped`.
    pub outcome: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub metrics: Vec<Metric>,
}

/// Totals over one run file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tests: usize,
    pub by_outcome: BTreeMap<String, usize>,
    pub total_elapsed_ns: u64,
}

// =============================================================================
// Run log
// =============================================================================

/// Writes [`TestRecord`]s for one run.
pub struct RunLog {
    log_dir: PathBuf,
    run_id: String,
    writer: Option<BufWriter<File>>,
}

impl RunLog {
    /// Log under `$SHADOW_SANDBOX_LOG_DIR`, or `~/.shadow-sandbox-logs`.
    pub fn new() -> Result<Self> {
        Self::with_log_dir(default_log_dir()?)
    }

    pub fn with_log_dir(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(log_dir.join("runs"))
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
        Ok(Self {
            log_dir,
            run_id: Uuid::new_v4().to_string(),
            writer: None,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn run_file(&self) -> PathBuf {
        run_file(&self.log_dir, &self.run_id)
    }

    pub fn append(&mut self, record: &TestRecord) -> Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.run_file())
                .with_context(|| format!("failed to open run log {}", self.run_file().display()))?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", serde_json::to_string(record)?)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Read back every record of a run.
    pub fn load(log_dir: &Path, run_id: &str) -> Result<Vec<TestRecord>> {
        let path = run_file(log_dir, run_id);
        let file =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: malformed record", path.display(), index + 1))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Ids of every run under `log_dir`, oldest file name first.
    pub fn list_runs(log_dir: &Path) -> Result<Vec<String>> {
        let runs_dir = log_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs: Vec<String> = fs::read_dir(&runs_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                } else {
                    None
                }
            })
            .collect();
        runs.sort();
        Ok(runs)
    }
}

/// `$SHADOW_SANDBOX_LOG_DIR`, else `~/.shadow-sandbox-logs`.
pub fn default_log_dir() -> Result<PathBuf> {
    match env_utils::env_var::<String>(&env_utils::prefixed(LOG_DIR_ENV)) {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not determine home directory"))?
            .join(DEFAULT_LOG_DIR)),
    }
}

fn run_file(log_dir: &Path, run_id: &str) -> PathBuf {
    log_dir.join("runs").join(format!("{run_id}.jsonl"))
}

/// Summarize a run file.
pub fn summarize_run(log_dir: &Path, run_id: &str) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for record in RunLog::load(log_dir, run_id)? {
        summary.tests += 1;
        let outcome = record.outcome.unwrap_or_else(|| "unknown".to_string());
        *summary.by_outcome.entry(outcome).or_insert(0) += 1;
        for metric in &record.metrics {
            summary.total_elapsed_ns = summary.total_elapsed_ns.saturating_add(metric.elapsed_ns);
        }
    }
    Ok(summary)
}

// =============================================================================
// Reporter
// =============================================================================

/// [`PerfReporter`] writing to a [`RunLog`].
pub struct JsonlReporter {
    log: Mutex<RunLog>,
}

impl JsonlReporter {
    pub fn new(log: RunLog) -> Self {
        Self {
            log: Mutex::new(log),
        }
    }

    pub fn run_id(&self) -> String {
        self.log.lock().run_id().to_string()
    }

    pub fn run_file(&self) -> PathBuf {
        self.log.lock().run_file()
    }
}

impl PerfReporter for JsonlReporter {
    fn report(&self, metadata: &Metadata, metrics: &[Metric]) -> Result<()> {
        let mut log = self.log.lock();
        let record = TestRecord {
            timestamp: Utc::now(),
            run_id: log.run_id().to_string(),
            test: metadata.get("test").map(str::to_string),
            outcome: metadata.get("outcome").map(str::to_string),
            metadata: metadata.fields.clone(),
            metrics: metrics.to_vec(),
        };
        log.append(&record)
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}
