use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::debug;

use shadow_sandbox_core::DeclaredConfig;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Merge declarative configuration files, outermost first"
)]
pub struct ConfigCmd {
    /// Configuration files (`.json` or `.properties`), parent scope first
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl ConfigCmd {
    pub fn execute(&self, json_output: bool) -> Result<()> {
        let effective = self.effective()?;
        if json_output {
            println!(
                "{}",
                serde_json::to_string_pretty(&effective).context("serialize effective config")?
            );
        } else {
            print_config(&effective);
        }
        Ok(())
    }

    fn effective(&self) -> Result<DeclaredConfig> {
        let mut files = self.files.iter();
        let first = files
            .next()
            .ok_or_else(|| anyhow!("at least one configuration file is required"))?;
        let mut effective = DeclaredConfig::from_file(first)?;
        for path in files {
            debug!(file = %path.display(), "merging config file");
            let child = DeclaredConfig::from_file(path)?;
            effective = DeclaredConfig::merge(&effective, &child);
        }
        Ok(effective)
    }
}

fn join<T: ToString>(items: &[T]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn or_dash<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map_or_else(|| "-".to_string(), ToString::to_string)
}

fn print_config(config: &DeclaredConfig) {
    println!("Effective configuration");
    println!("  overrides:     {}", join(&config.overrides));
    println!("  sdk:           {}", join(&config.sdk));
    println!("  min sdk:       {}", or_dash(&config.min_sdk));
    println!("  max sdk:       {}", or_dash(&config.max_sdk));
    println!("  manifest:      {}", or_dash(&config.manifest));
    println!("  resource dir:  {}", or_dash(&config.resource_dir));
    println!("  asset dir:     {}", or_dash(&config.asset_dir));
    println!("  qualifiers:    {}", or_dash(&config.qualifiers));
    println!("  instrumented:  {}", join(&config.instrumented_packages));
    println!("  timeout (ms):  {}", or_dash(&config.timeout_ms));
    if !config.options.is_empty() {
        println!("  options:");
        for (key, value) in &config.options {
            println!("    {} = {}", key, value);
        }
    }
}
