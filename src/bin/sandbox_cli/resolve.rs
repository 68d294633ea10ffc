use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

use shadow_sandbox_core::artifacts::sha256_file;
use shadow_sandbox_core::{ArtifactCoordinates, LocalRepositoryResolver, SdkProvider};
use shadow_sandbox_types::{SdkLevel, LATEST_SDK};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Resolve the platform artifact for an SDK level"
)]
pub struct ResolveCmd {
    /// SDK level to resolve
    #[arg(long, default_value_t = LATEST_SDK)]
    sdk: SdkLevel,

    /// Local repository root (default: $SHADOW_SANDBOX_REPOSITORY or ~/.m2/repository)
    #[arg(long)]
    repository: Option<PathBuf>,

    /// Skip `.sha256` checksum verification
    #[arg(long)]
    no_verify: bool,

    /// List known SDK levels and their coordinates instead of resolving
    #[arg(long)]
    list: bool,
}

#[derive(Debug, Serialize)]
struct Resolved {
    sdk: SdkLevel,
    coordinates: ArtifactCoordinates,
    path: PathBuf,
    sha256: String,
}

#[derive(Debug, Serialize)]
struct KnownLevel {
    sdk: SdkLevel,
    coordinates: ArtifactCoordinates,
}

impl ResolveCmd {
    pub fn execute(&self, json_output: bool) -> Result<()> {
        let provider = SdkProvider::default();
        if self.list {
            return list_levels(&provider, json_output);
        }

        let resolver = match &self.repository {
            Some(root) => LocalRepositoryResolver::new(root.clone()),
            None => LocalRepositoryResolver::from_env()?,
        }
        .with_checksum_verification(!self.no_verify);
        debug!(sdk = self.sdk, repository = %resolver.root().display(), "resolving platform artifact");

        let path = provider.resolve(self.sdk, &resolver)?;
        let resolved = Resolved {
            sdk: self.sdk,
            coordinates: provider.coordinates(self.sdk)?,
            sha256: sha256_file(&path)?,
            path,
        };

        if json_output {
            println!(
                "{}",
                serde_json::to_string_pretty(&resolved).context("serialize resolved artifact")?
            );
        } else {
            println!("sdk {}: {}", resolved.sdk, resolved.coordinates);
            println!("  path:   {}", resolved.path.display());
            println!("  sha256: {}", resolved.sha256);
        }
        Ok(())
    }
}

fn list_levels(provider: &SdkProvider, json_output: bool) -> Result<()> {
    let levels = provider
        .supported_levels()
        .map(|sdk| {
            Ok(KnownLevel {
                sdk,
                coordinates: provider.coordinates(sdk)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&levels).context("serialize sdk levels")?
        );
    } else {
        for level in &levels {
            println!("{:>3}  {}", level.sdk, level.coordinates);
        }
    }
    Ok(())
}
