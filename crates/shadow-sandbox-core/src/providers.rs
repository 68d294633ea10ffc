//! Resource and manifest providers.
//!
//! The runner asks a provider for the environment of each sandbox it builds.
//! The result is opaque to the engine: it is handed to sandboxed code through
//! [`CallContext::environment`](crate::dispatcher::CallContext::environment).

use crate::declared::DeclaredConfig;
use anyhow::Result;
use serde_json::{json, Value as Json};
use shadow_sandbox_types::SdkLevel;

pub trait ResourceProvider: Send + Sync {
    fn environment(&self, sdk: SdkLevel, config: &DeclaredConfig) -> Result<Json>;
}

/// Provides nothing but the declared locations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResources;

impl ResourceProvider for NoResources {
    fn environment(&self, sdk: SdkLevel, config: &DeclaredConfig) -> Result<Json> {
        Ok(declared_locations(sdk, config))
    }
}

/// Serves pre-parsed resource tables and manifests, keyed by manifest path.
/// `"*"` matches any manifest.
#[derive(Debug, Clone, Default)]
pub struct StaticResourceProvider {
    by_manifest: serde_json::Map<String, Json>,
}

impl StaticResourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(mut self, manifest: impl Into<String>, resources: Json) -> Self {
        self.by_manifest.insert(manifest.into(), resources);
        self
    }

    pub fn with_default(self, resources: Json) -> Self {
        self.with_manifest("*", resources)
    }
}

impl ResourceProvider for StaticResourceProvider {
    fn environment(&self, sdk: SdkLevel, config: &DeclaredConfig) -> Result<Json> {
        let mut env = declared_locations(sdk, config);
        let resources = config
            .manifest
            .as_deref()
            .and_then(|m| self.by_manifest.get(m))
            .or_else(|| self.by_manifest.get("*"))
            .cloned()
            .unwrap_or(Json::Null);
        env["resources"] = resources;
        Ok(env)
    }
}

fn declared_locations(sdk: SdkLevel, config: &DeclaredConfig) -> Json {
    json!({
        "sdk": sdk,
        "manifest": config.manifest,
        "resource_dir": config.resource_dir,
        "asset_dir": config.asset_dir,
        "qualifiers": config.qualifiers,
        "options": config.options,
    })
}
