//! Declarative test configuration.
//!
//! Tests declare overrides, SDK levels and environment options at three
//! scopes: global, per test class and per test method. Narrower scopes win
//! field by field; list-valued fields accumulate.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use shadow_sandbox_types::SdkLevel;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// File looked up in each package directory by [`PackageFileSource`].
pub const PACKAGE_CONFIG_FILE: &str = "shadow-sandbox.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclaredConfig {
    /// Catalog names of overrides to activate.
    pub overrides: Vec<String>,
    /// SDK levels to run at. Empty means the runner default.
    pub sdk: Vec<SdkLevel>,
    pub min_sdk: Option<SdkLevel>,
    pub max_sdk: Option<SdkLevel>,
    pub manifest: Option<String>,
    pub resource_dir: Option<String>,
    pub asset_dir: Option<String>,
    /// Device qualifiers. A value starting with `+` appends to the parent's.
    pub qualifiers: Option<String>,
    pub instrumented_packages: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub options: BTreeMap<String, String>,
}

impl DeclaredConfig {
    pub fn with_overrides<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_sdk<I: IntoIterator<Item = SdkLevel>>(mut self, levels: I) -> Self {
        self.sdk = levels.into_iter().collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_instrumented_package(mut self, package: impl Into<String>) -> Self {
        self.instrumented_packages.push(package.into());
        self
    }

    /// Overlay `child` on `parent`.
    ///
    /// Scalars: the child's value wins when set. `sdk` is replaced when the
    /// child lists levels; a child that only bounds the range clears the
    /// inherited list. Overrides and instrumented packages are unioned in
    /// declaration order. Options are unioned with the child winning per key.
    pub fn merge(parent: &DeclaredConfig, child: &DeclaredConfig) -> DeclaredConfig {
        let (sdk, min_sdk, max_sdk) = if !child.sdk.is_empty() {
            (child.sdk.clone(), child.min_sdk, child.max_sdk)
        } else if child.min_sdk.is_some() || child.max_sdk.is_some() {
            (
                Vec::new(),
                child.min_sdk.or(parent.min_sdk),
                child.max_sdk.or(parent.max_sdk),
            )
        } else {
            (parent.sdk.clone(), parent.min_sdk, parent.max_sdk)
        };

        let qualifiers = match (&parent.qualifiers, &child.qualifiers) {
            (Some(p), Some(c)) if c.starts_with('+') => Some(format!("{} {}", p, c)),
            (_, Some(c)) if !c.is_empty() => Some(c.clone()),
            (p, _) => p.clone(),
        };

        let mut options = parent.options.clone();
        options.extend(child.options.iter().map(|(k, v)| (k.clone(), v.clone())));

        DeclaredConfig {
            overrides: union(&parent.overrides, &child.overrides),
            sdk,
            min_sdk,
            max_sdk,
            manifest: child.manifest.clone().or_else(|| parent.manifest.clone()),
            resource_dir: child
                .resource_dir
                .clone()
                .or_else(|| parent.resource_dir.clone()),
            asset_dir: child.asset_dir.clone().or_else(|| parent.asset_dir.clone()),
            qualifiers,
            instrumented_packages: union(&parent.instrumented_packages, &child.instrumented_packages),
            timeout_ms: child.timeout_ms.or(parent.timeout_ms),
            options,
        }
    }

    /// Load a JSON file, or a `key=value` properties file when the extension
    /// is `.properties`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let parsed = if path.extension().is_some_and(|e| e == "properties") {
            Self::from_properties(&contents)
        } else {
            serde_json::from_str(&contents).map_err(anyhow::Error::from)
        };
        parsed.with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse `key=value` (or `key: value`) lines. Unknown keys become options.
    pub fn from_properties(contents: &str) -> Result<Self> {
        let mut config = DeclaredConfig::default();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line
                .find(['=', ':'])
                .ok_or_else(|| anyhow!("line {}: expected key=value", lineno + 1))?;
            let key = line[..split].trim();
            let value = line[split + 1..].trim();
            let list = || {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            };
            let level = |v: &str| {
                v.parse::<SdkLevel>()
                    .with_context(|| format!("line {}: invalid sdk level '{}'", lineno + 1, v))
            };

            match key {
                "overrides" | "shadows" => config.overrides = list(),
                "sdk" => {
                    config.sdk = list()
                        .iter()
                        .map(|v| level(v))
                        .collect::<Result<Vec<_>>>()?
                }
                "minSdk" | "min_sdk" => config.min_sdk = Some(level(value)?),
                "maxSdk" | "max_sdk" => config.max_sdk = Some(level(value)?),
                "manifest" => config.manifest = Some(value.to_string()),
                "resourceDir" | "resource_dir" => config.resource_dir = Some(value.to_string()),
                "assetDir" | "asset_dir" => config.asset_dir = Some(value.to_string()),
                "qualifiers" => config.qualifiers = Some(value.to_string()),
                "instrumentedPackages" | "instrumented_packages" => {
                    config.instrumented_packages = list()
                }
                "timeout" | "timeout_ms" => {
                    config.timeout_ms = Some(
                        value
                            .parse()
                            .with_context(|| format!("line {}: invalid timeout", lineno + 1))?,
                    )
                }
                other => {
                    config.options.insert(other.to_string(), value.to_string());
                }
            }
        }
        Ok(config)
    }
}

fn union(parent: &[String], child: &[String]) -> Vec<String> {
    let mut merged = parent.to_vec();
    for item in child {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}

// =============================================================================
// Sources
// =============================================================================

/// Supplies the declared configuration of each scope.
pub trait ConfigSource: Send + Sync {
    fn global(&self) -> Result<DeclaredConfig> {
        Ok(DeclaredConfig::default())
    }

    fn for_class(&self, class: &str) -> Result<DeclaredConfig>;

    fn for_method(&self, class: &str, method: &str) -> Result<DeclaredConfig>;

    /// All three scopes merged.
    fn effective(&self, class: &str, method: &str) -> Result<DeclaredConfig> {
        let global = self.global()?;
        let class_level = DeclaredConfig::merge(&global, &self.for_class(class)?);
        Ok(DeclaredConfig::merge(&class_level, &self.for_method(class, method)?))
    }
}

/// In-memory source.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    global: DeclaredConfig,
    classes: HashMap<String, DeclaredConfig>,
    methods: HashMap<(String, String), DeclaredConfig>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, config: DeclaredConfig) -> Self {
        self.global = config;
        self
    }

    pub fn with_class(mut self, class: impl Into<String>, config: DeclaredConfig) -> Self {
        self.classes.insert(class.into(), config);
        self
    }

    pub fn with_method(
        mut self,
        class: impl Into<String>,
        method: impl Into<String>,
        config: DeclaredConfig,
    ) -> Self {
        self.methods.insert((class.into(), method.into()), config);
        self
    }
}

impl ConfigSource for StaticConfigSource {
    fn global(&self) -> Result<DeclaredConfig> {
        Ok(self.global.clone())
    }

    fn for_class(&self, class: &str) -> Result<DeclaredConfig> {
        Ok(self.classes.get(class).cloned().unwrap_or_default())
    }

    fn for_method(&self, class: &str, method: &str) -> Result<DeclaredConfig> {
        Ok(self
            .methods
            .get(&(class.to_string(), method.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Reads [`PACKAGE_CONFIG_FILE`] from a directory tree mirroring the test
/// packages: `root/` holds the global file, `root/com/example/` the file for
/// package `com.example`. A class inherits every file from the root down to
/// its own package. Classes and methods can be layered on top in memory.
#[derive(Debug, Clone)]
pub struct PackageFileSource {
    root: PathBuf,
    overlay: StaticConfigSource,
}

impl PackageFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overlay: StaticConfigSource::new(),
        }
    }

    pub fn with_overlay(mut self, overlay: StaticConfigSource) -> Self {
        self.overlay = overlay;
        self
    }

    fn read(&self, dir: &Path) -> Result<DeclaredConfig> {
        let path = dir.join(PACKAGE_CONFIG_FILE);
        if path.is_file() {
            DeclaredConfig::from_file(&path)
        } else {
            Ok(DeclaredConfig::default())
        }
    }

    /// `a.b.C` -> [`a`, `a/b`]
    fn package_dirs(&self, class: &str) -> Vec<PathBuf> {
        let package = class.rsplit_once('.').map_or("", |(p, _)| p);
        let mut dirs = Vec::new();
        let mut dir = self.root.clone();
        for segment in package.split('.').filter(|s| !s.is_empty()) {
            dir.push(segment);
            dirs.push(dir.clone());
        }
        dirs
    }
}

impl ConfigSource for PackageFileSource {
    fn global(&self) -> Result<DeclaredConfig> {
        Ok(DeclaredConfig::merge(&self.read(&self.root)?, &self.overlay.global()?))
    }

    fn for_class(&self, class: &str) -> Result<DeclaredConfig> {
        let mut merged = DeclaredConfig::default();
        for dir in self.package_dirs(class) {
            merged = DeclaredConfig::merge(&merged, &self.read(&dir)?);
        }
        Ok(DeclaredConfig::merge(&merged, &self.overlay.for_class(class)?))
    }

    fn for_method(&self, class: &str, method: &str) -> Result<DeclaredConfig> {
        self.overlay.for_method(class, method)
    }
}
