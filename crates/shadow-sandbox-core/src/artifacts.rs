//! Platform Artifact Resolution
//!
//! Sandboxes for a given SDK level are built against a platform artifact
//! identified by Maven-style coordinates. The [`DependencyResolver`] trait
//! turns coordinates into a local path:
//! - [`LocalRepositoryResolver`] reads a Maven-layout repository on disk
//! - [`MockResolver`] returns pre-configured paths in tests
//! - [`NoopResolver`] is used when resolution is disabled
//!
//! A resolution failure aborts sandbox construction.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shadow_sandbox_types::{env_utils, SdkLevel};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Overrides the local repository root.
pub const REPOSITORY_ENV: &str = "REPOSITORY";

/// `group:artifact:version`, optionally with a classifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactCoordinates {
    pub group: String,
    pub artifact: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
}

impl ArtifactCoordinates {
    pub fn new(group: impl Into<String>, artifact: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            artifact: artifact.into(),
            version: version.into(),
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// File name inside the version directory.
    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(c) => format!("{}-{}-{}.jar", self.artifact, self.version, c),
            None => format!("{}-{}.jar", self.artifact, self.version),
        }
    }

    /// Path relative to a repository root.
    pub fn repository_path(&self) -> PathBuf {
        let mut path: PathBuf = self.group.split('.').collect();
        path.push(&self.artifact);
        path.push(&self.version);
        path.push(self.file_name());
        path
    }
}

impl fmt::Display for ArtifactCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)?;
        if let Some(c) = &self.classifier {
            write!(f, ":{}", c)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ArtifactCoordinates {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [g, a, v] if !g.is_empty() && !a.is_empty() && !v.is_empty() => Ok(Self::new(*g, *a, *v)),
            [g, a, v, c] if !g.is_empty() && !a.is_empty() && !v.is_empty() && !c.is_empty() => {
                Ok(Self::new(*g, *a, *v).with_classifier(*c))
            }
            _ => Err(anyhow!(
                "invalid coordinates '{}': expected group:artifact:version[:classifier]",
                s
            )),
        }
    }
}

/// Resolves artifacts to local files. Implementations must be idempotent and
/// safe to call repeatedly from several threads.
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, coordinates: &ArtifactCoordinates) -> Result<PathBuf>;

    /// Name for logging.
    fn name(&self) -> &str;
}

/// A resolver that always fails. Used when resolution is disabled.
pub struct NoopResolver;

impl DependencyResolver for NoopResolver {
    fn resolve(&self, coordinates: &ArtifactCoordinates) -> Result<PathBuf> {
        Err(anyhow!(
            "Artifact resolution is disabled; cannot resolve {}. Configure a resolver on the runner.",
            coordinates
        ))
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Resolves artifacts from a Maven-layout directory.
///
/// Results are memoized. When a `.sha256` file sits next to the artifact the
/// artifact's digest is verified against it.
pub struct LocalRepositoryResolver {
    root: PathBuf,
    verify_checksums: bool,
    resolved: Mutex<HashMap<ArtifactCoordinates, PathBuf>>,
}

impl LocalRepositoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            verify_checksums: true,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// `$SHADOW_SANDBOX_REPOSITORY`, else `~/.m2/repository`.
    pub fn from_env() -> Result<Self> {
        if let Some(root) = env_utils::env_var::<String>(&env_utils::prefixed(REPOSITORY_ENV)) {
            return Ok(Self::new(root));
        }
        let home = dirs::home_dir().context("cannot determine home directory for the local repository")?;
        Ok(Self::new(home.join(".m2").join("repository")))
    }

    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn verify(&self, path: &Path) -> Result<()> {
        let mut checksum_path = path.as_os_str().to_owned();
        checksum_path.push(".sha256");
        let checksum_path = PathBuf::from(checksum_path);
        if !checksum_path.is_file() {
            return Ok(());
        }

        let expected = std::fs::read_to_string(&checksum_path)
            .with_context(|| format!("failed to read {}", checksum_path.display()))?;
        let expected = expected
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let actual = sha256_file(path)?;
        if actual != expected {
            return Err(anyhow!(
                "checksum mismatch for {}: expected {}, found {}",
                path.display(),
                expected,
                actual
            ));
        }
        Ok(())
    }
}

impl DependencyResolver for LocalRepositoryResolver {
    fn resolve(&self, coordinates: &ArtifactCoordinates) -> Result<PathBuf> {
        if let Some(path) = self.resolved.lock().get(coordinates) {
            return Ok(path.clone());
        }

        let path = self.root.join(coordinates.repository_path());
        if !path.is_file() {
            return Err(anyhow!(
                "artifact {} not found at {}",
                coordinates,
                path.display()
            ));
        }
        if self.verify_checksums {
            self.verify(&path)
                .with_context(|| format!("failed to verify {}", coordinates))?;
        }
        debug!(artifact = %coordinates, path = %path.display(), "resolved artifact");

        self.resolved
            .lock()
            .insert(coordinates.clone(), path.clone());
        Ok(path)
    }

    fn name(&self) -> &str {
        "local-repository"
    }
}

/// Hex SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// A mock resolver for testing that returns pre-configured paths.
#[derive(Debug, Default)]
pub struct MockResolver {
    paths: HashMap<ArtifactCoordinates, PathBuf>,
    calls: Mutex<Vec<ArtifactCoordinates>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, coordinates: ArtifactCoordinates, path: impl Into<PathBuf>) {
        self.paths.insert(coordinates, path.into());
    }

    pub fn with(mut self, coordinates: ArtifactCoordinates, path: impl Into<PathBuf>) -> Self {
        self.add(coordinates, path);
        self
    }

    /// Every coordinate requested so far, in order.
    pub fn calls(&self) -> Vec<ArtifactCoordinates> {
        self.calls.lock().clone()
    }
}

impl DependencyResolver for MockResolver {
    fn resolve(&self, coordinates: &ArtifactCoordinates) -> Result<PathBuf> {
        self.calls.lock().push(coordinates.clone());
        self.paths
            .get(coordinates)
            .cloned()
            .ok_or_else(|| anyhow!("artifact not found: {}", coordinates))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// =============================================================================
// SDK artifacts
// =============================================================================

pub const PLATFORM_GROUP: &str = "dev.shadow-sandbox";
pub const PLATFORM_ARTIFACT: &str = "platform-all";

/// Maps SDK levels to the coordinates of their platform artifact.
#[derive(Debug, Clone)]
pub struct SdkProvider {
    group: String,
    artifact: String,
    builds: BTreeMap<SdkLevel, String>,
}

impl Default for SdkProvider {
    fn default() -> Self {
        let builds = [
            (21, "5.0.2_r3-r0"),
            (23, "6.0.1_r3-r1"),
            (26, "8.0.0_r4-r1"),
            (28, "9-r4913185-2"),
            (29, "10-r5803371"),
            (30, "11-r6757853"),
            (31, "12-r7732740"),
            (33, "13-r9030017"),
            (34, "14-r10818077"),
        ]
        .into_iter()
        .map(|(level, version)| (level, version.to_string()))
        .collect();
        Self {
            group: PLATFORM_GROUP.to_string(),
            artifact: PLATFORM_ARTIFACT.to_string(),
            builds,
        }
    }
}

impl SdkProvider {
    pub fn empty() -> Self {
        Self {
            builds: BTreeMap::new(),
            ..Self::default()
        }
    }

    pub fn with_build(mut self, level: SdkLevel, version: impl Into<String>) -> Self {
        self.builds.insert(level, version.into());
        self
    }

    pub fn supported_levels(&self) -> impl Iterator<Item = SdkLevel> + '_ {
        self.builds.keys().copied()
    }

    pub fn is_known(&self, level: SdkLevel) -> bool {
        self.builds.contains_key(&level)
    }

    pub fn coordinates(&self, level: SdkLevel) -> Result<ArtifactCoordinates> {
        let version = self
            .builds
            .get(&level)
            .ok_or_else(|| anyhow!("no platform artifact known for sdk {}", level))?;
        Ok(ArtifactCoordinates::new(&self.group, &self.artifact, version))
    }

    /// Resolve the platform artifact for `level`.
    pub fn resolve(&self, level: SdkLevel, resolver: &dyn DependencyResolver) -> Result<PathBuf> {
        let coordinates = self.coordinates(level)?;
        resolver.resolve(&coordinates).with_context(|| {
            format!(
                "failed to resolve platform artifact for sdk {} via {}",
                level,
                resolver.name()
            )
        })
    }
}
