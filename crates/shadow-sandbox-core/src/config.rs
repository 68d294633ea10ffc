//! Sandbox configuration.
//!
//! A [`Configuration`] decides, for every type name, whether the type is
//! loaded through the isolated graph (acquired), whether acquired types are
//! rewritten (instrumented), and which overrides are declared for which
//! targets. It is immutable once built; build one with [`ConfigurationBuilder`].
//!
//! # Example
//!
//! ```
//! use shadow_sandbox_core::config::{Configuration, OverrideScope};
//!
//! let config = Configuration::builder()
//!     .instrument_package("platform.")
//!     .pass_through_package("platform.annotation.")
//!     .declare_override("platform.widget.TextView", "ShadowTextView", OverrideScope::Class)
//!     .build()
//!     .unwrap();
//!
//! assert!(config.should_acquire(&"platform.widget.TextView".into()));
//! assert!(!config.should_acquire(&"platform.annotation.Keep".into()));
//! ```

use crate::errors::SandboxError;
use anyhow::Result;
use regex::Regex;
use sha2::{Digest, Sha256};
use shadow_sandbox_types::{MethodRef, TypeName, CONSTRUCTOR};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Packages never acquired: the runner itself and the host runtime.
pub const DEFAULT_PASS_THROUGH: &[&str] = &["std.", "core.", "test.", "shadow_sandbox."];

/// Types acquired into every sandbox even when a pass-through rule matches.
/// Generated resource ids must be per-sandbox.
pub const ALWAYS_ACQUIRE: &[&str] = &["platform.R", "platform.internal.R"];

/// Declaration scope. Narrower scopes win when the dispatch table is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OverrideScope {
    Global,
    Class,
    Method,
}

impl OverrideScope {
    pub const ALL: [OverrideScope; 3] =
        [OverrideScope::Global, OverrideScope::Class, OverrideScope::Method];
}

impl fmt::Display for OverrideScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverrideScope::Global => "global",
            OverrideScope::Class => "class-level",
            OverrideScope::Method => "method-level",
        })
    }
}

/// `target -> override` as declared by one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideDeclaration {
    pub target: TypeName,
    pub override_name: String,
    pub scope: OverrideScope,
}

// =============================================================================
// Configuration
// =============================================================================

/// Immutable isolation and override configuration for one sandbox.
#[derive(Debug, Clone)]
pub struct Configuration {
    instrumented_packages: BTreeSet<String>,
    instrumented_classes: BTreeSet<TypeName>,
    pass_through_packages: BTreeSet<String>,
    pass_through_classes: BTreeSet<TypeName>,
    do_not_instrument_packages: BTreeSet<String>,
    do_not_instrument_classes: BTreeSet<TypeName>,
    exclude: Option<Regex>,
    translations: BTreeMap<TypeName, TypeName>,
    intercepted: BTreeSet<MethodRef>,
    declarations: Vec<OverrideDeclaration>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Whether `name` is loaded through the isolated graph. Pass-through
    /// rules beat isolation rules; [`ALWAYS_ACQUIRE`] beats both.
    pub fn should_acquire(&self, name: &TypeName) -> bool {
        if ALWAYS_ACQUIRE.contains(&name.as_str()) {
            return true;
        }
        if self.is_pass_through(name) {
            return false;
        }
        self.matches(name, &self.instrumented_classes, &self.instrumented_packages)
            || self.matches(
                name,
                &self.do_not_instrument_classes,
                &self.do_not_instrument_packages,
            )
    }

    /// Whether an acquired type gets dispatch entry points.
    pub fn should_instrument(&self, name: &TypeName) -> bool {
        self.should_acquire(name)
            && !self.matches(
                name,
                &self.do_not_instrument_classes,
                &self.do_not_instrument_packages,
            )
            && !self.is_excluded(name)
    }

    pub fn is_pass_through(&self, name: &TypeName) -> bool {
        self.matches(name, &self.pass_through_classes, &self.pass_through_packages)
    }

    pub fn is_excluded(&self, name: &TypeName) -> bool {
        self.exclude
            .as_ref()
            .is_some_and(|re| re.is_match(name.as_str()))
    }

    /// Name whose definition is loaded when `name` is requested.
    pub fn translate<'a>(&'a self, name: &'a TypeName) -> &'a TypeName {
        self.translations.get(name).unwrap_or(name)
    }

    /// Whether call-sites of `class.member` are intercepted. Constructors never are.
    pub fn should_intercept(&self, class: &TypeName, member: &str) -> bool {
        member != CONSTRUCTOR && self.intercepted.iter().any(|r| r.matches(class, member))
    }

    pub fn intercepted(&self) -> impl Iterator<Item = &MethodRef> {
        self.intercepted.iter()
    }

    pub fn declarations(&self) -> &[OverrideDeclaration] {
        &self.declarations
    }

    pub fn declarations_in(
        &self,
        scope: OverrideScope,
    ) -> impl Iterator<Item = &OverrideDeclaration> {
        self.declarations.iter().filter(move |d| d.scope == scope)
    }

    /// Stable digest of everything that shapes the isolated graph. Override
    /// declarations are excluded: a sandbox with the same fingerprint can be
    /// reused and reconfigured with a different dispatch table.
    pub fn isolation_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let mut feed = |tag: &str, items: &mut dyn Iterator<Item = &str>| {
            hasher.update(tag.as_bytes());
            for item in items {
                hasher.update([0u8]);
                hasher.update(item.as_bytes());
            }
            hasher.update([0xffu8]);
        };
        feed("ip", &mut self.instrumented_packages.iter().map(String::as_str));
        feed("ic", &mut self.instrumented_classes.iter().map(TypeName::as_str));
        feed("pp", &mut self.pass_through_packages.iter().map(String::as_str));
        feed("pc", &mut self.pass_through_classes.iter().map(TypeName::as_str));
        feed("np", &mut self.do_not_instrument_packages.iter().map(String::as_str));
        feed("nc", &mut self.do_not_instrument_classes.iter().map(TypeName::as_str));
        feed("ex", &mut self.exclude.iter().map(Regex::as_str));
        let translations: Vec<String> = self
            .translations
            .iter()
            .map(|(from, to)| format!("{from}={to}"))
            .collect();
        feed("tr", &mut translations.iter().map(String::as_str));
        let intercepted: Vec<String> = self.intercepted.iter().map(|r| r.to_string()).collect();
        feed("in", &mut intercepted.iter().map(String::as_str));
        hex::encode(hasher.finalize())
    }

    fn matches(
        &self,
        name: &TypeName,
        classes: &BTreeSet<TypeName>,
        packages: &BTreeSet<String>,
    ) -> bool {
        classes.contains(name) || packages.iter().any(|p| name.starts_with(p))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Accumulating builder. Every call is additive and order-independent.
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    instrumented_packages: BTreeSet<String>,
    instrumented_classes: BTreeSet<TypeName>,
    pass_through_packages: BTreeSet<String>,
    pass_through_classes: BTreeSet<TypeName>,
    do_not_instrument_packages: BTreeSet<String>,
    do_not_instrument_classes: BTreeSet<TypeName>,
    exclude_pattern: Option<String>,
    translations: BTreeMap<TypeName, TypeName>,
    intercepted: BTreeSet<MethodRef>,
    declarations: Vec<OverrideDeclaration>,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self {
            instrumented_packages: BTreeSet::new(),
            instrumented_classes: BTreeSet::new(),
            pass_through_packages: DEFAULT_PASS_THROUGH.iter().map(|p| p.to_string()).collect(),
            pass_through_classes: BTreeSet::new(),
            do_not_instrument_packages: BTreeSet::new(),
            do_not_instrument_classes: BTreeSet::new(),
            exclude_pattern: None,
            translations: BTreeMap::new(),
            intercepted: BTreeSet::new(),
            declarations: Vec::new(),
        }
    }
}

fn package_prefix(prefix: &str) -> String {
    if prefix.ends_with('.') {
        prefix.to_string()
    } else {
        format!("{prefix}.")
    }
}

impl ConfigurationBuilder {
    /// Isolate by pattern: `pkg.*` or `pkg.` isolate a package, anything else
    /// isolates a single type.
    pub fn mark_isolated(self, pattern: &str) -> Self {
        if let Some(pkg) = pattern.strip_suffix('*') {
            self.instrument_package(pkg)
        } else if pattern.ends_with('.') {
            self.instrument_package(pattern)
        } else {
            self.instrument_class(pattern)
        }
    }

    /// Pass a namespace prefix through unmodified.
    pub fn mark_pass_through(self, prefix: &str) -> Self {
        self.pass_through_package(prefix)
    }

    pub fn instrument_package(mut self, prefix: &str) -> Self {
        self.instrumented_packages.insert(package_prefix(prefix));
        self
    }

    pub fn instrument_class(mut self, name: impl Into<TypeName>) -> Self {
        self.instrumented_classes.insert(name.into());
        self
    }

    pub fn pass_through_package(mut self, prefix: &str) -> Self {
        self.pass_through_packages.insert(package_prefix(prefix));
        self
    }

    pub fn pass_through_class(mut self, name: impl Into<TypeName>) -> Self {
        self.pass_through_classes.insert(name.into());
        self
    }

    /// Acquire into the isolated graph (fresh statics) without rewriting.
    pub fn do_not_instrument_package(mut self, prefix: &str) -> Self {
        self.do_not_instrument_packages.insert(package_prefix(prefix));
        self
    }

    pub fn do_not_instrument_class(mut self, name: impl Into<TypeName>) -> Self {
        self.do_not_instrument_classes.insert(name.into());
        self
    }

    /// Acquired types whose names match are not rewritten.
    pub fn exclude_regex(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_pattern = Some(pattern.into());
        self
    }

    /// Load the definition of `to` whenever `from` is requested.
    pub fn translate_class(mut self, from: impl Into<TypeName>, to: impl Into<TypeName>) -> Self {
        self.translations.insert(from.into(), to.into());
        self
    }

    pub fn intercept(mut self, method: MethodRef) -> Self {
        self.intercepted.insert(method);
        self
    }

    pub fn intercept_all<I: IntoIterator<Item = MethodRef>>(mut self, methods: I) -> Self {
        self.intercepted.extend(methods);
        self
    }

    pub fn declare_override(
        mut self,
        target: impl Into<TypeName>,
        override_name: impl Into<String>,
        scope: OverrideScope,
    ) -> Self {
        self.declarations.push(OverrideDeclaration {
            target: target.into(),
            override_name: override_name.into(),
            scope,
        });
        self
    }

    /// Validate and freeze.
    ///
    /// Fails with [`SandboxError::ConflictingDeclarations`] when one scope
    /// declares two different overrides for the same target, and with
    /// [`SandboxError::InvalidPattern`] when the exclusion regex is invalid.
    pub fn build(self) -> Result<Configuration> {
        let mut seen: BTreeMap<(OverrideScope, &TypeName), &str> = BTreeMap::new();
        for decl in &self.declarations {
            match seen.get(&(decl.scope, &decl.target)) {
                Some(existing) if *existing != decl.override_name => {
                    return Err(SandboxError::ConflictingDeclarations {
                        target: decl.target.clone(),
                        scope: decl.scope.to_string(),
                        first: existing.to_string(),
                        second: decl.override_name.clone(),
                    }
                    .into());
                }
                Some(_) => {}
                None => {
                    seen.insert((decl.scope, &decl.target), &decl.override_name);
                }
            }
        }

        let exclude = match &self.exclude_pattern {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| SandboxError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?),
            None => None,
        };

        // Duplicate declarations within a scope collapse to one.
        let mut declarations: Vec<OverrideDeclaration> = Vec::with_capacity(self.declarations.len());
        for decl in self.declarations {
            if !declarations.contains(&decl) {
                declarations.push(decl);
            }
        }

        Ok(Configuration {
            instrumented_packages: self.instrumented_packages,
            instrumented_classes: self.instrumented_classes,
            pass_through_packages: self.pass_through_packages,
            pass_through_classes: self.pass_through_classes,
            do_not_instrument_packages: self.do_not_instrument_packages,
            do_not_instrument_classes: self.do_not_instrument_classes,
            exclude,
            translations: self.translations,
            intercepted: self.intercepted,
            declarations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> TypeName {
        TypeName::new(s)
    }

    #[test]
    fn test_pass_through_beats_isolation() {
        let config = Configuration::builder()
            .mark_isolated("platform.*")
            .mark_pass_through("platform.annotation")
            .build()
            .unwrap();

        assert!(config.should_acquire(&name("platform.widget.TextView")));
        assert!(!config.should_acquire(&name("platform.annotation.Keep")));
        assert!(!config.should_acquire(&name("std.collections.Map")));
        assert!(!config.should_acquire(&name("app.Main")));
    }

    #[test]
    fn test_always_acquire_beats_pass_through() {
        let config = Configuration::builder()
            .pass_through_package("platform")
            .build()
            .unwrap();
        assert!(config.should_acquire(&name("platform.R")));
        assert!(!config.should_acquire(&name("platform.widget.TextView")));
    }

    #[test]
    fn test_do_not_instrument_and_exclusion() {
        let config = Configuration::builder()
            .instrument_package("platform")
            .do_not_instrument_class("platform.util.Pair")
            .exclude_regex(r"\$Stub$")
            .build()
            .unwrap();

        let pair = name("platform.util.Pair");
        assert!(config.should_acquire(&pair));
        assert!(!config.should_instrument(&pair));

        let stub = name("platform.os.Binder$Stub");
        assert!(config.should_acquire(&stub));
        assert!(!config.should_instrument(&stub));

        assert!(config.should_instrument(&name("platform.os.Binder")));
    }

    #[test]
    fn test_invalid_exclusion_pattern() {
        let err = Configuration::builder()
            .exclude_regex("(unclosed")
            .build()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_conflicting_declarations_same_scope() {
        let err = Configuration::builder()
            .declare_override("platform.os.Looper", "ShadowLooper", OverrideScope::Class)
            .declare_override("platform.os.Looper", "PausedLooper", OverrideScope::Class)
            .build()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::ConflictingDeclarations { .. })
        ));
    }

    #[test]
    fn test_same_target_different_scopes_is_fine() {
        let config = Configuration::builder()
            .declare_override("platform.os.Looper", "ShadowLooper", OverrideScope::Class)
            .declare_override("platform.os.Looper", "PausedLooper", OverrideScope::Method)
            .declare_override("platform.os.Looper", "PausedLooper", OverrideScope::Method)
            .build()
            .unwrap();
        assert_eq!(config.declarations().len(), 2);
        assert_eq!(config.declarations_in(OverrideScope::Method).count(), 1);
    }

    #[test]
    fn test_intercept_never_matches_constructor() {
        let config = Configuration::builder()
            .intercept(MethodRef::all("platform.hardware.Camera"))
            .build()
            .unwrap();
        let camera = name("platform.hardware.Camera");
        assert!(config.should_intercept(&camera, "open"));
        assert!(!config.should_intercept(&camera, CONSTRUCTOR));
    }

    #[test]
    fn test_translation() {
        let config = Configuration::builder()
            .translate_class("platform.Legacy", "platform.Modern")
            .build()
            .unwrap();
        assert_eq!(config.translate(&name("platform.Legacy")).as_str(), "platform.Modern");
        assert_eq!(config.translate(&name("platform.Other")).as_str(), "platform.Other");
    }

    #[test]
    fn test_fingerprint_ignores_overrides() {
        let base = || Configuration::builder().instrument_package("platform");
        let a = base().build().unwrap();
        let b = base()
            .declare_override("platform.os.Looper", "ShadowLooper", OverrideScope::Method)
            .build()
            .unwrap();
        let c = base().instrument_package("app").build().unwrap();

        assert_eq!(a.isolation_fingerprint(), b.isolation_fingerprint());
        assert_ne!(a.isolation_fingerprint(), c.isolation_fingerprint());
    }
}
