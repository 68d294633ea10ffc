//! Override definitions and the override catalog.
//!
//! An [`OverrideDef`] substitutes members of one target type. The catalog is
//! the registration table the runner looks overrides up in by name, plus the
//! list of global defaults that seed every sandbox's dispatch table.

use crate::classes::{body, MemberBody};
use crate::dispatch_table::DispatchTable;
use crate::dispatcher::CallContext;
use crate::errors::SandboxError;
use anyhow::Result;
use shadow_sandbox_types::{MemberSignature, SdkLevel, SdkRange, StaticFields, TypeName, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Clears override-owned static state. Runs when a sandbox is built and,
/// for reused sandboxes, after every test.
pub type Resetter = Arc<dyn Fn(&StaticFields) + Send + Sync>;

/// One substituted member.
#[derive(Clone)]
pub struct OverrideMember {
    pub signature: MemberSignature,
    pub is_static: bool,
    /// Declared return type, checked against the target member on first use.
    pub returns: Option<TypeName>,
    pub sdk: SdkRange,
    pub body: MemberBody,
}

impl OverrideMember {
    pub fn new(signature: MemberSignature, body: MemberBody) -> Self {
        Self {
            signature,
            is_static: false,
            returns: None,
            sdk: SdkRange::ALL,
            body,
        }
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn with_returns(mut self, returns: impl Into<TypeName>) -> Self {
        self.returns = Some(returns.into());
        self
    }

    pub fn with_sdk(mut self, sdk: SdkRange) -> Self {
        self.sdk = sdk;
        self
    }
}

impl fmt::Debug for OverrideMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideMember")
            .field("signature", &self.signature.to_string())
            .field("is_static", &self.is_static)
            .field("returns", &self.returns)
            .field("sdk", &self.sdk)
            .finish()
    }
}

// =============================================================================
// OverrideDef
// =============================================================================

/// A substitute implementation for one target type.
#[derive(Clone)]
pub struct OverrideDef {
    pub name: String,
    pub target: TypeName,
    /// When the override lacks a member: `true` runs the original, `false`
    /// does nothing and returns the member's default value.
    pub call_through_by_default: bool,
    /// Fall back to an all-`any` member with the same name and arity.
    pub loose_signatures: bool,
    /// Consult the parent chain for members this override lacks.
    pub inherit: bool,
    pub parent: Option<Arc<OverrideDef>>,
    pub sdk: SdkRange,
    members: BTreeMap<MemberSignature, Arc<OverrideMember>>,
    pub resetter: Option<Resetter>,
}

impl OverrideDef {
    pub fn new(name: impl Into<String>, target: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            call_through_by_default: true,
            loose_signatures: false,
            inherit: false,
            parent: None,
            sdk: SdkRange::ALL,
            members: BTreeMap::new(),
            resetter: None,
        }
    }

    pub fn with_call_through_by_default(mut self, call_through: bool) -> Self {
        self.call_through_by_default = call_through;
        self
    }

    pub fn with_loose_signatures(mut self, loose: bool) -> Self {
        self.loose_signatures = loose;
        self
    }

    /// Set the override supertype and enable inheritance from it.
    pub fn with_parent(mut self, parent: Arc<OverrideDef>) -> Self {
        self.parent = Some(parent);
        self.inherit = true;
        self
    }

    pub fn with_inherit(mut self, inherit: bool) -> Self {
        self.inherit = inherit;
        self
    }

    pub fn with_sdk(mut self, sdk: SdkRange) -> Self {
        self.sdk = sdk;
        self
    }

    pub fn with_resetter<F>(mut self, f: F) -> Self
    where
        F: Fn(&StaticFields) + Send + Sync + 'static,
    {
        self.resetter = Some(Arc::new(f));
        self
    }

    pub fn with_member(mut self, member: OverrideMember) -> Self {
        self.members.insert(member.signature.clone(), Arc::new(member));
        self
    }

    /// Shorthand for an instance member with no declared return type.
    pub fn member<F>(self, signature: &str, f: F) -> Result<Self>
    where
        F: Fn(&CallContext, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Ok(self.with_member(OverrideMember::new(signature.parse()?, body(f))))
    }

    /// Shorthand for a static member.
    pub fn static_member<F>(self, signature: &str, f: F) -> Result<Self>
    where
        F: Fn(&CallContext, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Ok(self.with_member(OverrideMember::new(signature.parse()?, body(f)).with_static(true)))
    }

    pub fn is_active_at(&self, sdk: SdkLevel) -> bool {
        self.sdk.contains(sdk)
    }

    pub fn members(&self) -> impl Iterator<Item = &Arc<OverrideMember>> {
        self.members.values()
    }

    /// Exact-signature member visible at `sdk`.
    pub fn member_at(&self, signature: &MemberSignature, sdk: SdkLevel) -> Option<&Arc<OverrideMember>> {
        self.members
            .get(signature)
            .filter(|m| m.sdk.contains(sdk))
    }

    /// Member with the same name and arity whose parameters are all generic.
    pub fn loose_member_at(&self, signature: &MemberSignature, sdk: SdkLevel) -> Option<&Arc<OverrideMember>> {
        self.member_at(&signature.generic_form(), sdk)
    }

    /// Parent chain, nearest first. Empty unless inheritance is enabled.
    pub fn ancestors(&self) -> impl Iterator<Item = &Arc<OverrideDef>> {
        let first = if self.inherit { self.parent.as_ref() } else { None };
        std::iter::successors(first, |p| if p.inherit { p.parent.as_ref() } else { None })
    }
}

impl fmt::Debug for OverrideDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideDef")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("call_through_by_default", &self.call_through_by_default)
            .field("loose_signatures", &self.loose_signatures)
            .field("inherit", &self.inherit)
            .field("parent", &self.parent.as_ref().map(|p| p.name.as_str()))
            .field("sdk", &self.sdk)
            .field("members", &self.members.len())
            .finish()
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Known overrides by name, plus the global defaults.
#[derive(Default, Clone)]
pub struct OverrideCatalog {
    by_name: HashMap<String, Arc<OverrideDef>>,
    defaults: Vec<String>,
}

impl OverrideCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an override that tests may declare by name.
    pub fn register(&mut self, def: OverrideDef) -> Arc<OverrideDef> {
        let def = Arc::new(def);
        self.by_name.insert(def.name.clone(), def.clone());
        def
    }

    /// Register an override that is active in every sandbox unless a
    /// narrower declaration replaces it.
    pub fn register_default(&mut self, def: OverrideDef) -> Arc<OverrideDef> {
        let def = self.register(def);
        if !self.defaults.contains(&def.name) {
            self.defaults.push(def.name.clone());
        }
        def
    }

    pub fn get(&self, name: &str) -> Option<Arc<OverrideDef>> {
        self.by_name.get(name).cloned()
    }

    /// Like [`get`](Self::get) but unknown names are a configuration error.
    pub fn resolve(&self, name: &str) -> Result<Arc<OverrideDef>> {
        self.get(name).ok_or_else(|| {
            SandboxError::UnknownOverride {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn defaults(&self) -> impl Iterator<Item = Arc<OverrideDef>> + '_ {
        self.defaults.iter().filter_map(|n| self.get(n))
    }

    /// Table of the global defaults.
    pub fn default_table(&self) -> DispatchTable {
        DispatchTable::from_overrides(self.defaults())
    }
}

impl fmt::Debug for OverrideCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_name.keys().collect();
        names.sort_unstable();
        f.debug_struct("OverrideCatalog")
            .field("overrides", &names)
            .field("defaults", &self.defaults)
            .finish()
    }
}
