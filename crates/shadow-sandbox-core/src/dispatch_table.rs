//! Target-to-override mapping with layered composition.
//!
//! Tables are values: [`DispatchTable::compose`] returns a new table and never
//! touches its inputs, so call-sites reading a table can never observe a
//! half-composed state.
//!
//! Member resolution order:
//! 1. exact signature on the active override
//! 2. exact signature up the override's parent chain (when it inherits)
//! 3. loose (all-`any`) signature on the active override (when it opts in)
//! 4. loose signature up the parent chain (when it both inherits and opts in)
//!
//! An exact match anywhere in the chain therefore beats a loose match on the
//! override itself.

use crate::overrides::{OverrideDef, OverrideMember};
use shadow_sandbox_types::{MemberSignature, SdkLevel, TypeName};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// How a member was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Inherited,
    Loose,
    LooseInherited,
}

#[derive(Debug, Clone)]
pub enum MemberResolution {
    /// An override member handles the call.
    Member {
        /// The override active for the target.
        active: Arc<OverrideDef>,
        /// The override that declares the member (differs from `active` for
        /// inherited matches).
        declared_by: Arc<OverrideDef>,
        member: Arc<OverrideMember>,
        via: MatchKind,
    },
    /// An override is active but has no member for the call.
    NoMember { active: Arc<OverrideDef> },
    /// No override is active for the target.
    NoOverride,
}

/// Immutable `target -> override` map.
#[derive(Clone)]
pub struct DispatchTable {
    entries: Arc<BTreeMap<TypeName, Arc<OverrideDef>>>,
    version: u64,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(BTreeMap::new()),
            version: next_version(),
        }
    }

    /// Table holding each override under its own target. Later entries for
    /// the same target replace earlier ones.
    pub fn from_overrides<I: IntoIterator<Item = Arc<OverrideDef>>>(overrides: I) -> Self {
        let entries = overrides
            .into_iter()
            .map(|def| (def.target.clone(), def))
            .collect();
        Self {
            entries: Arc::new(entries),
            version: next_version(),
        }
    }

    /// Overlay entries strictly replace base entries for the same target;
    /// disjoint targets are unioned.
    pub fn compose(base: &DispatchTable, overlay: &DispatchTable) -> DispatchTable {
        if overlay.is_empty() {
            return base.clone();
        }
        let mut entries = (*base.entries).clone();
        for (target, def) in overlay.entries.iter() {
            entries.insert(target.clone(), def.clone());
        }
        Self {
            entries: Arc::new(entries),
            version: next_version(),
        }
    }

    /// `self` overlaid with `overlay`.
    pub fn overlaid_with(&self, overlay: &DispatchTable) -> DispatchTable {
        Self::compose(self, overlay)
    }

    /// Monotonic identity; every constructed or composed table gets a new one.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&TypeName, &Arc<OverrideDef>)> {
        self.entries.iter()
    }

    pub fn resolve(&self, target: &TypeName) -> Option<&Arc<OverrideDef>> {
        self.entries.get(target)
    }

    /// Override for `target` if its SDK range includes `sdk`.
    pub fn resolve_at(&self, target: &TypeName, sdk: SdkLevel) -> Option<&Arc<OverrideDef>> {
        self.resolve(target).filter(|def| def.is_active_at(sdk))
    }

    pub fn resolve_member(
        &self,
        target: &TypeName,
        signature: &MemberSignature,
        sdk: SdkLevel,
    ) -> MemberResolution {
        let Some(active) = self.resolve_at(target, sdk) else {
            return MemberResolution::NoOverride;
        };

        let found = |declared_by: &Arc<OverrideDef>, member: &Arc<OverrideMember>, via| {
            MemberResolution::Member {
                active: active.clone(),
                declared_by: declared_by.clone(),
                member: member.clone(),
                via,
            }
        };

        if let Some(member) = active.member_at(signature, sdk) {
            return found(active, member, MatchKind::Exact);
        }
        for parent in active.ancestors().filter(|p| p.is_active_at(sdk)) {
            if let Some(member) = parent.member_at(signature, sdk) {
                return found(parent, member, MatchKind::Inherited);
            }
        }

        if active.loose_signatures && !signature.is_all_generic() {
            if let Some(member) = active.loose_member_at(signature, sdk) {
                return found(active, member, MatchKind::Loose);
            }
            for parent in active.ancestors().filter(|p| p.is_active_at(sdk)) {
                if let Some(member) = parent.loose_member_at(signature, sdk) {
                    return found(parent, member, MatchKind::LooseInherited);
                }
            }
        }

        MemberResolution::NoMember {
            active: active.clone(),
        }
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(t, d)| (t.as_str(), d.name.as_str())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadow_sandbox_types::{SdkRange, Value};

    fn def(name: &str, target: &str) -> Arc<OverrideDef> {
        Arc::new(OverrideDef::new(name, target))
    }

    fn name(s: &str) -> TypeName {
        TypeName::new(s)
    }

    #[test]
    fn test_compose_overlay_wins_and_unions() {
        let base = DispatchTable::from_overrides([def("X", "A")]);
        let overlay = DispatchTable::from_overrides([def("Y", "A"), def("Z", "B")]);
        let composed = DispatchTable::compose(&base, &overlay);

        assert_eq!(composed.resolve(&name("A")).unwrap().name, "Y");
        assert_eq!(composed.resolve(&name("B")).unwrap().name, "Z");
        // Inputs untouched.
        assert_eq!(base.resolve(&name("A")).unwrap().name, "X");
        assert!(base.resolve(&name("B")).is_none());
        assert_ne!(composed.version(), base.version());
    }

    #[test]
    fn test_compose_with_empty_overlay_keeps_base() {
        let base = DispatchTable::from_overrides([def("X", "A")]);
        let composed = base.overlaid_with(&DispatchTable::new());
        assert_eq!(composed.version(), base.version());
        assert_eq!(composed.len(), 1);
    }

    #[test]
    fn test_inactive_override_is_invisible() {
        let table = DispatchTable::from_overrides([Arc::new(
            OverrideDef::new("ShadowNew", "A").with_sdk(SdkRange::at_least(30)),
        )]);
        assert!(table.resolve_at(&name("A"), 29).is_none());
        assert!(table.resolve_at(&name("A"), 30).is_some());
        assert!(matches!(
            table.resolve_member(&name("A"), &MemberSignature::nullary("m"), 29),
            MemberResolution::NoOverride
        ));
    }

    #[test]
    fn test_exact_inherited_beats_own_loose() {
        let parent = Arc::new(
            OverrideDef::new("Parent", "Base")
                .member("m(string)", |_, _| Ok(Value::str("parent-exact")))
                .unwrap(),
        );
        let child = Arc::new(
            OverrideDef::new("Child", "A")
                .with_parent(parent)
                .with_loose_signatures(true)
                .member("m(any)", |_, _| Ok(Value::str("child-loose")))
                .unwrap(),
        );
        let table = DispatchTable::from_overrides([child]);

        match table.resolve_member(&name("A"), &MemberSignature::new("m", ["string"]), 30) {
            MemberResolution::Member { declared_by, via, .. } => {
                assert_eq!(declared_by.name, "Parent");
                assert_eq!(via, MatchKind::Inherited);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }

        match table.resolve_member(&name("A"), &MemberSignature::new("m", ["int"]), 30) {
            MemberResolution::Member { declared_by, via, .. } => {
                assert_eq!(declared_by.name, "Child");
                assert_eq!(via, MatchKind::Loose);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_loose_disabled_falls_to_no_member() {
        let table = DispatchTable::from_overrides([Arc::new(
            OverrideDef::new("Strict", "A")
                .member("m(any)", |_, _| Ok(Value::Unit))
                .unwrap(),
        )]);
        assert!(matches!(
            table.resolve_member(&name("A"), &MemberSignature::new("m", ["string"]), 30),
            MemberResolution::NoMember { .. }
        ));
    }

    #[test]
    fn test_loose_inherited_is_last_resort() {
        let parent = Arc::new(
            OverrideDef::new("Parent", "Base")
                .member("m(any)", |_, _| Ok(Value::Unit))
                .unwrap(),
        );
        let child = Arc::new(
            OverrideDef::new("Child", "A")
                .with_parent(parent)
                .with_loose_signatures(true),
        );
        let table = DispatchTable::from_overrides([child]);
        match table.resolve_member(&name("A"), &MemberSignature::new("m", ["string"]), 30) {
            MemberResolution::Member { via, .. } => assert_eq!(via, MatchKind::LooseInherited),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }
}
