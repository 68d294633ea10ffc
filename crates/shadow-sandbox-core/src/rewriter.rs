//! Build-time rewriting of host definitions into sandbox types.
//!
//! For an instrumented type every member gets a dispatch entry point and the
//! original body is preserved as a direct-original entry that only the
//! dispatcher can reach. Pass-through and non-instrumented types keep direct
//! entry points. Instrumented types always expose a static initializer and,
//! when they declare no constructor, a nullary one, so overrides can replace
//! both.

use crate::classes::{ClassDef, MemberBody, MemberKind};
use crate::config::Configuration;
use crate::errors::SandboxError;
use crate::overrides::OverrideDef;
use shadow_sandbox_types::{MemberSignature, SdkLevel, TypeName};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// How a type participates in the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Resolved by the host: shared statics, no rewriting.
    PassThrough,
    /// Loaded into the isolated graph with fresh statics but not rewritten.
    Acquired,
    /// Loaded into the isolated graph and rewritten.
    Instrumented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// Calls go through the dispatcher.
    Dispatch,
    /// Calls run the original body (after call-site interception).
    Direct,
}

#[derive(Clone)]
pub struct RewrittenMember {
    pub signature: MemberSignature,
    pub kind: MemberKind,
    pub returns: TypeName,
    pub entry: EntryPoint,
    /// Synthesized by the rewriter; the host definition had no such member.
    pub synthetic: bool,
    direct: Option<MemberBody>,
}

impl RewrittenMember {
    pub(crate) fn direct(&self) -> Option<&MemberBody> {
        self.direct.as_ref()
    }

    pub fn is_native(&self) -> bool {
        self.direct.is_none() && !self.synthetic
    }
}

impl fmt::Debug for RewrittenMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewrittenMember")
            .field("signature", &self.signature.to_string())
            .field("kind", &self.kind)
            .field("entry", &self.entry)
            .field("synthetic", &self.synthetic)
            .finish()
    }
}

/// The isolated-graph counterpart of a host type.
#[derive(Debug, Clone)]
pub struct RewrittenClass {
    pub name: TypeName,
    /// Definition actually loaded; differs from `name` under a translation.
    pub source: TypeName,
    pub superclass: Option<TypeName>,
    pub is_interface: bool,
    pub disposition: Disposition,
    members: BTreeMap<MemberSignature, RewrittenMember>,
}

impl RewrittenClass {
    pub fn member(&self, signature: &MemberSignature) -> Option<&RewrittenMember> {
        self.members.get(signature)
    }

    pub fn members(&self) -> impl Iterator<Item = &RewrittenMember> {
        self.members.values()
    }

    pub fn is_instrumented(&self) -> bool {
        self.disposition == Disposition::Instrumented
    }

    pub fn has_constructors(&self) -> bool {
        self.members.values().any(|m| m.kind == MemberKind::Constructor)
    }
}

pub struct GraphRewriter {
    config: Arc<Configuration>,
}

impl GraphRewriter {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn disposition(&self, requested: &TypeName, def: &ClassDef) -> Disposition {
        if !self.config.should_acquire(requested) {
            Disposition::PassThrough
        } else if def.force_instrument
            || (!def.do_not_instrument && self.config.should_instrument(requested))
        {
            Disposition::Instrumented
        } else {
            Disposition::Acquired
        }
    }

    /// Rewrite `def`, loaded for the name `requested`.
    pub fn rewrite(&self, requested: &TypeName, def: &ClassDef) -> RewrittenClass {
        let disposition = self.disposition(requested, def);
        let entry = match disposition {
            Disposition::Instrumented => EntryPoint::Dispatch,
            _ => EntryPoint::Direct,
        };

        let mut members: BTreeMap<MemberSignature, RewrittenMember> = def
            .members()
            .map(|m| {
                (
                    m.signature.clone(),
                    RewrittenMember {
                        signature: m.signature.clone(),
                        kind: m.kind,
                        returns: m.returns.clone(),
                        entry,
                        synthetic: false,
                        direct: m.body.clone(),
                    },
                )
            })
            .collect();

        if disposition == Disposition::Instrumented && !def.is_interface {
            let clinit = MemberSignature::static_initializer();
            members
                .entry(clinit.clone())
                .or_insert_with(|| synthetic(clinit, MemberKind::StaticInit));
            if !members.values().any(|m| m.kind == MemberKind::Constructor) {
                let ctor = MemberSignature::constructor(std::iter::empty::<TypeName>());
                members.insert(ctor.clone(), synthetic(ctor, MemberKind::Constructor));
            }
        }

        debug!(
            class = %requested,
            source = %def.name,
            ?disposition,
            members = members.len(),
            "rewrote class"
        );

        RewrittenClass {
            name: requested.clone(),
            source: def.name.clone(),
            superclass: def.superclass.clone(),
            is_interface: def.is_interface,
            disposition,
            members,
        }
    }

    /// Check that every member `def` declares exists on its target or one of
    /// the target's supertypes (`ancestry`, nearest first). All missing
    /// members of the type are reported together.
    pub fn verify_override(
        &self,
        def: &OverrideDef,
        ancestry: &[Arc<ClassDef>],
        sdk: SdkLevel,
    ) -> Result<(), SandboxError> {
        let missing: Vec<MemberSignature> = def
            .members()
            .filter(|m| m.sdk.contains(sdk))
            .map(|m| &m.signature)
            .filter(|sig| !is_always_present(sig))
            .filter(|sig| {
                let exact = ancestry.iter().any(|c| c.member(sig).is_some());
                let loose = def.loose_signatures
                    && sig.is_all_generic()
                    && ancestry
                        .iter()
                        .any(|c| c.has_member_named(sig.name(), sig.arity()));
                !exact && !loose
            })
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::MissingMembers {
                target: def.target.clone(),
                override_name: def.name.clone(),
                members: missing,
            })
        }
    }
}

/// Members the rewriter synthesizes on every instrumented type.
fn is_always_present(sig: &MemberSignature) -> bool {
    sig.is_static_initializer() || (sig.is_constructor() && sig.arity() == 0)
}

fn synthetic(signature: MemberSignature, kind: MemberKind) -> RewrittenMember {
    RewrittenMember {
        signature,
        kind,
        returns: TypeName::new("void"),
        entry: EntryPoint::Dispatch,
        synthetic: true,
        direct: None,
    }
}
