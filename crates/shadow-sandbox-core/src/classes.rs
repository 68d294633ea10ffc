//! Host-side type definitions and the class path.
//!
//! Host code registers every type the tests can reach as a [`ClassDef`]. A
//! definition is never executed directly: the isolated graph either rewrites
//! it (adding dispatch entry points) or, for pass-through types, uses it as-is.

use crate::dispatcher::CallContext;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use shadow_sandbox_types::{MemberSignature, StaticFields, TypeName, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Executable member body.
pub type MemberBody = Arc<dyn Fn(&CallContext, &[Value]) -> Result<Value> + Send + Sync>;

/// Wrap a closure as a [`MemberBody`].
pub fn body<F>(f: F) -> MemberBody
where
    F: Fn(&CallContext, &[Value]) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Instance,
    Static,
    /// `<init>`
    Constructor,
    /// `<clinit>`
    StaticInit,
}

impl MemberKind {
    pub fn is_static(self) -> bool {
        matches!(self, MemberKind::Static | MemberKind::StaticInit)
    }
}

#[derive(Clone)]
pub struct MemberDef {
    pub signature: MemberSignature,
    pub kind: MemberKind,
    pub returns: TypeName,
    /// `None` for native members.
    pub body: Option<MemberBody>,
}

impl MemberDef {
    pub fn instance(signature: MemberSignature, returns: impl Into<TypeName>, body: MemberBody) -> Self {
        Self {
            signature,
            kind: MemberKind::Instance,
            returns: returns.into(),
            body: Some(body),
        }
    }

    pub fn static_fn(signature: MemberSignature, returns: impl Into<TypeName>, body: MemberBody) -> Self {
        Self {
            signature,
            kind: MemberKind::Static,
            returns: returns.into(),
            body: Some(body),
        }
    }

    pub fn constructor(signature: MemberSignature, body: MemberBody) -> Self {
        Self {
            signature,
            kind: MemberKind::Constructor,
            returns: TypeName::new("void"),
            body: Some(body),
        }
    }

    pub fn static_init(body: MemberBody) -> Self {
        Self {
            signature: MemberSignature::static_initializer(),
            kind: MemberKind::StaticInit,
            returns: TypeName::new("void"),
            body: Some(body),
        }
    }

    /// A member with no body. Calls that reach the original return the
    /// default value of `returns`.
    pub fn native(signature: MemberSignature, kind: MemberKind, returns: impl Into<TypeName>) -> Self {
        Self {
            signature,
            kind,
            returns: returns.into(),
            body: None,
        }
    }

    pub fn is_native(&self) -> bool {
        self.body.is_none()
    }
}

impl fmt::Debug for MemberDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberDef")
            .field("signature", &self.signature.to_string())
            .field("kind", &self.kind)
            .field("returns", &self.returns)
            .field("native", &self.is_native())
            .finish()
    }
}

/// Definition of one host type.
#[derive(Clone, Debug)]
pub struct ClassDef {
    pub name: TypeName,
    pub superclass: Option<TypeName>,
    pub is_interface: bool,
    /// Never rewritten, even when acquired.
    pub do_not_instrument: bool,
    /// Always rewritten when acquired, regardless of exclusion rules.
    pub force_instrument: bool,
    members: BTreeMap<MemberSignature, MemberDef>,
}

impl ClassDef {
    pub fn new(name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            is_interface: false,
            do_not_instrument: false,
            force_instrument: false,
            members: BTreeMap::new(),
        }
    }

    pub fn with_superclass(mut self, superclass: impl Into<TypeName>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn with_interface(mut self, is_interface: bool) -> Self {
        self.is_interface = is_interface;
        self
    }

    pub fn with_do_not_instrument(mut self, flag: bool) -> Self {
        self.do_not_instrument = flag;
        self
    }

    pub fn with_force_instrument(mut self, flag: bool) -> Self {
        self.force_instrument = flag;
        self
    }

    pub fn with_member(mut self, member: MemberDef) -> Self {
        self.members.insert(member.signature.clone(), member);
        self
    }

    /// Shorthand for an instance method.
    pub fn method<F>(self, signature: &str, returns: &str, f: F) -> Result<Self>
    where
        F: Fn(&CallContext, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Ok(self.with_member(MemberDef::instance(signature.parse()?, returns, body(f))))
    }

    /// Shorthand for a static method.
    pub fn static_method<F>(self, signature: &str, returns: &str, f: F) -> Result<Self>
    where
        F: Fn(&CallContext, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Ok(self.with_member(MemberDef::static_fn(signature.parse()?, returns, body(f))))
    }

    /// Shorthand for a constructor; `params` is the comma-separated parameter list.
    pub fn constructor<F>(self, params: &str, f: F) -> Result<Self>
    where
        F: Fn(&CallContext, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let sig: MemberSignature = format!("{}({})", shadow_sandbox_types::CONSTRUCTOR, params).parse()?;
        Ok(self.with_member(MemberDef::constructor(sig, body(f))))
    }

    pub fn static_initializer<F>(self, f: F) -> Self
    where
        F: Fn(&CallContext, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.with_member(MemberDef::static_init(body(f)))
    }

    pub fn member(&self, signature: &MemberSignature) -> Option<&MemberDef> {
        self.members.get(signature)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberDef> {
        self.members.values()
    }

    /// Any member with this name and arity.
    pub fn has_member_named(&self, name: &str, arity: usize) -> bool {
        self.members
            .keys()
            .any(|sig| sig.name() == name && sig.arity() == arity)
    }
}

// =============================================================================
// Class path
// =============================================================================

/// Registry of host type definitions shared by every sandbox.
///
/// Pass-through types live here for the whole process: their statics are
/// the host's statics and are shared by every sandbox that touches them.
#[derive(Default)]
pub struct ClassPath {
    classes: HashMap<TypeName, Arc<ClassDef>>,
    host_statics: Mutex<HashMap<TypeName, Arc<StaticFields>>>,
    host_initialized: Mutex<HashSet<TypeName>>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Registering a name twice is an error.
    pub fn register(&mut self, class: ClassDef) -> Result<()> {
        if self.classes.contains_key(&class.name) {
            return Err(anyhow!("type {} is already registered", class.name));
        }
        self.classes.insert(class.name.clone(), Arc::new(class));
        Ok(())
    }

    pub fn with_class(mut self, class: ClassDef) -> Result<Self> {
        self.register(class)?;
        Ok(self)
    }

    pub fn get(&self, name: &TypeName) -> Option<Arc<ClassDef>> {
        self.classes.get(name).cloned()
    }

    pub fn contains(&self, name: &TypeName) -> bool {
        self.classes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &TypeName> {
        self.classes.keys()
    }

    /// Process-wide statics of a pass-through type.
    pub fn host_statics(&self, name: &TypeName) -> Arc<StaticFields> {
        self.host_statics
            .lock()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(StaticFields::new()))
            .clone()
    }

    /// Returns `true` exactly once per type: the caller runs the host `<clinit>`.
    pub fn mark_host_initialized(&self, name: &TypeName) -> bool {
        self.host_initialized.lock().insert(name.clone())
    }

    /// `name` followed by its superclasses, nearest first. Stops at the first
    /// name that is not registered.
    pub fn ancestry(&self, name: &TypeName) -> Vec<Arc<ClassDef>> {
        let mut chain = Vec::new();
        let mut current = self.get(name);
        while let Some(class) = current {
            current = class.superclass.as_ref().and_then(|s| self.get(s));
            chain.push(class);
            if chain.len() > 256 {
                break;
            }
        }
        chain
    }
}

impl fmt::Debug for ClassPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.classes.keys().map(TypeName::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ClassPath").field("classes", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClassDef {
        ClassDef::new("platform.widget.TextView")
            .with_superclass("platform.view.View")
            .method("getText()", "string", |_, _| Ok(Value::str("")))
            .unwrap()
            .with_member(MemberDef::native(
                MemberSignature::nullary("nativeMeasure"),
                MemberKind::Instance,
                "int",
            ))
    }

    #[test]
    fn test_class_def_members() {
        let class = sample();
        let get_text = class.member(&MemberSignature::nullary("getText")).unwrap();
        assert_eq!(get_text.kind, MemberKind::Instance);
        assert!(!get_text.is_native());
        assert!(class
            .member(&MemberSignature::nullary("nativeMeasure"))
            .unwrap()
            .is_native());
        assert!(class.has_member_named("getText", 0));
        assert!(!class.has_member_named("getText", 1));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut path = ClassPath::new();
        path.register(sample()).unwrap();
        assert!(path.register(sample()).is_err());
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn test_ancestry_nearest_first() {
        let path = ClassPath::new()
            .with_class(ClassDef::new("platform.view.View"))
            .unwrap()
            .with_class(sample())
            .unwrap();
        let chain: Vec<_> = path
            .ancestry(&TypeName::new("platform.widget.TextView"))
            .iter()
            .map(|c| c.name.to_string())
            .collect();
        assert_eq!(chain, vec!["platform.widget.TextView", "platform.view.View"]);
    }

    #[test]
    fn test_host_statics_shared_and_initialized_once() {
        let path = ClassPath::new();
        let name = TypeName::new("std.Host");
        path.host_statics(&name).set("x", Value::Int(1));
        assert_eq!(path.host_statics(&name).get("x"), Value::Int(1));
        assert!(path.mark_host_initialized(&name));
        assert!(!path.mark_host_initialized(&name));
    }
}
