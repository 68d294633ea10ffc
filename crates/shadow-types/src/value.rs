//! Dynamic values passed through dispatched calls.
//!
//! A sandboxed call receives and returns [`Value`]s. Objects are shared
//! [`ObjectRef`]s: an [`Instance`] knows its runtime class, holds its own
//! fields, and may carry shadow state owned by the override bound to it when
//! it was constructed.

use crate::names::TypeName;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Fields = BTreeMap<String, Value>;
pub type ObjectRef = Arc<Instance>;

/// Return types that produce [`Value::Unit`].
const UNIT_TYPES: &[&str] = &["void", "unit"];
const BOOL_TYPES: &[&str] = &["bool", "boolean"];
const INT_TYPES: &[&str] = &["int", "long", "short", "byte", "char", "i32", "i64"];
const FLOAT_TYPES: &[&str] = &["float", "double", "f32", "f64"];

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Object(ObjectRef),
}

impl Value {
    /// The value a native or do-nothing member returns for `return_type`.
    pub fn default_for(return_type: &TypeName) -> Self {
        let t = return_type.as_str();
        if UNIT_TYPES.contains(&t) {
            Value::Unit
        } else if BOOL_TYPES.contains(&t) {
            Value::Bool(false)
        } else if INT_TYPES.contains(&t) {
            Value::Int(0)
        } else if FLOAT_TYPES.contains(&t) {
            Value::Float(0.0)
        } else {
            Value::Null
        }
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Short kind label used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Object(_) => "object",
        }
    }
}

impl PartialEq for Value {
    /// Objects compare by identity; everything else by value.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) | (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Unit => f.write_str("Unit"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes(len={})", v.len()),
            Value::List(v) => f.debug_tuple("List").field(v).finish(),
            Value::Object(o) => write!(f, "Object({}#{})", o.class(), o.id()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Object(v)
    }
}

// =============================================================================
// Instances
// =============================================================================

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-instance state owned by the override bound at construction.
#[derive(Debug, Clone)]
pub struct ShadowState {
    pub override_type: String,
    pub fields: Fields,
}

/// An object created inside a sandbox.
pub struct Instance {
    id: u64,
    class: TypeName,
    fields: Mutex<Fields>,
    shadow: Mutex<Option<ShadowState>>,
}

impl Instance {
    pub fn new(class: TypeName) -> ObjectRef {
        Arc::new(Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            class,
            fields: Mutex::new(Fields::new()),
            shadow: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runtime class of the instance.
    pub fn class(&self) -> &TypeName {
        &self.class
    }

    pub fn get_field(&self, name: &str) -> Value {
        self.fields.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn set_field(&self, name: impl Into<String>, value: Value) {
        self.fields.lock().insert(name.into(), value);
    }

    /// Attach fresh shadow state. Rebinding replaces any previous state.
    pub fn bind_shadow(&self, override_type: impl Into<String>) {
        *self.shadow.lock() = Some(ShadowState {
            override_type: override_type.into(),
            fields: Fields::new(),
        });
    }

    /// Name of the override whose state is bound, if any.
    pub fn shadow_type(&self) -> Option<String> {
        self.shadow.lock().as_ref().map(|s| s.override_type.clone())
    }

    pub fn shadow_get(&self, name: &str) -> Value {
        self.shadow
            .lock()
            .as_ref()
            .and_then(|s| s.fields.get(name).cloned())
            .unwrap_or_default()
    }

    /// Returns `false` when no shadow state is bound.
    pub fn shadow_set(&self, name: impl Into<String>, value: Value) -> bool {
        match self.shadow.lock().as_mut() {
            Some(state) => {
                state.fields.insert(name.into(), value);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("shadow", &self.shadow_type())
            .finish()
    }
}

// =============================================================================
// Static storage
// =============================================================================

/// Static fields of one class. Held by the graph that loaded the class, so
/// dropping the graph drops the statics.
#[derive(Default)]
pub struct StaticFields {
    fields: Mutex<Fields>,
}

impl StaticFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Value {
        self.fields.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.lock().insert(name.into(), value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.lock().contains_key(name)
    }

    pub fn clear(&self) {
        self.fields.lock().clear();
    }

    pub fn snapshot(&self) -> Fields {
        self.fields.lock().clone()
    }
}

impl fmt::Debug for StaticFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.lock().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_for_return_types() {
        assert_eq!(Value::default_for(&TypeName::new("void")), Value::Unit);
        assert_eq!(Value::default_for(&TypeName::new("boolean")), Value::Bool(false));
        assert_eq!(Value::default_for(&TypeName::new("long")), Value::Int(0));
        assert_eq!(Value::default_for(&TypeName::new("double")), Value::Float(0.0));
        assert_eq!(Value::default_for(&TypeName::new("string")), Value::Null);
    }

    #[test]
    fn test_object_identity_equality() {
        let a = Instance::new(TypeName::new("app.Widget"));
        let b = Instance::new(TypeName::new("app.Widget"));
        assert_eq!(Value::Object(a.clone()), Value::Object(a.clone()));
        assert_ne!(Value::Object(a), Value::Object(b));
    }

    #[test]
    fn test_instance_fields_and_shadow_state() {
        let obj = Instance::new(TypeName::new("app.Widget"));
        obj.set_field("width", Value::Int(10));
        assert_eq!(obj.get_field("width"), Value::Int(10));
        assert!(obj.get_field("missing").is_null());

        assert!(!obj.shadow_set("text", Value::str("hi")));
        obj.bind_shadow("shadows.ShadowWidget");
        assert_eq!(obj.shadow_type().as_deref(), Some("shadows.ShadowWidget"));
        assert!(obj.shadow_set("text", Value::str("hi")));
        assert_eq!(obj.shadow_get("text"), Value::str("hi"));
    }

    #[test]
    fn test_static_fields() {
        let statics = StaticFields::new();
        assert!(!statics.contains("count"));
        assert_eq!(statics.set("count", Value::Int(1)), None);
        assert_eq!(statics.set("count", Value::Int(2)), Some(Value::Int(1)));
        assert_eq!(statics.snapshot().len(), 1);
        statics.clear();
        assert!(statics.get("count").is_null());
    }
}
