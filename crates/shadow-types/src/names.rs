//! Type and member naming.
//!
//! Types are named by dotted paths (`platform.widget.TextView`). Members are
//! named by signatures rendered as `name(paramType,paramType)`, which is also
//! the form used when overrides and interceptors are declared.
//!
//! # Examples
//!
//! ```
//! use shadow_sandbox_types::names::{MemberSignature, MethodRef, TypeName};
//!
//! let sig: MemberSignature = "setText(string)".parse().unwrap();
//! assert_eq!(sig.name(), "setText");
//! assert_eq!(sig.arity(), 1);
//!
//! let target = TypeName::new("platform.widget.TextView");
//! assert_eq!(target.package(), "platform.widget");
//!
//! let r: MethodRef = "platform.SystemClock#*".parse().unwrap();
//! assert!(r.matches(&TypeName::new("platform.SystemClock"), "uptimeMillis"));
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Member name used for constructors.
pub const CONSTRUCTOR: &str = "<init>";

/// Member name used for the once-per-graph static initializer.
pub const STATIC_INITIALIZER: &str = "<clinit>";

/// Parameter type that matches any argument. Loose signatures are expressed
/// entirely in this type.
pub const GENERIC_PARAM: &str = "any";

/// Member name in a [`MethodRef`] that matches every member of the class.
pub const WILDCARD_MEMBER: &str = "*";

// =============================================================================
// TypeName
// =============================================================================

/// Fully-qualified name of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The generic parameter type used by loose signatures.
    pub fn generic() -> Self {
        Self(GENERIC_PARAM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Everything before the last `.`, or the empty string for unqualified names.
    pub fn package(&self) -> &str {
        match self.0.rfind('.') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// Everything after the last `.`.
    pub fn simple_name(&self) -> &str {
        match self.0.rfind('.') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn is_generic(&self) -> bool {
        self.0 == GENERIC_PARAM
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TypeName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for TypeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// MemberSignature
// =============================================================================

/// Name plus ordered parameter types of a member.
///
/// Two signatures are equal only when name and every parameter type match
/// exactly; the loose form is obtained through [`MemberSignature::generic_form`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberSignature {
    name: String,
    params: SmallVec<[TypeName; 4]>,
}

impl MemberSignature {
    pub fn new<I, T>(name: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeName>,
    {
        Self {
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Signature with no parameters.
    pub fn nullary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: SmallVec::new(),
        }
    }

    pub fn constructor<I, T>(params: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeName>,
    {
        Self::new(CONSTRUCTOR, params)
    }

    pub fn static_initializer() -> Self {
        Self::nullary(STATIC_INITIALIZER)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[TypeName] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR
    }

    pub fn is_static_initializer(&self) -> bool {
        self.name == STATIC_INITIALIZER
    }

    /// Same name and arity with every parameter replaced by [`GENERIC_PARAM`].
    pub fn generic_form(&self) -> Self {
        Self {
            name: self.name.clone(),
            params: self.params.iter().map(|_| TypeName::generic()).collect(),
        }
    }

    /// True when every parameter is generic (vacuously true for no parameters).
    pub fn is_all_generic(&self) -> bool {
        self.params.iter().all(TypeName::is_generic)
    }
}

impl fmt::Display for MemberSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", p)?;
        }
        f.write_str(")")
    }
}

impl FromStr for MemberSignature {
    type Err = anyhow::Error;

    /// Parse `name(a,b)`. A bare `name` is accepted as a nullary signature.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some(open) = s.find('(') else {
            if s.is_empty() || s.contains(')') {
                return Err(anyhow!("invalid member signature '{}'", s));
            }
            return Ok(Self::nullary(s));
        };

        let name = s[..open].trim();
        let rest = &s[open + 1..];
        let Some(params_str) = rest.strip_suffix(')') else {
            return Err(anyhow!("unbalanced parentheses in member signature '{}'", s));
        };
        if name.is_empty() {
            return Err(anyhow!("missing member name in signature '{}'", s));
        }
        if params_str.contains('(') || params_str.contains(')') {
            return Err(anyhow!("nested parentheses in member signature '{}'", s));
        }

        let params = params_str
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(TypeName::from);
        Ok(Self::new(name, params))
    }
}

impl Serialize for MemberSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MemberSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// MethodRef
// =============================================================================

/// Reference to a member by class and member name, used for call-site
/// interception. The member may be [`WILDCARD_MEMBER`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodRef {
    pub class: TypeName,
    pub member: String,
}

impl MethodRef {
    pub fn new(class: impl Into<TypeName>, member: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            member: member.into(),
        }
    }

    /// Reference covering every member of `class`.
    pub fn all(class: impl Into<TypeName>) -> Self {
        Self::new(class, WILDCARD_MEMBER)
    }

    pub fn is_wildcard(&self) -> bool {
        self.member == WILDCARD_MEMBER
    }

    pub fn matches(&self, class: &TypeName, member: &str) -> bool {
        &self.class == class && (self.is_wildcard() || self.member == member)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.member)
    }
}

impl FromStr for MethodRef {
    type Err = anyhow::Error;

    /// Parse `some.Class#member` or `some.Class#*`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('#') {
            Some((class, member)) if !class.is_empty() && !member.is_empty() => {
                Ok(Self::new(class, member))
            }
            _ => Err(anyhow!(
                "invalid method reference '{}'. Expected 'some.Class#member'",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_name_parts() {
        let name = TypeName::new("platform.widget.TextView");
        assert_eq!(name.package(), "platform.widget");
        assert_eq!(name.simple_name(), "TextView");

        let bare = TypeName::new("Root");
        assert_eq!(bare.package(), "");
        assert_eq!(bare.simple_name(), "Root");
    }

    #[test]
    fn test_signature_parse_and_display() {
        let sig: MemberSignature = "setText( string , int )".parse().unwrap();
        assert_eq!(sig.name(), "setText");
        assert_eq!(sig.params(), &[TypeName::new("string"), TypeName::new("int")]);
        assert_eq!(sig.to_string(), "setText(string,int)");

        let nullary: MemberSignature = "close()".parse().unwrap();
        assert_eq!(nullary.arity(), 0);
        assert_eq!(nullary, "close".parse::<MemberSignature>().unwrap());
    }

    #[test]
    fn test_signature_parse_rejects_garbage() {
        assert!("".parse::<MemberSignature>().is_err());
        assert!("broken(int".parse::<MemberSignature>().is_err());
        assert!("(int)".parse::<MemberSignature>().is_err());
        assert!("a(b(c))".parse::<MemberSignature>().is_err());
    }

    #[test]
    fn test_generic_form() {
        let sig = MemberSignature::new("put", ["string", "int"]);
        let generic = sig.generic_form();
        assert_eq!(generic.to_string(), "put(any,any)");
        assert!(generic.is_all_generic());
        assert!(!sig.is_all_generic());
    }

    #[test]
    fn test_special_members() {
        assert!(MemberSignature::constructor(["int"]).is_constructor());
        assert!(MemberSignature::static_initializer().is_static_initializer());
    }

    #[test]
    fn test_signature_serde_as_string() {
        let sig = MemberSignature::new("get", ["int"]);
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, "\"get(int)\"");
        let back: MemberSignature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn test_method_ref_matching() {
        let exact: MethodRef = "platform.util.Log#println".parse().unwrap();
        let log = TypeName::new("platform.util.Log");
        assert!(exact.matches(&log, "println"));
        assert!(!exact.matches(&log, "flush"));

        let wildcard = MethodRef::all("platform.util.Log");
        assert!(wildcard.matches(&log, "flush"));
        assert!(!wildcard.matches(&TypeName::new("platform.util.Other"), "flush"));

        assert!("no-hash".parse::<MethodRef>().is_err());
        assert!("#member".parse::<MethodRef>().is_err());
    }
}
