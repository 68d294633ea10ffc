//! Shared types for the shadow-sandbox workspace.
//!
//! This crate holds the vocabulary every other crate speaks:
//! - [`names`]: type names, member signatures and method references
//! - [`value`]: the dynamic values and instances that flow through dispatched calls
//! - [`sdk`]: platform SDK levels and ranges
//! - [`env_utils`]: `SHADOW_SANDBOX_*` environment overrides

pub mod env_utils;
pub mod names;
pub mod sdk;
pub mod value;

pub use names::{
    MemberSignature, MethodRef, TypeName, CONSTRUCTOR, GENERIC_PARAM, STATIC_INITIALIZER,
    WILDCARD_MEMBER,
};
pub use sdk::{SdkLevel, SdkRange, LATEST_SDK, OLDEST_SDK};
pub use value::{Fields, Instance, ObjectRef, ShadowState, StaticFields, Value};
