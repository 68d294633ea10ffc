//! Error taxonomy for sandbox construction, dispatch and test outcomes.
//!
//! [`SandboxError`] covers configuration errors (raised while a sandbox is
//! built or configured) and dispatch errors (raised at the first offending
//! call). [`TestFailure`] is what a test run ends with when it does not pass.
//! Both travel inside `anyhow::Error` and are recovered with `downcast_ref`.

use shadow_sandbox_types::{MemberSignature, TypeName};
use std::time::Duration;

/// Configuration and dispatch errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// An override was declared for a target type that does not exist.
    UnresolvedTarget {
        target: TypeName,
        override_name: String,
    },

    /// A declarative source named an override the catalog does not know.
    UnknownOverride { name: String },

    /// Two different overrides were declared for one target in the same scope.
    ConflictingDeclarations {
        target: TypeName,
        scope: String,
        first: String,
        second: String,
    },

    /// An override declares members the target no longer has (API drift).
    /// Reported once per affected type with every missing member listed.
    MissingMembers {
        target: TypeName,
        override_name: String,
        members: Vec<MemberSignature>,
    },

    /// Several types failed verification in one configure step.
    Multiple(Vec<SandboxError>),

    /// A type requested from the isolated graph is not on the class path.
    UnknownType { name: TypeName },

    /// No member with this signature exists on the type or its supertypes.
    UnknownMember {
        class: TypeName,
        signature: MemberSignature,
    },

    /// A static initializer failed earlier; the type stays unusable in this sandbox.
    InitializationFailed { class: TypeName, message: String },

    /// An override member's contract is incompatible with the target member.
    SignatureMismatch {
        target: TypeName,
        member: MemberSignature,
        override_name: String,
        reason: String,
    },

    /// The exclusion regex did not compile.
    InvalidPattern { pattern: String, message: String },
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::UnresolvedTarget {
                target,
                override_name,
            } => write!(
                f,
                "override {} declares target {} which cannot be resolved",
                override_name, target
            ),
            SandboxError::UnknownOverride { name } => {
                write!(f, "unknown override '{}': not registered in the catalog", name)
            }
            SandboxError::ConflictingDeclarations {
                target,
                scope,
                first,
                second,
            } => write!(
                f,
                "conflicting {} declarations for {}: {} and {}",
                scope, target, first, second
            ),
            SandboxError::MissingMembers {
                target,
                override_name,
                members,
            } => {
                write!(
                    f,
                    "override {} expects members missing from {}: ",
                    override_name, target
                )?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", m)?;
                }
                Ok(())
            }
            SandboxError::Multiple(errors) => {
                write!(f, "{} configuration errors", errors.len())?;
                for e in errors {
                    write!(f, "\n  - {}", e)?;
                }
                Ok(())
            }
            SandboxError::UnknownType { name } => {
                write!(f, "type {} is not on the class path", name)
            }
            SandboxError::UnknownMember { class, signature } => {
                write!(f, "no member {} on {} or its supertypes", signature, class)
            }
            SandboxError::InitializationFailed { class, message } => {
                write!(f, "could not initialize {}: {}", class, message)
            }
            SandboxError::SignatureMismatch {
                target,
                member,
                override_name,
                reason,
            } => write!(
                f,
                "override {} does not match {}.{}: {}",
                override_name, target, member, reason
            ),
            SandboxError::InvalidPattern { pattern, message } => {
                write!(f, "invalid exclusion pattern '{}': {}", pattern, message)
            }
        }
    }
}

impl std::error::Error for SandboxError {}

impl SandboxError {
    /// Configuration errors are fatal when the sandbox is built or configured.
    pub fn is_configuration_error(&self) -> bool {
        !matches!(
            self,
            SandboxError::SignatureMismatch { .. }
                | SandboxError::UnknownMember { .. }
                | SandboxError::InitializationFailed { .. }
        )
    }
}

/// Why a test did not pass.
#[derive(Debug, Clone, PartialEq)]
pub enum TestFailure {
    /// Building the configuration or the sandbox failed.
    Configuration(String),

    /// Class-level setup failed; every method sharing the sandbox fails with it.
    ClassSetup(String),

    /// A before-hook or the body returned an error.
    Error(String),

    /// A before-hook or the body panicked.
    Panicked(String),

    /// The body exceeded its deadline.
    Timeout {
        timeout: Duration,
        /// Designated-thread backtrace captured where the interrupt was observed.
        backtrace: Option<String>,
        /// The body ignored the interrupt past the grace period and was abandoned.
        forced: bool,
    },

    /// A background thread spawned by the test failed while the test itself passed.
    Background { thread: String, message: String },
}

impl std::fmt::Display for TestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestFailure::Configuration(msg) => write!(f, "configuration error: {}", msg),
            TestFailure::ClassSetup(msg) => write!(f, "class setup failed: {}", msg),
            TestFailure::Error(msg) => f.write_str(msg),
            TestFailure::Panicked(msg) => write!(f, "panicked: {}", msg),
            TestFailure::Timeout {
                timeout, forced, ..
            } => {
                write!(f, "test timed out after {} milliseconds", timeout.as_millis())?;
                if *forced {
                    f.write_str(" (designated thread abandoned)")?;
                }
                Ok(())
            }
            TestFailure::Background { thread, message } => {
                write!(f, "background thread '{}' failed: {}", thread, message)
            }
        }
    }
}

impl std::error::Error for TestFailure {}

impl TestFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TestFailure::Timeout { .. })
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TestFailure::Configuration(_) => "configuration",
            TestFailure::ClassSetup(_) => "class_setup",
            TestFailure::Error(_) => "error",
            TestFailure::Panicked(_) => "panicked",
            TestFailure::Timeout { .. } => "timeout",
            TestFailure::Background { .. } => "background",
        }
    }
}

/// Render a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
