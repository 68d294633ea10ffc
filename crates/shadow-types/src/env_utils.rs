//! Environment variable helpers for runner settings.
//!
//! Every runner knob can be overridden from the environment under the
//! `SHADOW_SANDBOX_` prefix, e.g. `SHADOW_SANDBOX_TIMEOUT_MS=250`.
//!
//! ```
//! use shadow_sandbox_types::env_utils::{env_var_or, prefixed};
//!
//! assert_eq!(prefixed("TIMEOUT_MS"), "SHADOW_SANDBOX_TIMEOUT_MS");
//! let timeout: u64 = env_var_or("SHADOW_SANDBOX_DOC_TIMEOUT_MS", 5000);
//! assert_eq!(timeout, 5000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "SHADOW_SANDBOX_";

/// Full variable name for a runner setting.
pub fn prefixed(key: &str) -> String {
    format!("{ENV_PREFIX}{key}")
}

/// Parse a variable; `None` when unset or unparsable.
pub fn env_var<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn env_var_or<T: FromStr>(key: &str, default: T) -> T {
    env_var(key).unwrap_or(default)
}

/// Truthy values are `1`, `true`, `yes` and `on`; falsy are `0`, `false`,
/// `no` and `off`. Anything else keeps the default.
pub fn env_bool_or(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

/// Millisecond duration, e.g. `SHADOW_SANDBOX_TIMEOUT_MS=50`.
pub fn env_millis_or(key: &str, default: Duration) -> Duration {
    env_var::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Comma-separated list; empty entries are dropped.
pub fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_parsing() {
        std::env::set_var("SHADOW_TYPES_TEST_U64", " 42 ");
        assert_eq!(env_var::<u64>("SHADOW_TYPES_TEST_U64"), Some(42));
        assert_eq!(env_var::<u64>("SHADOW_TYPES_TEST_MISSING_1"), None);
        assert_eq!(env_var_or("SHADOW_TYPES_TEST_MISSING_1", 7u32), 7);
        std::env::remove_var("SHADOW_TYPES_TEST_U64");
    }

    #[test]
    fn test_env_bool_or() {
        std::env::set_var("SHADOW_TYPES_TEST_BOOL_ON", "On");
        std::env::set_var("SHADOW_TYPES_TEST_BOOL_OFF", "0");
        std::env::set_var("SHADOW_TYPES_TEST_BOOL_JUNK", "maybe");

        assert!(env_bool_or("SHADOW_TYPES_TEST_BOOL_ON", false));
        assert!(!env_bool_or("SHADOW_TYPES_TEST_BOOL_OFF", true));
        assert!(env_bool_or("SHADOW_TYPES_TEST_BOOL_JUNK", true));
        assert!(!env_bool_or("SHADOW_TYPES_TEST_MISSING_2", false));

        std::env::remove_var("SHADOW_TYPES_TEST_BOOL_ON");
        std::env::remove_var("SHADOW_TYPES_TEST_BOOL_OFF");
        std::env::remove_var("SHADOW_TYPES_TEST_BOOL_JUNK");
    }

    #[test]
    fn test_env_millis_or() {
        std::env::set_var("SHADOW_TYPES_TEST_MS", "50");
        assert_eq!(
            env_millis_or("SHADOW_TYPES_TEST_MS", Duration::from_secs(1)),
            Duration::from_millis(50)
        );
        assert_eq!(
            env_millis_or("SHADOW_TYPES_TEST_MISSING_3", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        std::env::remove_var("SHADOW_TYPES_TEST_MS");
    }

    #[test]
    fn test_env_list() {
        std::env::set_var("SHADOW_TYPES_TEST_LIST", "app., ,lib.util ");
        assert_eq!(env_list("SHADOW_TYPES_TEST_LIST"), vec!["app.", "lib.util"]);
        assert!(env_list("SHADOW_TYPES_TEST_MISSING_4").is_empty());
        std::env::remove_var("SHADOW_TYPES_TEST_LIST");
    }
}
