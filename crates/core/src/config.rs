//! Environment lookup helpers shared by every crate's config layer.
//!
//! Values are read from the process environment after an optional `.env`
//! file has been loaded. When a profile is active (`KEYSTONE_PROFILE=PROD`)
//! every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.

use std::env;
use std::str::FromStr;

/// Env var naming the active profile.
pub const PROFILE_VAR: &str = "KEYSTONE_PROFILE";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Active profile, upper-cased. Empty when no profile is set.
pub fn active_profile() -> String {
    env_or(PROFILE_VAR, "").to_uppercase()
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
pub fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Parse a profiled env var. Unparseable values are logged and ignored.
pub fn profiled_env_parse<T: FromStr>(profile: &str, key: &str) -> Option<T> {
    let raw = profiled_env_opt(profile, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        env::set_var("KEYSTONE_TEST_PLAIN_ONLY", "plain");
        env::set_var("KEYSTONE_TEST_BOTH", "plain");
        env::set_var("QA_KEYSTONE_TEST_BOTH", "prefixed");

        assert_eq!(profiled_env_opt("QA", "KEYSTONE_TEST_BOTH").as_deref(), Some("prefixed"));
        assert_eq!(profiled_env_opt("QA", "KEYSTONE_TEST_PLAIN_ONLY").as_deref(), Some("plain"));
        assert_eq!(profiled_env_opt("", "KEYSTONE_TEST_BOTH").as_deref(), Some("plain"));
    }

    #[test]
    fn empty_values_are_treated_as_unset() {
        env::set_var("KEYSTONE_TEST_EMPTY", "");
        assert_eq!(env_opt("KEYSTONE_TEST_EMPTY"), None);
        assert_eq!(env_or("KEYSTONE_TEST_EMPTY_MISSING", "fallback"), "fallback");
    }

    #[test]
    fn parse_ignores_garbage() {
        env::set_var("KEYSTONE_TEST_NUM", "12");
        env::set_var("KEYSTONE_TEST_BAD_NUM", "twelve");
        assert_eq!(profiled_env_parse::<u32>("", "KEYSTONE_TEST_NUM"), Some(12));
        assert_eq!(profiled_env_parse::<u32>("", "KEYSTONE_TEST_BAD_NUM"), None);
    }
}
