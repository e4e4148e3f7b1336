//! Common helper functions for Vaultlink.

use std::time::Duration;

use crate::error::{Error, Result};

/// Reads a boolean flag from the environment.
///
/// `1`, `true`, `yes` and `on` (any case) are true; any other value is false.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Reads a millisecond duration from the environment.
pub fn env_duration_ms(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| Error::invalid_env(name, e)),
        Err(_) => Ok(default),
    }
}

/// Reads a comma-separated list from the environment, skipping empty items.
pub fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_defaults_when_unset() {
        assert!(env_bool("VAULTLINK_TEST_UNSET_FLAG", true));
        assert!(!env_bool("VAULTLINK_TEST_UNSET_FLAG", false));
    }

    #[test]
    fn test_env_duration_parses_and_rejects() {
        std::env::set_var("VAULTLINK_TEST_DURATION_OK", "250");
        assert_eq!(
            env_duration_ms("VAULTLINK_TEST_DURATION_OK", Duration::ZERO).unwrap(),
            Duration::from_millis(250)
        );

        std::env::set_var("VAULTLINK_TEST_DURATION_BAD", "soon");
        assert!(env_duration_ms("VAULTLINK_TEST_DURATION_BAD", Duration::ZERO).is_err());
    }

    #[test]
    fn test_env_list_skips_blanks() {
        std::env::set_var("VAULTLINK_TEST_LIST", "wss://a:443, ,wss://b:443,");
        assert_eq!(
            env_list("VAULTLINK_TEST_LIST"),
            vec!["wss://a:443".to_string(), "wss://b:443".to_string()]
        );
    }
}
