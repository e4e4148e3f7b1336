//! Errors raised while reading shared Vaultlink settings.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An environment variable was set to something unparseable.
    #[error("invalid value for {name}: {reason}")]
    InvalidEnv { name: String, reason: String },
}

impl Error {
    pub fn invalid_env(name: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidEnv {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_env_names_the_variable() {
        let err = Error::invalid_env("VAULTLINK_PING_INTERVAL_MS", "invalid digit found in string");
        assert_eq!(
            err.to_string(),
            "invalid value for VAULTLINK_PING_INTERVAL_MS: invalid digit found in string"
        );
    }
}
