use std::path::Path;

use anyhow::{Context, Result};
use vaultlink_core::protocol::BootstrapRequest;
use vaultlink_crypto::Credential;

/// Load a `.creds` document from disk.
pub fn read_creds(path: &Path) -> Result<Credential> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading credentials from {}", path.display()))?;
    Credential::from_creds(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Bootstrap request for this device. A stable device id should be persisted by
/// the caller; `None` generates a fresh one.
pub fn bootstrap_request(
    device_id: Option<String>,
    device_type: &str,
    app_version: &str,
) -> BootstrapRequest {
    BootstrapRequest {
        device_id: device_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        device_type: device_type.to_string(),
        app_version: app_version.to_string(),
        requested_ttl_hours: None,
        session_public_key: None,
    }
}

/// Render a payload for display: pretty JSON when it parses, lossy UTF-8 otherwise.
pub fn render_payload(payload: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => serde_json::to_string_pretty(&value)
            .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned()),
        Err(_) => String::from_utf8_lossy(payload).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_request_generates_device_id() {
        let request = bootstrap_request(None, "cli", "1.0.0");
        assert!(uuid::Uuid::parse_str(&request.device_id).is_ok());
        assert!(request.session_public_key.is_none());

        let fixed = bootstrap_request(Some("dev-1".into()), "cli", "1.0.0");
        assert_eq!(fixed.device_id, "dev-1");
    }

    #[test]
    fn test_render_payload() {
        assert_eq!(render_payload(br#"{"a":1}"#), "{\n  \"a\": 1\n}");
        assert_eq!(render_payload(b"plain text"), "plain text");
    }

    #[test]
    fn test_read_creds_missing_file() {
        let err = read_creds(Path::new("/nonexistent/vaultlink.creds")).unwrap_err();
        assert!(err.to_string().contains("reading credentials"));
    }
}
