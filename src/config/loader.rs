//! Configuration loading from disk or an encoded blob.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fs;
use std::path::Path;

use crate::config::schema::Config;
use crate::error::{ProxyError, Result};

/// Load and parse a YAML config from a file.
pub fn load(path: &Path) -> Result<Config> {
    let data = fs::read(path).map_err(|source| ProxyError::ConfigRead {
        path: path.display().to_string(),
        source,
    })?;

    from_bytes(&data)
}

/// Parse a YAML config from raw bytes.
pub fn from_bytes(data: &[u8]) -> Result<Config> {
    Ok(serde_yaml::from_slice(data)?)
}

/// Decode a base64-encoded YAML config and parse it.
pub fn from_base64(blob: &str) -> Result<Config> {
    let decoded = STANDARD.decode(blob.trim())?;
    from_bytes(&decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = from_bytes(b"baseEndpoint: '\"http://localhost:9000\"'").unwrap();
        assert_eq!(cfg.base_endpoint, "\"http://localhost:9000\"");
        assert!(cfg.uri_groups.is_empty());
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = from_bytes(b"uriGroups: {not: [a list").unwrap_err();
        assert!(matches!(err, ProxyError::ConfigParse(_)));
    }

    #[test]
    fn round_trips_base64() {
        let yaml = "baseEndpoint: '\"http://localhost\"'\n";
        let blob = STANDARD.encode(yaml);
        let cfg = from_base64(&blob).unwrap();
        assert_eq!(cfg.base_endpoint, "\"http://localhost\"");
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(matches!(
            from_base64("!!not base64!!"),
            Err(ProxyError::ConfigDecode(_))
        ));
    }
}
