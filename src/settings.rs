//! User settings file reader.
//!
//! Settings live at `$HOME/<base>` with one of the extensions `.json`,
//! `.yaml`, `.yml`, `.toml`, tried in order; the first existing file wins.
//! A missing file yields the defaults. `vars` is exposed to templates and
//! expressions as `settings`.

use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ProxyError, Result};

const EXTENSIONS: [&str; 4] = ["json", "yaml", "yml", "toml"];

/// User settings.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Start the proxy immediately when the shell launches.
    pub auto_start_proxy: bool,

    /// Free-form user variables, exposed to the renderer as `settings`.
    pub vars: serde_json::Map<String, serde_json::Value>,
}

/// Read settings from `$HOME/<base>.{json,yaml,yml,toml}`.
pub fn read(base: &str) -> Result<Settings> {
    let home = std::env::var("HOME").unwrap_or_default();
    read_from(&Path::new(&home).join(base))
}

/// Read settings given the extension-less base path.
pub fn read_from(base: &Path) -> Result<Settings> {
    for ext in EXTENSIONS {
        let path = PathBuf::from(format!("{}.{ext}", base.display()));

        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ProxyError::ConfigRead {
                    path: path.display().to_string(),
                    source: err,
                })
            }
        };

        let settings = match ext {
            "json" => serde_json::from_str(&data).map_err(|e| invalid(&path, e))?,
            "toml" => toml::from_str(&data).map_err(|e| invalid(&path, e))?,
            _ => serde_yaml::from_str(&data)?,
        };

        tracing::debug!(path = %path.display(), "settings loaded");
        return Ok(settings);
    }

    Ok(Settings::default())
}

fn invalid(path: &Path, err: impl std::fmt::Display) -> ProxyError {
    ProxyError::ConfigRead {
        path: path.display().to_string(),
        source: io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = read_from(&dir.path().join("settings")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn first_extension_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{"autoStartProxy": true, "vars": {"env": "prod"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("settings.yaml"), "autoStartProxy: false").unwrap();

        let settings = read_from(&dir.path().join("settings")).unwrap();
        assert!(settings.auto_start_proxy);
        assert_eq!(settings.vars["env"], "prod");
    }

    #[test]
    fn reads_yaml_and_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yml"), "vars:\n  model: claude\n").unwrap();
        let settings = read_from(&dir.path().join("a")).unwrap();
        assert_eq!(settings.vars["model"], "claude");

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.toml"), "autoStartProxy = true\n[vars]\nx = 1\n")
            .unwrap();
        let settings = read_from(&dir.path().join("b")).unwrap();
        assert!(settings.auto_start_proxy);
        assert_eq!(settings.vars["x"], 1);
    }
}
