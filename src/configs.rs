use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Looked up in the working directory when no `-c` file is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Protocol identifiers, most preferred first.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            protocols: default_protocols(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_protocols() -> Vec<String> {
    ["TLSv1", "TLS", "SSLv3", "SSL"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_store_each_certificate")]
    pub store_each_certificate: bool,
    #[serde(default = "default_export_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            store_each_certificate: default_store_each_certificate(),
            directory: default_export_directory(),
            extension: default_extension(),
        }
    }
}

fn default_store_each_certificate() -> bool {
    true
}

fn default_export_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_extension() -> String {
    "cer".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Use `path` when given, else `config.toml` if it exists, else the
    /// built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.connection.timeout(), Duration::from_secs(10));
        assert_eq!(
            config.connection.protocols,
            vec!["TLSv1", "TLS", "SSLv3", "SSL"]
        );
        assert!(config.export.store_each_certificate);
        assert_eq!(config.export.directory, PathBuf::from("."));
        assert_eq!(config.export.extension, "cer");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloader.toml");
        fs::write(
            &path,
            "[connection]\ntimeout_ms = 2500\n\n[export]\nextension = \"der\"\n",
        )
        .unwrap();

        let config = AppConfig::load_or_default(Some(path.as_path())).unwrap();
        assert_eq!(config.connection.timeout_ms, 2500);
        assert_eq!(config.connection.protocols.len(), 4);
        assert_eq!(config.export.extension, "der");
        assert!(config.export.store_each_certificate);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.toml");
        assert!(AppConfig::from_file(&absent).is_err());
        assert!(AppConfig::load_or_default(Some(absent.as_path())).is_err());
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\ntimeout_ms = ").unwrap();
        assert!(AppConfig::from_file(&path).is_err());
    }
}
