use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Service configuration, loaded from a TOML file with sensible defaults
/// for every field.
#[derive(Debug, Clone, serde_derive::Deserialize)]
pub struct Config {
    /// Root directory for logs, exports and persisted settings.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Base URL under which the data directory is served for downloads.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Bearer token required by the API. Unset allows loopback-only access.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_host: default_api_host(),
            api_port: default_api_port(),
            public_url: None,
            api_token: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from `crank.toml` in the default
    /// data directory. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_data_dir().join("crank.toml"),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config at {}", path.display()))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("crank")
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8712
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/crank.toml"))).expect("load");
        assert_eq!(config.api_host, "127.0.0.1");
        assert!(config.api_token.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crank.toml");
        std::fs::write(&path, "api_port = 9000\npublic_url = \"http://dl.example\"\n")
            .expect("write");
        let config = Config::load(Some(&path)).expect("load");
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.public_url.as_deref(), Some("http://dl.example"));
        assert_eq!(config.api_host, "127.0.0.1");
    }
}
