//! Configuration for the Trellis CLI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Trellis configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Shared overlay secret (passphrase); every node of one overlay must
    /// carry the same value
    #[serde(default)]
    pub secret: Option<String>,

    /// Override for the advertised hostname label
    #[serde(default)]
    pub hostname: Option<String>,

    /// Reply deadline for admin commands, in seconds
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

fn default_deadline_secs() -> u64 {
    30
}

impl Config {
    /// Default config path (`~/.config/trellis/config.toml`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trellis")
            .join("config.toml")
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("cannot parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load the default config file when present, otherwise defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "secret = \"correct horse\"\nhostname = \"edge-1\"\ndeadline_secs = 5"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.secret.as_deref(), Some("correct horse"));
        assert_eq!(config.hostname.as_deref(), Some("edge-1"));
        assert_eq!(config.deadline_secs, 5);
    }

    #[test]
    fn test_defaults_apply() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "secret = \"s\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.deadline_secs, 30);
        assert!(config.hostname.is_none());
    }

    #[test]
    fn test_bad_toml_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "secret = [not toml").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
