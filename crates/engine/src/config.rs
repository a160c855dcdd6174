//! Engine configuration.
//!
//! Loaded from TOML; command-line flags override file values. Everything
//! has a default, so an empty configuration is valid.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration of an engine run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of cycles each context explores.
    pub cycle_bound: u32,
    /// Fixed RNG seed; absent means seeded from entropy.
    pub seed: Option<u64>,
    /// Directory the derived test suite is written to.
    pub output_directory: PathBuf,
    /// Run the shadow divergence engine instead of the plain one.
    pub shadow: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cycle_bound: 1,
            seed: None,
            output_directory: PathBuf::from("test_suite"),
            shadow: false,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        toml::from_str(toml_str).map_err(|e| format!("Failed to parse engine config: {}", e))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::from_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.cycle_bound, 1);
        assert_eq!(config.seed, None);
        assert!(!config.shadow);
    }

    #[test]
    fn test_full_config() {
        let config = EngineConfig::from_toml(
            "cycle_bound = 3\nseed = 7\noutput_directory = \"out\"\nshadow = true\n",
        )
        .unwrap();
        assert_eq!(config.cycle_bound, 3);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.output_directory, PathBuf::from("out"));
        assert!(config.shadow);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(EngineConfig::from_toml("cycles = 3").is_err());
    }
}
