use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Environment variable overriding `compaction.threshold`.
pub const THRESHOLD_ENV: &str = "CDVCS_COMPACTION_THRESHOLD";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Live graph size at which compaction kicks in.
    #[serde(default = "default_threshold")]
    pub threshold: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            threshold: default_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

/// Load the engine config from a TOML file. A missing file yields defaults.
///
/// # Errors
///
/// Fails if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<EngineConfig>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?
    } else {
        EngineConfig::default()
    };

    Ok(apply_env_overrides(config, env::var(THRESHOLD_ENV).ok()))
}

fn apply_env_overrides(mut config: EngineConfig, threshold: Option<String>) -> EngineConfig {
    if let Some(threshold) = threshold.as_deref().and_then(|raw| raw.trim().parse().ok()) {
        config.compaction.threshold = threshold;
    }
    config
}

const fn default_true() -> bool {
    true
}

const fn default_threshold() -> usize {
    100
}

const fn default_max_cas_retries() -> u32 {
    crate::store::memory::DEFAULT_MAX_CAS_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir must be created");
        let cfg = load_config(&dir.path().join("cdvcs.toml")).expect("load should succeed");
        assert!(cfg.compaction.enabled);
        assert_eq!(cfg.store.max_cas_retries, 64);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().expect("temp dir must be created");
        let path = dir.path().join("cdvcs.toml");
        std::fs::write(&path, "[compaction]\nenabled = false\n").expect("write config");

        let cfg = load_config(&path).expect("load should succeed");
        assert!(!cfg.compaction.enabled);
        assert_eq!(cfg.store, StoreConfig::default());
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir must be created");
        let path = dir.path().join("cdvcs.toml");
        std::fs::write(&path, "[compaction\n").expect("write config");

        let err = load_config(&path).expect_err("parse must fail");
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn env_threshold_overrides_file() {
        let cfg = apply_env_overrides(EngineConfig::default(), Some(" 250 ".to_string()));
        assert_eq!(cfg.compaction.threshold, 250);
    }

    #[test]
    fn unparsable_env_threshold_is_ignored() {
        let cfg = apply_env_overrides(EngineConfig::default(), Some("lots".to_string()));
        assert_eq!(cfg.compaction.threshold, 100);
    }
}
