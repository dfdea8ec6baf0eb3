//! Configuration for a consensus instance.
//!
//! Loads optional `floe.toml` from the data directory. Host-supplied
//! values override config file values; if no file exists, defaults are
//! used. Parameters are validated before the engine starts.

use serde::Deserialize;
use std::path::Path;

use crate::constants;

/// Errors from parameter validation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("k must be positive")]
    ZeroK,
    #[error("k ({0}) exceeds the 64-voter poll limit")]
    KTooLarge(usize),
    #[error("alpha ({alpha}) must satisfy k/2 < alpha <= k ({k})")]
    BadAlpha { alpha: usize, k: usize },
    #[error("beta_virtuous ({virtuous}) must satisfy 0 < beta_virtuous <= beta_rogue ({rogue})")]
    BadBeta { virtuous: u64, rogue: u64 },
    #[error("concurrent_repolls ({0}) must be positive")]
    ZeroRepolls(usize),
    #[error("batch_size ({0}) must be positive")]
    ZeroBatch(usize),
    #[error("parents ({0}) must be positive")]
    ZeroParents(usize),
}

/// Consensus protocol parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Validators sampled per query.
    pub k: usize,
    /// Vote threshold for a preference to count in one poll.
    pub alpha: usize,
    /// Consecutive successes to accept an unconflicted transaction.
    pub beta_virtuous: u64,
    /// Consecutive successes to accept a conflicted transaction.
    pub beta_rogue: u64,
    /// Simultaneously outstanding repolls.
    pub concurrent_repolls: usize,
    /// Maximum transactions per locally built vertex.
    pub batch_size: usize,
    /// Maximum parents per locally built vertex.
    pub parents: usize,
    /// Vertex LRU cache capacity.
    pub vertex_cache_size: usize,
    /// Pinned-transaction cache capacity hint.
    pub tx_cache_size: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            k: constants::DEFAULT_K,
            alpha: constants::DEFAULT_ALPHA,
            beta_virtuous: constants::DEFAULT_BETA_VIRTUOUS,
            beta_rogue: constants::DEFAULT_BETA_ROGUE,
            concurrent_repolls: constants::DEFAULT_CONCURRENT_REPOLLS,
            batch_size: constants::DEFAULT_BATCH_SIZE,
            parents: constants::DEFAULT_PARENTS,
            vertex_cache_size: constants::DEFAULT_VERTEX_CACHE_SIZE,
            tx_cache_size: constants::DEFAULT_TX_CACHE_SIZE,
        }
    }
}

impl Parameters {
    /// Check the parameter set is internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k == 0 {
            return Err(ConfigError::ZeroK);
        }
        if self.k > crate::bag::BitSet64::CAPACITY {
            return Err(ConfigError::KTooLarge(self.k));
        }
        if self.alpha <= self.k / 2 || self.alpha > self.k {
            return Err(ConfigError::BadAlpha {
                alpha: self.alpha,
                k: self.k,
            });
        }
        if self.beta_virtuous == 0 || self.beta_virtuous > self.beta_rogue {
            return Err(ConfigError::BadBeta {
                virtuous: self.beta_virtuous,
                rogue: self.beta_rogue,
            });
        }
        if self.concurrent_repolls == 0 {
            return Err(ConfigError::ZeroRepolls(self.concurrent_repolls));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatch(self.batch_size));
        }
        if self.parents == 0 {
            return Err(ConfigError::ZeroParents(self.parents));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FloeConfig {
    pub consensus: Parameters,
}

impl FloeConfig {
    /// Load configuration from `floe.toml` in the given directory.
    /// Returns defaults if the file doesn't exist or fails to parse.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("floe.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Parameters::default().validate().is_ok());
    }

    #[test]
    fn alpha_must_be_a_majority() {
        let params = Parameters {
            k: 20,
            alpha: 10,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::BadAlpha { .. })
        ));
    }

    #[test]
    fn alpha_cannot_exceed_k() {
        let params = Parameters {
            k: 10,
            alpha: 11,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn beta_ordering_enforced() {
        let params = Parameters {
            beta_virtuous: 30,
            beta_rogue: 20,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(ConfigError::BadBeta { .. })));
    }

    #[test]
    fn k_bounded_by_poll_width() {
        let params = Parameters {
            k: 65,
            alpha: 50,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(ConfigError::KTooLarge(65))));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[consensus]
k = 10
alpha = 8
beta_virtuous = 5
beta_rogue = 7
"#;
        let config: FloeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.consensus.k, 10);
        assert_eq!(config.consensus.alpha, 8);
        assert_eq!(config.consensus.beta_rogue, 7);
        // Unspecified fields keep their defaults.
        assert_eq!(config.consensus.batch_size, constants::DEFAULT_BATCH_SIZE);
        assert!(config.consensus.validate().is_ok());
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = FloeConfig::load(dir.path());
        assert_eq!(config.consensus.k, constants::DEFAULT_K);
    }
}
