use serde::Deserialize;
use thiserror::Error;

use crate::TokenId;

/// Block sizes the paged attention kernels accept.
pub const SUPPORTED_BLOCK_SIZES: &[usize] = &[16, 32, 64];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_num_batched_tokens must be positive")]
    ZeroTokenBudget,

    #[error("max_num_seqs must be positive")]
    ZeroSeqBudget,

    #[error("cache_size_blocks must be positive")]
    ZeroCacheSize,

    #[error("unsupported block_size {0}, expected one of 16/32/64")]
    BadBlockSize(usize),
}

/// Engine-wide configuration. Fixed for the engine's lifetime; there is no
/// reconfiguration while requests are in flight.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on logits rows per iteration (scheduled tokens summed
    /// over running siblings).
    pub max_num_batched_tokens: usize,
    /// Upper bound on concurrently running siblings.
    pub max_num_seqs: usize,
    /// Tokens per KV block.
    pub block_size: usize,
    /// Total physical blocks in the pool.
    pub cache_size_blocks: usize,
    /// Allow partial prefills so long prompts share iterations with decode.
    #[serde(default)]
    pub dynamic_split_fuse: bool,
    /// Per-iteration cap on preemptions; exceeding it yields a partial plan.
    #[serde(default = "default_max_num_preemptions")]
    pub max_num_preemptions: usize,
    /// The model's end-of-sequence token. Overridden by an attached
    /// tokenizer's `eos_token_id()`.
    #[serde(default)]
    pub eos_token_id: TokenId,
}

fn default_max_num_preemptions() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 2048,
            max_num_seqs: 256,
            block_size: 16,
            cache_size_blocks: 512,
            dynamic_split_fuse: false,
            max_num_preemptions: default_max_num_preemptions(),
            eos_token_id: 0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_num_batched_tokens == 0 {
            return Err(ConfigError::ZeroTokenBudget);
        }
        if self.max_num_seqs == 0 {
            return Err(ConfigError::ZeroSeqBudget);
        }
        if self.cache_size_blocks == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        if !SUPPORTED_BLOCK_SIZES.contains(&self.block_size) {
            return Err(ConfigError::BadBlockSize(self.block_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_budgets() {
        let mut config = EngineConfig::default();
        config.max_num_batched_tokens = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTokenBudget));

        let mut config = EngineConfig::default();
        config.max_num_seqs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroSeqBudget));

        let mut config = EngineConfig::default();
        config.cache_size_blocks = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroCacheSize));
    }

    #[test]
    fn rejects_odd_block_size() {
        let mut config = EngineConfig::default();
        config.block_size = 24;
        assert_eq!(config.validate(), Err(ConfigError::BadBlockSize(24)));
        for &size in SUPPORTED_BLOCK_SIZES {
            config.block_size = size;
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "max_num_batched_tokens": 256,
                "max_num_seqs": 8,
                "block_size": 32,
                "cache_size_blocks": 64
            }"#,
        )
        .unwrap();
        assert!(!config.dynamic_split_fuse);
        assert_eq!(config.max_num_preemptions, 8);
        assert_eq!(config.block_size, 32);
        assert!(config.validate().is_ok());
    }
}
