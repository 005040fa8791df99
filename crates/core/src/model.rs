//! Transformer hyper-parameters

use serde::{Deserialize, Serialize};

use crate::config::ModelArchitecture;
use crate::error::{CoreError, Result};

/// Decoder-only transformer parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Hidden dimension
    pub hidden_dim: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Number of key-value heads (GQA)
    pub num_kv_heads: usize,
    /// Number of transformer layers
    pub num_layers: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Intermediate (FFN) dimension
    pub intermediate_dim: usize,
    /// Head dimension
    pub head_dim: usize,
    /// Q/K/V projections carry biases
    pub qkv_bias: bool,
}

impl TransformerConfig {
    /// Create config from architecture
    pub fn from_architecture(arch: ModelArchitecture) -> Self {
        let hidden_dim = arch.hidden_dim();
        let num_heads = arch.num_heads();

        Self {
            hidden_dim,
            num_heads,
            num_kv_heads: arch.num_kv_heads(),
            num_layers: arch.num_layers(),
            vocab_size: arch.vocab_size(),
            intermediate_dim: arch.intermediate_dim(),
            head_dim: hidden_dim / num_heads,
            qkv_bias: arch.has_qkv_bias(),
        }
    }

    /// Check that heads and FFN width split evenly over `tp_size` ranks
    pub fn validate_for(&self, tp_size: usize) -> Result<()> {
        for (what, value) in [
            ("Number of heads", self.num_heads),
            ("Number of KV heads", self.num_kv_heads),
            ("Intermediate dim", self.intermediate_dim),
        ] {
            if value % tp_size != 0 {
                return Err(CoreError::InvalidConfig(format!(
                    "{} ({}) must be divisible by tp_size ({})",
                    what, value, tp_size
                )));
            }
        }
        Ok(())
    }

    /// Parameter count of the full (unsharded) model
    pub fn num_parameters(&self) -> usize {
        let q = self.num_heads * self.head_dim * self.hidden_dim;
        let kv = 2 * self.num_kv_heads * self.head_dim * self.hidden_dim;
        let o = self.hidden_dim * self.num_heads * self.head_dim;
        let mlp = 3 * self.hidden_dim * self.intermediate_dim;
        let norms = 2 * self.hidden_dim;
        let bias = if self.qkv_bias {
            (self.num_heads + 2 * self.num_kv_heads) * self.head_dim
        } else {
            0
        };
        let per_layer = q + kv + o + mlp + norms + bias;
        2 * self.vocab_size * self.hidden_dim + self.num_layers * per_layer + self.hidden_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_arch() {
        let config = TransformerConfig::from_architecture(ModelArchitecture::Tiny);
        assert_eq!(config.head_dim, 16);
        assert!(!config.qkv_bias);
        assert!(config.validate_for(2).is_ok());
        assert!(config.validate_for(3).is_err());
    }

    #[test]
    fn test_qwen_head_split() {
        // 14 heads cannot be split across 4 ranks
        let config = TransformerConfig::from_architecture(ModelArchitecture::Qwen2_5_0_5B);
        assert!(config.validate_for(2).is_ok());
        assert!(config.validate_for(4).is_err());
    }
}
