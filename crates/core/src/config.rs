//! Conversion configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::tensor::Device;

/// Preset transformer architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelArchitecture {
    /// Two-layer toy model (for development/testing)
    Tiny,
    /// Llama 3.1 8B
    Llama3_1_8B,
    /// Llama 3.1 70B
    Llama3_1_70B,
    /// Qwen 2.5 0.5B Instruct
    Qwen2_5_0_5B,
    /// Qwen 2.5 7B Instruct
    Qwen2_5_7B,
}

impl ModelArchitecture {
    /// Get the hidden dimension for this architecture
    pub fn hidden_dim(&self) -> usize {
        match self {
            Self::Tiny => 64,
            Self::Llama3_1_8B => 4096,
            Self::Llama3_1_70B => 8192,
            Self::Qwen2_5_0_5B => 896,
            Self::Qwen2_5_7B => 3584,
        }
    }

    /// Get the number of attention heads
    pub fn num_heads(&self) -> usize {
        match self {
            Self::Tiny => 4,
            Self::Llama3_1_8B => 32,
            Self::Llama3_1_70B => 64,
            Self::Qwen2_5_0_5B => 14,
            Self::Qwen2_5_7B => 28,
        }
    }

    /// Get the number of key-value heads (for GQA)
    pub fn num_kv_heads(&self) -> usize {
        match self {
            Self::Tiny => 2,
            Self::Llama3_1_8B | Self::Llama3_1_70B => 8,
            Self::Qwen2_5_0_5B => 2,
            Self::Qwen2_5_7B => 4,
        }
    }

    /// Get the number of layers
    pub fn num_layers(&self) -> usize {
        match self {
            Self::Tiny => 2,
            Self::Llama3_1_8B => 32,
            Self::Llama3_1_70B => 80,
            Self::Qwen2_5_0_5B => 24,
            Self::Qwen2_5_7B => 28,
        }
    }

    /// Get the vocabulary size
    pub fn vocab_size(&self) -> usize {
        match self {
            Self::Tiny => 256,
            Self::Qwen2_5_0_5B | Self::Qwen2_5_7B => 152064,
            _ => 128256,
        }
    }

    /// Get the intermediate (FFN) dimension
    pub fn intermediate_dim(&self) -> usize {
        match self {
            Self::Tiny => 128,
            Self::Llama3_1_8B => 14336,
            Self::Llama3_1_70B => 28672,
            Self::Qwen2_5_0_5B => 4864,
            Self::Qwen2_5_7B => 18944,
        }
    }

    /// Qwen projections carry QKV biases, Llama's don't
    pub fn has_qkv_bias(&self) -> bool {
        matches!(self, Self::Qwen2_5_0_5B | Self::Qwen2_5_7B)
    }

    /// Get model family name
    pub fn model_family(&self) -> &'static str {
        match self {
            Self::Qwen2_5_0_5B | Self::Qwen2_5_7B => "qwen2.5",
            _ => "llama3",
        }
    }

    /// Parse architecture from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Some(Self::Tiny),
            "llama-3.1-8b" | "llama3.1-8b" | "llama3_1_8b" => Some(Self::Llama3_1_8B),
            "llama-3.1-70b" | "llama3.1-70b" | "llama3_1_70b" => Some(Self::Llama3_1_70B),
            "qwen-2.5-0.5b" | "qwen2.5-0.5b" | "qwen2_5_0_5b" => Some(Self::Qwen2_5_0_5B),
            "qwen-2.5-7b" | "qwen2.5-7b" | "qwen2_5_7b" => Some(Self::Qwen2_5_7B),
            _ => None,
        }
    }
}

/// Converter construction options
///
/// Callables (custom partition and replacement functions) are not
/// serializable and are set on the converter builder instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Directory of safetensors files to overlay after slicing
    pub checkpoint: Option<PathBuf>,
    /// Generic module type targeted by the default replacement rule
    pub replaced_module_type: Option<String>,
    /// Specialized layer type installed by the default replacement rule
    pub replaced_layer_type: Option<String>,
    /// Multi-rank execution; rank and world size come from the environment
    pub distributed: bool,
    /// Accelerator the converted model is placed on
    pub device: Device,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            replaced_module_type: None,
            replaced_layer_type: None,
            distributed: false,
            device: Device::Xpu(None),
        }
    }
}

impl ConverterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SHARDCONV_CHECKPOINT") {
            config.checkpoint = Some(PathBuf::from(path));
        }
        if let Ok(module) = std::env::var("SHARDCONV_REPLACED_MODULE") {
            config.replaced_module_type = Some(module);
        }
        if let Ok(layer) = std::env::var("SHARDCONV_REPLACED_LAYER") {
            config.replaced_layer_type = Some(layer);
        }
        if let Ok(flag) = std::env::var("SHARDCONV_DISTRIBUTED") {
            config.distributed = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(device) = std::env::var("SHARDCONV_DEVICE") {
            if let Ok(d) = device.parse() {
                config.device = d;
            }
        }

        config
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.is_meta() {
            return Err(CoreError::InvalidConfig(
                "target device cannot be meta".into(),
            ));
        }
        if matches!(&self.replaced_layer_type, Some(t) if t.is_empty()) {
            return Err(CoreError::InvalidConfig("replaced_layer_type is empty".into()));
        }
        Ok(())
    }

    /// Device for the given rank (indexed when running distributed)
    pub fn target_device(&self, rank: Option<usize>) -> Device {
        match (self.device, rank) {
            (Device::Xpu(None), Some(rank)) => Device::Xpu(Some(rank)),
            (device, _) => device,
        }
    }
}

/// Rank and world size of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedEnv {
    pub rank: usize,
    pub world_size: usize,
}

impl DistributedEnv {
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Read `RANK` (or `LOCAL_RANK`) and `WORLD_SIZE`
    pub fn from_env() -> Result<Self> {
        let world_size = read_usize("WORLD_SIZE")?.ok_or_else(|| {
            CoreError::InvalidConfig("WORLD_SIZE is not set for a distributed run".into())
        })?;
        let rank = match read_usize("RANK")? {
            Some(rank) => rank,
            None => read_usize("LOCAL_RANK")?.unwrap_or(0),
        };
        if world_size == 0 || rank >= world_size {
            return Err(CoreError::InvalidConfig(format!(
                "rank {} invalid for world size {}",
                rank, world_size
            )));
        }
        Ok(Self { rank, world_size })
    }
}

fn read_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CoreError::InvalidConfig(format!("{}={} is not a number", key, value))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_params() {
        let arch = ModelArchitecture::Qwen2_5_7B;
        assert_eq!(arch.hidden_dim(), 3584);
        assert_eq!(arch.num_heads(), 28);
        assert_eq!(arch.num_kv_heads(), 4);
        assert!(arch.has_qkv_bias());

        let arch = ModelArchitecture::from_str("LLAMA-3.1-70B").unwrap();
        assert_eq!(arch, ModelArchitecture::Llama3_1_70B);
        assert_eq!(arch.intermediate_dim(), 28672);
        assert_eq!(arch.model_family(), "llama3");
        assert!(ModelArchitecture::from_str("gpt2").is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ConverterConfig {
            checkpoint: Some(PathBuf::from("/weights")),
            replaced_layer_type: Some("XpuDecoderLayer".into()),
            distributed: true,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("device = \"xpu\""));
        let parsed: ConverterConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardconv.toml");
        let config = ConverterConfig {
            replaced_module_type: Some("Qwen2DecoderLayer".into()),
            device: Device::Xpu(Some(1)),
            ..Default::default()
        };
        config.to_file(&path).unwrap();
        assert_eq!(ConverterConfig::from_file(&path).unwrap(), config);

        std::fs::write(&path, "distributed = \"maybe\"").unwrap();
        assert!(matches!(
            ConverterConfig::from_file(&path),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: ConverterConfig = toml::from_str("distributed = true\n").unwrap();
        assert!(parsed.distributed);
        assert_eq!(parsed.device, Device::Xpu(None));
        assert!(parsed.checkpoint.is_none());
    }

    #[test]
    fn test_target_device() {
        let config = ConverterConfig::default();
        assert_eq!(config.target_device(None), Device::Xpu(None));
        assert_eq!(config.target_device(Some(3)), Device::Xpu(Some(3)));

        let pinned = ConverterConfig {
            device: Device::Cpu,
            ..Default::default()
        };
        assert_eq!(pinned.target_device(Some(1)), Device::Cpu);
    }

    #[test]
    fn test_validate_rejects_meta_target() {
        let config = ConverterConfig {
            device: Device::Meta,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
