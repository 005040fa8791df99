//! Third-party inference engines and the host model library
//!
//! A model handed to the converter may already be wrapped by an inference
//! engine. The engine describes itself through [`TopologyProvider`]; the
//! converter then either refuses (kernel injection owns the layers), defers
//! to the engine's own tensor parallelism, or adopts its topology.

use shardconv_core::{CommGroup, CoreError, ParallelTopology};

use crate::error::Result;
use crate::replacer::ReplacementRule;

/// Capabilities of a wrapping inference engine
pub trait TopologyProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Tensor-parallel degree the engine runs with
    fn tp_size(&self) -> usize;

    /// The engine's tensor-parallel group, if it formed one
    fn tp_group(&self) -> Option<CommGroup>;

    /// Whether the engine injects its own fused kernels
    fn kernel_injection_active(&self) -> bool;

    /// Extra replacement rules for the engine's module types
    fn replacement_rules(&self) -> Vec<ReplacementRule> {
        Vec::new()
    }
}

/// Settings of a DeepSpeed-style inference engine
#[derive(Debug, Clone, Default)]
pub struct InferenceEngineConfig {
    pub replace_with_kernel_inject: bool,
    pub tp_size: usize,
    pub tp_group: Option<CommGroup>,
    pub rules: Vec<ReplacementRule>,
}

impl TopologyProvider for InferenceEngineConfig {
    fn name(&self) -> &str {
        "InferenceEngine"
    }

    fn tp_size(&self) -> usize {
        self.tp_size.max(1)
    }

    fn tp_group(&self) -> Option<CommGroup> {
        self.tp_group.clone()
    }

    fn kernel_injection_active(&self) -> bool {
        self.replace_with_kernel_inject
    }

    fn replacement_rules(&self) -> Vec<ReplacementRule> {
        self.rules.clone()
    }
}

/// How the converter treats a wrapped model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteropMode {
    /// No engine; the converter owns slicing and loading
    Native,
    /// The engine's tensor parallelism already sharded the model
    AutoTp(ParallelTopology),
    /// An engine without its own tensor parallelism; the converter's
    /// topology drives the full pipeline
    Adopted,
}

impl InteropMode {
    pub fn skips_slicing(&self) -> bool {
        matches!(self, InteropMode::AutoTp(_))
    }
}

/// Classify a wrapping engine as seen from `rank`
///
/// Kernel injection cannot be combined with module replacement and is
/// rejected before anything is touched.
pub fn detect(provider: Option<&dyn TopologyProvider>, rank: usize) -> Result<InteropMode> {
    let Some(provider) = provider else {
        return Ok(InteropMode::Native);
    };

    if provider.kernel_injection_active() {
        return Err(CoreError::UnsupportedInterop(format!(
            "{} has kernel injection enabled; disable replace_with_kernel_inject",
            provider.name()
        ))
        .into());
    }

    let tp_size = provider.tp_size();
    tracing::info!(engine = provider.name(), tp_size, auto_tp = tp_size > 1, "Detected inference engine");
    if tp_size > 1 {
        let topology = ParallelTopology::new(tp_size, rank, provider.tp_group())?;
        Ok(InteropMode::AutoTp(topology))
    } else {
        // rejects a group without parallelism
        ParallelTopology::new(tp_size, 0, provider.tp_group())?;
        Ok(InteropMode::Adopted)
    }
}

/// Probe for the host model-definition library
pub trait HostLibrary: Send + Sync {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
}

/// Host library whose availability is fixed at construction
#[derive(Debug, Clone)]
pub struct StaticHost {
    name: String,
    available: bool,
}

impl StaticHost {
    pub fn available(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: true,
        }
    }

    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: false,
        }
    }
}

impl Default for StaticHost {
    fn default() -> Self {
        Self::available("transformers")
    }
}

impl HostLibrary for StaticHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

/// Fail with `MissingDependency` when the host library is absent
pub fn require_host(host: &dyn HostLibrary) -> Result<()> {
    if host.is_available() {
        Ok(())
    } else {
        Err(CoreError::MissingDependency(host.name().to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_engine_is_native() {
        assert_eq!(detect(None, 3).unwrap(), InteropMode::Native);
    }

    #[test]
    fn test_kernel_injection_rejected() {
        let engine = InferenceEngineConfig {
            replace_with_kernel_inject: true,
            tp_size: 2,
            ..Default::default()
        };
        let err = detect(Some(&engine), 0).unwrap_err();
        assert!(matches!(err.core(), Some(CoreError::UnsupportedInterop(_))));
    }

    #[test]
    fn test_engine_tp_is_auto_tp() {
        let engine = InferenceEngineConfig {
            tp_size: 2,
            tp_group: Some(CommGroup::new(9, vec![0, 1])),
            ..Default::default()
        };
        let mode = detect(Some(&engine), 1).unwrap();
        assert!(mode.skips_slicing());
        match mode {
            InteropMode::AutoTp(topo) => {
                assert_eq!(topo.rank(), 1);
                assert_eq!(topo.tp_group().map(CommGroup::id), Some(9));
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_single_rank_engine_adopted() {
        let engine = InferenceEngineConfig::default();
        let mode = detect(Some(&engine), 0).unwrap();
        assert_eq!(mode, InteropMode::Adopted);
    }

    #[test]
    fn test_engine_tp_without_group_is_invalid() {
        let engine = InferenceEngineConfig {
            tp_size: 4,
            ..Default::default()
        };
        assert!(detect(Some(&engine), 0).is_err());
    }

    #[test]
    fn test_missing_host() {
        let err = require_host(&StaticHost::missing("transformers")).unwrap_err();
        assert!(err.core().map_or(false, CoreError::is_recoverable));
        assert!(require_host(&StaticHost::default()).is_ok());
    }
}
