//! Catalog of accelerator kernels
//!
//! Kernels are referenced by name only; dispatching them is the device
//! runtime's job. The catalog answers two questions for the replacer: which
//! optimized forward a module type binds to, and which accelerated operator
//! replaces a generic one.

use std::collections::BTreeMap;

/// Name tables for forward kernels and operator equivalents
#[derive(Debug, Clone, Default)]
pub struct KernelCatalog {
    forward: BTreeMap<String, String>,
    operators: BTreeMap<String, String>,
}

impl KernelCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Kernels shipped for XPU devices
    pub fn xpu() -> Self {
        let mut catalog = Self::empty();
        catalog
            .register_forward("LlamaRMSNorm", "xpu_rms_norm")
            .register_forward("Qwen2RMSNorm", "xpu_rms_norm")
            .register_forward("LayerNorm", "xpu_layer_norm")
            .register_forward("LlamaRotaryEmbedding", "xpu_rotary_embedding")
            .register_forward("Embedding", "xpu_embedding_lookup");
        catalog
            .register_operator("silu", "xpu_silu")
            .register_operator("gelu", "xpu_gelu")
            .register_operator("gelu_new", "xpu_gelu_tanh")
            .register_operator("softmax", "xpu_softmax")
            .register_operator("matmul", "xpu_matmul");
        catalog
    }

    pub fn register_forward(&mut self, module_type: impl Into<String>, kernel: impl Into<String>) -> &mut Self {
        self.forward.insert(module_type.into(), kernel.into());
        self
    }

    pub fn register_operator(&mut self, op: impl Into<String>, kernel: impl Into<String>) -> &mut Self {
        self.operators.insert(op.into(), kernel.into());
        self
    }

    pub fn forward_for(&self, module_type: &str) -> Option<&str> {
        self.forward.get(module_type).map(String::as_str)
    }

    pub fn operator_for(&self, op: &str) -> Option<&str> {
        self.operators.get(op).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xpu_catalog() {
        let catalog = KernelCatalog::xpu();
        assert_eq!(catalog.forward_for("LlamaRMSNorm"), Some("xpu_rms_norm"));
        assert_eq!(catalog.operator_for("silu"), Some("xpu_silu"));
        assert!(catalog.operator_for("xpu_silu").is_none());
        assert!(catalog.forward_for("Linear").is_none());
    }

    #[test]
    fn test_register_overrides() {
        let mut catalog = KernelCatalog::xpu();
        catalog.register_operator("silu", "xpu_silu_v2");
        assert_eq!(catalog.operator_for("silu"), Some("xpu_silu_v2"));
    }
}
