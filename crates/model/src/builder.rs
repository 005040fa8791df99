//! Decoder-only transformer skeletons
//!
//! Builds the module tree a host library would hand to the converter, with
//! Llama-style names (`model.layers.N.self_attn.q_proj.weight`, ...). Every
//! tensor goes through the supplied [`TensorFactory`], so building inside a
//! meta [`OnDevice`](shardconv_core::OnDevice) scope allocates nothing.

use shardconv_core::{parameter, DType, Module, ModuleId, ModuleTree, TensorFactory, TransformerConfig};

use crate::error::Result;

/// Initial values of built tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightInit {
    Zeros,
    /// Deterministic non-constant values, distinct per tensor
    Pattern { seed: u32 },
}

/// Builds a transformer module tree from a config
pub struct TransformerBuilder {
    config: TransformerConfig,
    init: WeightInit,
    tensors_built: std::cell::Cell<u32>,
}

impl TransformerBuilder {
    pub fn new(config: TransformerConfig) -> Self {
        Self {
            config,
            init: WeightInit::Pattern { seed: 0 },
            tensors_built: std::cell::Cell::new(0),
        }
    }

    pub fn with_init(mut self, init: WeightInit) -> Self {
        self.init = init;
        self
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn build(&self, factory: &TensorFactory) -> Result<ModuleTree> {
        let c = &self.config;
        self.tensors_built.set(0);

        let mut tree = ModuleTree::new(Module::new("LlamaForCausalLM"));
        let root = tree.root();
        let model = tree.add_child(root, "model", Module::new("LlamaModel"))?;

        let embed = Module::new("Embedding").with_param(
            "weight",
            parameter(self.tensor(factory, &[c.vocab_size, c.hidden_dim])?),
        );
        tree.add_child(model, "embed_tokens", embed)?;

        let layers = tree.add_child(model, "layers", Module::new("ModuleList"))?;
        for idx in 0..c.num_layers {
            self.build_layer(&mut tree, factory, layers, idx)?;
        }

        tree.add_child(model, "norm", self.norm(factory)?)?;
        tree.add_child(root, "lm_head", self.linear(factory, c.vocab_size, c.hidden_dim, false)?)?;

        tracing::debug!(
            layers = c.num_layers,
            tensors = self.tensors_built.get(),
            "Built transformer skeleton"
        );
        Ok(tree)
    }

    fn build_layer(
        &self,
        tree: &mut ModuleTree,
        factory: &TensorFactory,
        layers: ModuleId,
        idx: usize,
    ) -> Result<()> {
        let c = &self.config;
        let q_dim = c.num_heads * c.head_dim;
        let kv_dim = c.num_kv_heads * c.head_dim;

        let layer = tree.add_child(layers, idx.to_string(), Module::new("LlamaDecoderLayer"))?;

        let attn = Module::new("LlamaAttention")
            .with_attr("num_heads", c.num_heads as i64)
            .with_attr("num_kv_heads", c.num_kv_heads as i64)
            .with_attr("head_dim", c.head_dim as i64)
            .with_operator("attn_softmax", "softmax")
            .with_operator("attn_matmul", "matmul");
        let attn = tree.add_child(layer, "self_attn", attn)?;
        tree.add_child(attn, "q_proj", self.linear(factory, q_dim, c.hidden_dim, c.qkv_bias)?)?;
        tree.add_child(attn, "k_proj", self.linear(factory, kv_dim, c.hidden_dim, c.qkv_bias)?)?;
        tree.add_child(attn, "v_proj", self.linear(factory, kv_dim, c.hidden_dim, c.qkv_bias)?)?;
        tree.add_child(attn, "o_proj", self.linear(factory, c.hidden_dim, q_dim, false)?)?;
        tree.add_child(attn, "rotary_emb", Module::new("LlamaRotaryEmbedding"))?;

        let mlp = Module::new("LlamaMLP")
            .with_attr("intermediate_size", c.intermediate_dim as i64)
            .with_operator("act_fn", "silu");
        let mlp = tree.add_child(layer, "mlp", mlp)?;
        tree.add_child(mlp, "gate_proj", self.linear(factory, c.intermediate_dim, c.hidden_dim, false)?)?;
        tree.add_child(mlp, "up_proj", self.linear(factory, c.intermediate_dim, c.hidden_dim, false)?)?;
        tree.add_child(mlp, "down_proj", self.linear(factory, c.hidden_dim, c.intermediate_dim, false)?)?;

        tree.add_child(layer, "input_layernorm", self.norm(factory)?)?;
        tree.add_child(layer, "post_attention_layernorm", self.norm(factory)?)?;
        Ok(())
    }

    fn linear(&self, factory: &TensorFactory, out: usize, inp: usize, bias: bool) -> Result<Module> {
        let mut module = Module::new("Linear").with_param("weight", parameter(self.tensor(factory, &[out, inp])?));
        if bias {
            module.insert_param("bias", parameter(self.tensor(factory, &[out])?));
        }
        Ok(module)
    }

    fn norm(&self, factory: &TensorFactory) -> Result<Module> {
        let weight = factory.ones(&[self.config.hidden_dim], DType::F32, None);
        Ok(Module::new("LlamaRMSNorm").with_param("weight", parameter(weight)))
    }

    fn tensor(&self, factory: &TensorFactory, shape: &[usize]) -> Result<shardconv_core::Tensor> {
        let index = self.tensors_built.get();
        self.tensors_built.set(index + 1);

        let building_meta = factory.active().map_or(false, |s| s.device.is_meta());
        match self.init {
            WeightInit::Pattern { seed } if !building_meta => {
                let numel: usize = shape.iter().product();
                let values = (0..numel).map(|i| pattern_value(seed, index, i)).collect();
                Ok(factory.from_values(shape, values, DType::F32, None)?)
            }
            _ => Ok(factory.zeros(shape, DType::F32, None)),
        }
    }
}

/// Value in [-0.5, 0.5) on a 1/64 grid, exact in every float dtype
fn pattern_value(seed: u32, tensor: u32, i: usize) -> f32 {
    let h = (i as u64)
        .wrapping_mul(31)
        .wrapping_add(seed as u64 * 7)
        .wrapping_add(tensor as u64 * 13);
    (h % 64) as f32 / 64.0 - 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardconv_core::{Device, ModelArchitecture, OnDevice};

    #[test]
    fn test_tiny_skeleton_names() {
        let config = TransformerConfig::from_architecture(ModelArchitecture::Tiny);
        let tree = TransformerBuilder::new(config).build(&TensorFactory::new()).unwrap();

        let q = tree.parameter("model.layers.1.self_attn.q_proj.weight").unwrap();
        assert_eq!(q.read().shape(), &[64, 64]);
        let k = tree.parameter("model.layers.0.self_attn.k_proj.weight").unwrap();
        assert_eq!(k.read().shape(), &[32, 64]);
        assert!(tree.parameter("model.layers.0.self_attn.q_proj.bias").is_none());
        assert!(tree.parameter("lm_head.weight").is_some());
        assert!(tree.parameter("model.norm.weight").is_some());
    }

    #[test]
    fn test_meta_build_allocates_nothing() {
        let config = TransformerConfig::from_architecture(ModelArchitecture::Tiny);
        let factory = TensorFactory::new();
        let tree = {
            let _scope = factory.on_device(OnDevice::new(Device::Meta, DType::BF16));
            TransformerBuilder::new(config).build(&factory).unwrap()
        };
        for (name, param) in tree.named_parameters().unwrap() {
            let t = param.read();
            assert!(t.is_meta(), "{} should be meta", name);
            assert_eq!(t.dtype(), DType::BF16);
        }
    }

    #[test]
    fn test_qkv_bias_for_qwen_like_config() {
        let mut config = TransformerConfig::from_architecture(ModelArchitecture::Tiny);
        config.qkv_bias = true;
        let tree = TransformerBuilder::new(config).build(&TensorFactory::new()).unwrap();
        let bias = tree.parameter("model.layers.0.self_attn.v_proj.bias").unwrap();
        assert_eq!(bias.read().shape(), &[32]);
    }

    #[test]
    fn test_pattern_is_exact_in_half() {
        for i in 0..256 {
            let v = pattern_value(3, 5, i);
            assert_eq!(DType::F16.round(v), v);
            assert_eq!(DType::BF16.round(v), v);
        }
    }
}
