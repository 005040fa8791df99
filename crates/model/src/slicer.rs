//! Tensor-parallel slicing of a live module tree
//!
//! Each module type may register a [`SliceSpec`]; its rules name tensors
//! relative to the module (`q_proj.weight`) and the axis to split. The
//! resulting per-parameter rules form the [`SlicePolicy`] that both the
//! slicer and the weight loader consult, so a checkpoint tensor is always
//! cut exactly like the model tensor it lands in.
//!
//! ## Default layout
//! - Attention: Q/K/V split on the output axis (0), O on the input axis (1)
//! - MLP: gate/up split on axis 0, down on axis 1
//! - Embeddings, norms and the LM head are replicated
//!
//! Slicing is two-phase: every shard is computed and validated before the
//! first tensor changes, so an indivisible axis leaves the model untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use shardconv_core::parallel::{shard_shape, slice_tensor, SliceLayout};
use shardconv_core::{CoreError, ModuleTree, ParallelTopology, Parameter, ShardMark, SliceRule, SliceSpec};

use crate::error::Result;

/// Custom partition function: slice rules for a module type
pub type PartitionFn = Arc<dyn Fn(&str) -> Option<SliceSpec> + Send + Sync>;

/// Which tensors are split, along which axis
pub struct SlicePolicy {
    specs: BTreeMap<String, SliceSpec>,
    partition_fn: Option<PartitionFn>,
}

impl Default for SlicePolicy {
    fn default() -> Self {
        let mut policy = Self::empty();
        for module_type in ["LlamaAttention", "Qwen2Attention"] {
            policy.register(SliceSpec::new(
                module_type,
                vec![
                    SliceRule::split("q_proj.weight", 0),
                    SliceRule::split("k_proj.weight", 0),
                    SliceRule::split("v_proj.weight", 0),
                    SliceRule::split("q_proj.bias", 0).optional(),
                    SliceRule::split("k_proj.bias", 0).optional(),
                    SliceRule::split("v_proj.bias", 0).optional(),
                    SliceRule::split("o_proj.weight", 1),
                    SliceRule::replicate("o_proj.bias").optional(),
                ],
            ));
        }
        for module_type in ["LlamaMLP", "Qwen2MLP"] {
            policy.register(SliceSpec::new(
                module_type,
                vec![
                    SliceRule::split("gate_proj.weight", 0),
                    SliceRule::split("up_proj.weight", 0),
                    SliceRule::split("down_proj.weight", 1),
                ],
            ));
        }
        policy
    }
}

impl SlicePolicy {
    pub fn empty() -> Self {
        Self {
            specs: BTreeMap::new(),
            partition_fn: None,
        }
    }

    pub fn register(&mut self, spec: SliceSpec) -> &mut Self {
        self.specs.insert(spec.module_type.clone(), spec);
        self
    }

    /// Consult `f` before the registered specs
    pub fn with_partition_fn(mut self, f: PartitionFn) -> Self {
        self.partition_fn = Some(f);
        self
    }

    pub fn spec_for(&self, module_type: &str) -> Option<SliceSpec> {
        self.partition_fn
            .as_ref()
            .and_then(|f| f(module_type))
            .or_else(|| self.specs.get(module_type).cloned())
    }

    /// Resolve rules to fully qualified parameter names
    ///
    /// Fails when a required rule matches nothing or when two rules claim the
    /// same parameter.
    pub fn parameter_rules(&self, model: &ModuleTree) -> Result<BTreeMap<String, SliceRule>> {
        let params: HashMap<String, Parameter> = model.named_parameters()?.into_iter().collect();
        let mut out = BTreeMap::new();

        for id in model.walk() {
            let module = model.get(id)?;
            let Some(spec) = self.spec_for(&module.kind) else {
                continue;
            };
            let prefix = model.path(id)?;
            for rule in spec.rules {
                let name = if prefix.is_empty() {
                    rule.param.clone()
                } else {
                    format!("{}.{}", prefix, rule.param)
                };
                if !params.contains_key(&name) {
                    if rule.optional {
                        continue;
                    }
                    return Err(CoreError::InvalidConfig(format!(
                        "slice rule for {} ({}) matches no parameter",
                        name, module.kind
                    ))
                    .into());
                }
                if out.contains_key(&name) {
                    return Err(CoreError::InvalidConfig(format!(
                        "parameter {} is covered by two slice rules",
                        name
                    ))
                    .into());
                }
                out.insert(name, rule);
            }
        }
        Ok(out)
    }
}

/// One parameter's place in the sharding plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedShard {
    pub name: String,
    pub full_shape: Vec<usize>,
    pub local_shape: Vec<usize>,
    pub axis: Option<usize>,
    pub local_bytes: usize,
}

/// Local shapes and memory of one rank after slicing
#[derive(Debug, Clone)]
pub struct ShardingPlan {
    pub tp_size: usize,
    pub rank: usize,
    pub entries: Vec<PlannedShard>,
}

impl ShardingPlan {
    pub fn local_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.local_bytes).sum()
    }

    pub fn num_sharded(&self) -> usize {
        self.entries.iter().filter(|e| e.axis.is_some()).count()
    }

    /// Get memory requirement of this rank in MB
    pub fn local_mb(&self) -> f64 {
        self.local_bytes() as f64 / (1024.0 * 1024.0)
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        let mut out = format!(
            "rank {}/{}: {} tensors ({} sharded), {:.2} MB\n",
            self.rank,
            self.tp_size,
            self.entries.len(),
            self.num_sharded(),
            self.local_mb()
        );
        for e in self.entries.iter().filter(|e| e.axis.is_some()) {
            out.push_str(&format!(
                "  {:<48} {:?} -> {:?} (axis {})\n",
                e.name,
                e.full_shape,
                e.local_shape,
                e.axis.unwrap_or_default()
            ));
        }
        out
    }
}

/// Rewrites parallel-sensitive tensors to this rank's shard
pub struct TensorSlicer {
    policy: Arc<SlicePolicy>,
}

struct StagedShard {
    name: String,
    param: Parameter,
    shape: Vec<usize>,
    values: Option<Vec<f32>>,
    mark: ShardMark,
}

impl TensorSlicer {
    pub fn new(policy: Arc<SlicePolicy>) -> Self {
        Self { policy }
    }

    /// Compute local shapes without touching the model
    pub fn plan(&self, model: &ModuleTree, topology: &ParallelTopology) -> Result<ShardingPlan> {
        let rules = self.policy.parameter_rules(model)?;
        let mut entries = Vec::new();

        for (name, param) in model.named_parameters()? {
            let tensor = param.read();
            let full_shape = tensor
                .shard()
                .map(|m| m.full_shape.clone())
                .unwrap_or_else(|| tensor.shape().to_vec());
            let axis = rules.get(&name).and_then(|r| r.axis);
            let local_shape = match (axis, rules.get(&name)) {
                (Some(axis), Some(rule)) if topology.is_parallel() => {
                    shard_shape(&name, &full_shape, axis, rule.layout, topology.tp_size())?
                }
                _ => full_shape.clone(),
            };
            let local_bytes = local_shape.iter().product::<usize>() * tensor.dtype().size_bytes();
            entries.push(PlannedShard {
                name,
                full_shape,
                local_shape,
                axis,
                local_bytes,
            });
        }

        Ok(ShardingPlan {
            tp_size: topology.tp_size(),
            rank: topology.rank(),
            entries,
        })
    }

    /// Slice every ruled tensor in place to this rank's shard
    pub fn slice_model<'m>(
        &self,
        model: &'m mut ModuleTree,
        topology: &ParallelTopology,
    ) -> Result<&'m mut ModuleTree> {
        if !topology.is_parallel() {
            return Ok(model);
        }

        let rules = self.policy.parameter_rules(model)?;
        let params: HashMap<String, Parameter> = model.named_parameters()?.into_iter().collect();

        let mut staged = Vec::new();
        for (name, rule) in &rules {
            let Some(axis) = rule.axis else { continue };
            let Some(param) = params.get(name) else { continue };
            staged.push(self.stage(name, param, axis, rule.layout, topology)?);
        }

        for shard in &staged {
            shard
                .param
                .write()
                .install_shard(shard.shape.clone(), shard.values.clone(), shard.mark.clone());
            tracing::trace!(name = %shard.name, shape = ?shard.shape, "Sliced");
        }

        tracing::info!(
            rank = topology.rank(),
            tp_size = topology.tp_size(),
            tensors = staged.len(),
            "Sliced model for tensor parallelism"
        );
        Ok(model)
    }

    fn stage(
        &self,
        name: &str,
        param: &Parameter,
        axis: usize,
        layout: SliceLayout,
        topology: &ParallelTopology,
    ) -> Result<StagedShard> {
        let tensor = param.read();
        if let Some(mark) = tensor.shard() {
            return Err(CoreError::AlreadySliced {
                name: name.to_string(),
                rank: mark.rank,
                tp_size: mark.tp_size,
            }
            .into());
        }

        let full_shape = tensor.shape().to_vec();
        let (shape, values) = match tensor.data() {
            Some(data) => {
                let (shape, values) = slice_tensor(
                    name,
                    data,
                    &full_shape,
                    axis,
                    layout,
                    topology.rank(),
                    topology.tp_size(),
                )?;
                (shape, Some(values))
            }
            None => (
                shard_shape(name, &full_shape, axis, layout, topology.tp_size())?,
                None,
            ),
        };

        Ok(StagedShard {
            name: name.to_string(),
            param: param.clone(),
            shape,
            values,
            mark: ShardMark {
                axis,
                layout,
                rank: topology.rank(),
                tp_size: topology.tp_size(),
                full_shape,
            },
        })
    }
}
