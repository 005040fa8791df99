//! Tensor parallelism primitives
//!
//! The single partition policy shared by the slicer and the weight loader.
//! A weight is either replicated on every rank or split along one axis into
//! `tp_size` equal chunks, of which rank `r` keeps chunk `r`.
//!
//! ## Layouts
//! - `Contiguous`: the axis is cut into `tp_size` consecutive ranges.
//!   Linear `[out, in]` weights split on axis 0 are column parallel
//!   (q/k/v, gate/up), split on axis 1 they are row parallel (o, down).
//! - `Strided { blocks }`: the axis holds `blocks` fused sub-tensors (for
//!   example a packed QKV projection); each block is cut into `tp_size`
//!   ranges and rank `r` keeps range `r` of every block.

use serde::{Deserialize, Serialize};

use crate::comm::CommGroup;
use crate::error::{CoreError, Result};
use crate::tensor::shape;

/// Chunk layout along the partition axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceLayout {
    Contiguous,
    Strided { blocks: usize },
}

impl Default for SliceLayout {
    fn default() -> Self {
        SliceLayout::Contiguous
    }
}

/// How one named tensor of a module is partitioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRule {
    /// Parameter path relative to the module, e.g. `q_proj.weight`
    pub param: String,
    /// Partition axis, `None` for replicated tensors
    pub axis: Option<usize>,
    pub layout: SliceLayout,
    /// The checkpoint may omit this tensor
    pub optional: bool,
}

impl SliceRule {
    pub fn split(param: impl Into<String>, axis: usize) -> Self {
        Self {
            param: param.into(),
            axis: Some(axis),
            layout: SliceLayout::Contiguous,
            optional: false,
        }
    }

    pub fn strided(param: impl Into<String>, axis: usize, blocks: usize) -> Self {
        Self {
            param: param.into(),
            axis: Some(axis),
            layout: SliceLayout::Strided { blocks },
            optional: false,
        }
    }

    pub fn replicate(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            axis: None,
            layout: SliceLayout::Contiguous,
            optional: false,
        }
    }

    /// Mark the tensor as optional in checkpoints
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Slice rules registered for one module type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceSpec {
    pub module_type: String,
    pub rules: Vec<SliceRule>,
}

impl SliceSpec {
    pub fn new(module_type: impl Into<String>, rules: Vec<SliceRule>) -> Self {
        Self {
            module_type: module_type.into(),
            rules,
        }
    }

    /// Find the rule for a relative parameter path
    pub fn rule(&self, param: &str) -> Option<&SliceRule> {
        self.rules.iter().find(|r| r.param == param)
    }
}

/// Rank/group topology for tensor parallelism
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelTopology {
    tp_size: usize,
    tp_group: Option<CommGroup>,
    rank: usize,
}

impl ParallelTopology {
    /// Pure single-device topology
    pub fn single() -> Self {
        Self {
            tp_size: 1,
            tp_group: None,
            rank: 0,
        }
    }

    /// Build a topology, enforcing `tp_group.is_some() == (tp_size > 1)`
    pub fn new(tp_size: usize, rank: usize, tp_group: Option<CommGroup>) -> Result<Self> {
        if tp_size == 0 {
            return Err(CoreError::InvalidConfig("tp_size must be at least 1".into()));
        }
        if rank >= tp_size {
            return Err(CoreError::InvalidConfig(format!(
                "rank {} out of range for tp_size {}",
                rank, tp_size
            )));
        }
        if tp_group.is_some() != (tp_size > 1) {
            return Err(CoreError::InvalidConfig(format!(
                "tp_size {} requires {} communication group",
                tp_size,
                if tp_size > 1 { "a" } else { "no" }
            )));
        }
        Ok(Self {
            tp_size,
            tp_group,
            rank,
        })
    }

    pub fn tp_size(&self) -> usize {
        self.tp_size
    }

    pub fn tp_group(&self) -> Option<&CommGroup> {
        self.tp_group.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_parallel(&self) -> bool {
        self.tp_size > 1
    }
}

/// Calculate `[start, end)` of a shard along an axis of length `dim_size`
pub fn calculate_shard_indices(
    dim_size: usize,
    shard_id: usize,
    num_shards: usize,
) -> (usize, usize) {
    let shard_size = dim_size / num_shards;
    let start = shard_id * shard_size;
    (start, start + shard_size)
}

/// Validate a partition and return the local shard shape
pub fn shard_shape(
    name: &str,
    full_shape: &[usize],
    axis: usize,
    layout: SliceLayout,
    num_shards: usize,
) -> Result<Vec<usize>> {
    let dim = *full_shape.get(axis).ok_or_else(|| {
        CoreError::shape(
            name,
            format!("axis {} out of range for shape {:?}", axis, full_shape),
        )
    })?;
    let divisor = match layout {
        SliceLayout::Contiguous => num_shards,
        SliceLayout::Strided { blocks } if blocks > 0 => blocks * num_shards,
        SliceLayout::Strided { .. } => {
            return Err(CoreError::shape(name, "strided layout needs at least one block"));
        }
    };
    if dim % divisor != 0 {
        return Err(CoreError::shape(
            name,
            format!(
                "axis {} of length {} is not divisible into {} chunks",
                axis, dim, divisor
            ),
        ));
    }
    let mut local = full_shape.to_vec();
    local[axis] = dim / num_shards;
    Ok(local)
}

/// Extract rank `shard_id`'s chunk from row-major `data`
///
/// Returns the local shape and values. Fails with a shape error when the
/// axis cannot be split evenly.
pub fn slice_tensor<T: Copy>(
    name: &str,
    data: &[T],
    full_shape: &[usize],
    axis: usize,
    layout: SliceLayout,
    shard_id: usize,
    num_shards: usize,
) -> Result<(Vec<usize>, Vec<T>)> {
    let local = shard_shape(name, full_shape, axis, layout, num_shards)?;
    if data.len() != shape::numel(full_shape) {
        return Err(CoreError::shape(
            name,
            format!("{} values do not fill shape {:?}", data.len(), full_shape),
        ));
    }

    let dim = full_shape[axis];
    let outer: usize = full_shape[..axis].iter().product();
    let inner: usize = full_shape[axis + 1..].iter().product();

    // (offset along axis, length along axis) pieces kept by this shard
    let pieces: Vec<(usize, usize)> = match layout {
        SliceLayout::Contiguous => {
            let (start, end) = calculate_shard_indices(dim, shard_id, num_shards);
            vec![(start, end - start)]
        }
        SliceLayout::Strided { blocks } => {
            let block = dim / blocks;
            (0..blocks)
                .map(|b| {
                    let (start, end) = calculate_shard_indices(block, shard_id, num_shards);
                    (b * block + start, end - start)
                })
                .collect()
        }
    };

    let mut out = Vec::with_capacity(shape::numel(&local));
    for o in 0..outer {
        let base = o * dim;
        for &(offset, len) in &pieces {
            let from = (base + offset) * inner;
            out.extend_from_slice(&data[from..from + len * inner]);
        }
    }
    Ok((local, out))
}
