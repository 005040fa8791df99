//! shardconv model - tensor-parallel conversion of transformer modules
//!
//! This crate provides:
//! - Slicing of parallel-sensitive weights to the local rank's shard
//! - Weight loading from in-memory or memory-mapped safetensors checkpoints,
//!   re-sharded with the same policy as the slicer
//! - Replacement of generic layers with accelerator-specialized modules
//! - Interop with inference engines that shard models themselves
//! - The [`Converter`] orchestrating all of the above
//! - A transformer skeleton builder for preset architectures

pub mod builder;
pub mod converter;
pub mod error;
pub mod interop;
pub mod loader;
pub mod replacer;
pub mod slicer;

pub use builder::{TransformerBuilder, WeightInit};
pub use converter::{ConversionReport, Converter, ConverterBuilder, Stage};
pub use error::{ConvertError, Result};
pub use interop::{HostLibrary, InferenceEngineConfig, InteropMode, StaticHost, TopologyProvider};
pub use loader::{Checkpoint, CheckpointEntry, CheckpointMap, LoadReport, Partition, SafetensorsCheckpoint, WeightLoader};
pub use replacer::{ModuleReplacer, ReplaceContext, ReplaceFn, ReplaceReport, ReplacementRule};
pub use slicer::{PartitionFn, PlannedShard, ShardingPlan, SlicePolicy, TensorSlicer};
