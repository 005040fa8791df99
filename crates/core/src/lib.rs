//! shardconv core - building blocks for tensor-parallel model conversion
//!
//! This crate provides the pieces the conversion pipeline is assembled from:
//!
//! - **Tensors**: host-mirrored tensors with dtype/device tags and meta tensors
//! - **Module tree**: arena of modules with stable ids and named child slots
//! - **Partition policy**: the one slicing function shared by slicer and loader
//! - **Communication groups**: group formation through a pluggable transport,
//!   published once per process
//! - **Scoped allocation**: tensor construction defaults overridden for the
//!   lifetime of a guard
//!
//! # Tensor parallel layout
//!
//! - Column parallel for Q/K/V and FFN gate/up projections (split axis 0)
//! - Row parallel for output and FFN down projections (split axis 1)
//! - Norms replicated on every rank

pub mod allocation;
pub mod comm;
pub mod config;
pub mod error;
pub mod kernel;
pub mod model;
pub mod module;
pub mod parallel;
pub mod tensor;

pub use allocation::{AllocationScope, OnDevice, TensorFactory};
pub use comm::{CollectiveTransport, CommGroup, GroupRegistry, LocalTransport, ParallelGroupManager};
pub use config::{ConverterConfig, DistributedEnv, ModelArchitecture};
pub use error::{CoreError, Result};
pub use kernel::KernelCatalog;
pub use model::TransformerConfig;
pub use module::{Dispatch, Module, ModuleId, ModuleTree};
pub use parallel::{slice_tensor, ParallelTopology, SliceLayout, SliceRule, SliceSpec};
pub use tensor::{parameter, DType, Device, Parameter, ShardMark, Tensor};
