//! Checkpoint loading onto a (possibly sliced) module tree
//!
//! Checkpoint entries are looked up by the parameter's qualified name. An
//! entry saved as the full tensor is cut with the parameter's own
//! [`ShardMark`](shardconv_core::ShardMark), i.e. with the same axis, layout
//! and rank the slicer used. An entry saved pre-sharded must have been saved
//! for exactly this rank.
//!
//! Loading is two-phase: every entry is resolved and shape-checked before the
//! first value is copied.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use safetensors::SafeTensors;

use shardconv_core::{
    slice_tensor, CoreError, DType, Device, ModuleTree, ParallelTopology, Parameter, Tensor,
};

use crate::error::{ConvertError, Result};
use crate::slicer::SlicePolicy;

/// How a checkpoint entry was saved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// The unsliced tensor
    Full,
    /// One rank's shard
    Shard { rank: usize, tp_size: usize },
}

/// A tensor read from a checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub tensor: Tensor,
    pub partition: Partition,
}

/// Source of named parameter values
pub trait Checkpoint: Send + Sync {
    /// Look up a parameter by canonical name
    fn entry(&self, name: &str) -> Result<Option<CheckpointEntry>>;

    /// Number of tensors available
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory checkpoint
#[derive(Debug, Clone, Default)]
pub struct CheckpointMap {
    entries: HashMap<String, CheckpointEntry>,
}

impl CheckpointMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an unsliced tensor
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> &mut Self {
        self.entries.insert(
            name.into(),
            CheckpointEntry {
                tensor,
                partition: Partition::Full,
            },
        );
        self
    }

    /// Insert a tensor saved as one rank's shard
    pub fn insert_shard(&mut self, name: impl Into<String>, tensor: Tensor, rank: usize, tp_size: usize) -> &mut Self {
        self.entries.insert(
            name.into(),
            CheckpointEntry {
                tensor,
                partition: Partition::Shard { rank, tp_size },
            },
        );
        self
    }

    /// Snapshot every parameter of a model as full tensors
    pub fn from_model(model: &ModuleTree) -> Result<Self> {
        let mut map = Self::new();
        for (name, param) in model.named_parameters()? {
            let tensor = param.read();
            if tensor.is_meta() {
                return Err(CoreError::NoStorage(name).into());
            }
            if tensor.shard().is_some() {
                return Err(CoreError::InvalidConfig(format!(
                    "{} is sliced; snapshot the model before slicing",
                    name
                ))
                .into());
            }
            map.insert(name, tensor.clone());
        }
        Ok(map)
    }

    pub fn remove(&mut self, name: &str) -> Option<CheckpointEntry> {
        self.entries.remove(name)
    }
}

impl Checkpoint for CheckpointMap {
    fn entry(&self, name: &str) -> Result<Option<CheckpointEntry>> {
        Ok(self.entries.get(name).cloned())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Where one tensor lives inside a mapped file
#[derive(Debug, Clone)]
struct TensorLocation {
    file: String,
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
    /// Byte range within the mapped file
    bytes: Range<usize>,
}

/// Memory-mapped directory of safetensors files
///
/// Files whose header metadata carries `tp_rank` and `tp_size` hold
/// pre-sharded tensors; all others hold full tensors. Headers are parsed
/// once at open; lookups slice the mapping directly.
pub struct SafetensorsCheckpoint {
    dir: PathBuf,
    mmaps: HashMap<String, Mmap>,
    index: HashMap<String, TensorLocation>,
    partitions: HashMap<String, Partition>,
}

impl SafetensorsCheckpoint {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            return Err(ConvertError::CheckpointNotFound(dir.display().to_string()));
        }

        let mut checkpoint = Self {
            dir,
            mmaps: HashMap::new(),
            index: HashMap::new(),
            partitions: HashMap::new(),
        };
        for file in checkpoint.list_safetensor_files()? {
            checkpoint.mmap_file(&file)?;
        }
        tracing::info!(
            dir = %checkpoint.dir.display(),
            files = checkpoint.mmaps.len(),
            tensors = checkpoint.index.len(),
            "Opened safetensors checkpoint"
        );
        Ok(checkpoint)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List safetensor files in the checkpoint directory
    pub fn list_safetensor_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map_or(false, |ext| ext == "safetensors") {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    fn mmap_file(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ConvertError::InvalidFormat(path.display().to_string()))?;

        let (_, metadata) = SafeTensors::read_metadata(&mmap)
            .map_err(|e| ConvertError::InvalidFormat(format!("{}: {}", filename, e)))?;
        let partition = metadata
            .metadata()
            .as_ref()
            .and_then(|m| {
                let rank = m.get("tp_rank")?.parse().ok()?;
                let tp_size = m.get("tp_size")?.parse().ok()?;
                Some(Partition::Shard { rank, tp_size })
            })
            .unwrap_or(Partition::Full);

        let tensors = SafeTensors::deserialize(&mmap)
            .map_err(|e| ConvertError::InvalidFormat(format!("{}: {}", filename, e)))?;
        let base = mmap.as_ptr() as usize;
        for (name, view) in tensors.tensors() {
            if let Some(previous) = self.index.get(&name) {
                return Err(ConvertError::InvalidFormat(format!(
                    "{} appears in both {} and {}",
                    name, previous.file, filename
                )));
            }
            let start = view.data().as_ptr() as usize - base;
            let location = TensorLocation {
                file: filename.clone(),
                dtype: view.dtype(),
                shape: view.shape().to_vec(),
                bytes: start..start + view.data().len(),
            };
            self.index.insert(name, location);
        }

        self.partitions.insert(filename.clone(), partition);
        self.mmaps.insert(filename, mmap);
        Ok(())
    }
}

impl Checkpoint for SafetensorsCheckpoint {
    fn entry(&self, name: &str) -> Result<Option<CheckpointEntry>> {
        let Some(location) = self.index.get(name) else {
            return Ok(None);
        };
        let bytes = self
            .mmaps
            .get(&location.file)
            .and_then(|mmap| mmap.get(location.bytes.clone()))
            .ok_or_else(|| ConvertError::InvalidFormat(format!("{}: truncated mapping", name)))?;

        let dtype = match location.dtype {
            safetensors::Dtype::BF16 => DType::BF16,
            safetensors::Dtype::F16 => DType::F16,
            safetensors::Dtype::F32 => DType::F32,
            dt => return Err(ConvertError::UnsupportedDtype(format!("{}: {:?}", name, dt))),
        };
        let values = dtype.decode(bytes)?;
        let tensor = Tensor::new(location.shape.clone(), dtype, Device::Cpu, values)?;
        let partition = self
            .partitions
            .get(&location.file)
            .copied()
            .unwrap_or(Partition::Full);

        Ok(Some(CheckpointEntry { tensor, partition }))
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Outcome of a load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters whose values were copied
    pub loaded: usize,
    /// Of those, cut from a full checkpoint tensor
    pub resharded: usize,
    /// Optional parameters absent from the checkpoint
    pub skipped_optional: Vec<String>,
}

/// Overlays checkpoint values onto model parameters
pub struct WeightLoader {
    policy: Arc<SlicePolicy>,
}

impl WeightLoader {
    pub fn new(policy: Arc<SlicePolicy>) -> Self {
        Self { policy }
    }

    /// Copy checkpoint values into the model; no-op without a checkpoint
    pub fn load_if_necessary(
        &self,
        model: &mut ModuleTree,
        checkpoint: Option<&dyn Checkpoint>,
        topology: &ParallelTopology,
    ) -> Result<LoadReport> {
        let Some(checkpoint) = checkpoint else {
            tracing::debug!("No checkpoint supplied, keeping current weights");
            return Ok(LoadReport::default());
        };

        let rules = self.policy.parameter_rules(model)?;
        let mut report = LoadReport::default();
        let mut staged: Vec<(String, Parameter, Vec<f32>)> = Vec::new();

        for (name, param) in model.named_parameters()? {
            let Some(entry) = checkpoint.entry(&name)? else {
                if rules.get(&name).map_or(false, |r| r.optional) {
                    report.skipped_optional.push(name);
                    continue;
                }
                return Err(CoreError::MissingWeight(name).into());
            };

            let (values, resharded) = Self::resolve(&name, &param, entry, topology)?;
            if resharded {
                report.resharded += 1;
            }
            staged.push((name, param, values));
        }

        for (name, param, values) in &staged {
            param.write().copy_values(name, values)?;
        }
        report.loaded = staged.len();

        tracing::info!(
            loaded = report.loaded,
            resharded = report.resharded,
            skipped = report.skipped_optional.len(),
            "Loaded checkpoint weights"
        );
        Ok(report)
    }

    /// Values for `param` from `entry`, cut to the local shard when needed
    fn resolve(
        name: &str,
        param: &Parameter,
        entry: CheckpointEntry,
        topology: &ParallelTopology,
    ) -> Result<(Vec<f32>, bool)> {
        let target = param.read();
        let target_shape = target.shape().to_vec();
        let got = entry.tensor.shape().to_vec();
        let mismatch = || CoreError::ShapeMismatch {
            name: name.to_string(),
            expected: target_shape.clone(),
            got: got.clone(),
        };

        let data = entry
            .tensor
            .data()
            .ok_or_else(|| CoreError::NoStorage(name.to_string()))?;

        match entry.partition {
            Partition::Full => {
                // a full entry always matches the unsliced shape
                let Some(mark) = target.shard() else {
                    if got != target_shape {
                        return Err(mismatch().into());
                    }
                    return Ok((data.to_vec(), false));
                };
                if got != mark.full_shape {
                    return Err(CoreError::ShapeMismatch {
                        name: name.to_string(),
                        expected: mark.full_shape.clone(),
                        got: got.clone(),
                    }
                    .into());
                }
                let (shape, values) = slice_tensor(
                    name,
                    data,
                    &got,
                    mark.axis,
                    mark.layout,
                    topology.rank(),
                    mark.tp_size,
                )?;
                if shape != target_shape {
                    return Err(mismatch().into());
                }
                Ok((values, true))
            }
            Partition::Shard { rank, tp_size } => {
                if rank != topology.rank() || tp_size != topology.tp_size() {
                    return Err(CoreError::shape(
                        name,
                        format!(
                            "checkpoint shard is rank {} of {}, model is rank {} of {}",
                            rank,
                            tp_size,
                            topology.rank(),
                            topology.tp_size()
                        ),
                    )
                    .into());
                }
                if got != target_shape {
                    return Err(mismatch().into());
                }
                Ok((data.to_vec(), false))
            }
        }
    }
}
