//! Conversion orchestrator
//!
//! A [`Converter`] is built once per process. Building establishes the
//! tensor-parallel topology (the only collective); [`Converter::convert`]
//! then runs, in order:
//!
//! ```text
//! TopologyEstablished -> Sliced -> Loaded -> Materialized
//!     -> ForwardRebound -> ModulesReplaced -> OperatorsReplaced -> Done
//! ```
//!
//! When a wrapping engine already sharded the model, slicing, loading and
//! materialization are skipped. Nothing is rolled back on failure.

use std::fmt;
use std::sync::Arc;

use shardconv_core::{
    CollectiveTransport, ConverterConfig, CoreError, DType, Device, DistributedEnv, GroupRegistry,
    KernelCatalog, LocalTransport, ModuleTree, ParallelGroupManager, ParallelTopology,
    TransformerConfig,
};

use crate::error::Result;
use crate::interop::{detect, require_host, HostLibrary, InteropMode, StaticHost, TopologyProvider};
use crate::loader::{Checkpoint, LoadReport, SafetensorsCheckpoint, WeightLoader};
use crate::replacer::{ModuleReplacer, ReplaceFn, ReplaceReport};
use crate::slicer::{PartitionFn, ShardingPlan, SlicePolicy, TensorSlicer};

/// Progress of a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    TopologyEstablished,
    Sliced,
    Loaded,
    Materialized,
    ForwardRebound,
    ModulesReplaced,
    OperatorsReplaced,
    Done,
}

/// What a conversion did
#[derive(Debug, Clone, Default)]
pub struct ConversionReport {
    /// Model returned unchanged because the host library is missing
    pub passed_through: bool,
    pub mode: Option<InteropMode>,
    pub plan: Option<ShardingPlan>,
    pub load: LoadReport,
    pub replace: ReplaceReport,
    /// Device the parameters were moved to, if they were moved
    pub device: Option<Device>,
}

/// Collects configuration and collaborators for a [`Converter`]
pub struct ConverterBuilder {
    config: ConverterConfig,
    env: Option<DistributedEnv>,
    transport: Option<Arc<dyn CollectiveTransport>>,
    registry: Option<Arc<GroupRegistry>>,
    partition_fn: Option<PartitionFn>,
    replace_fn: Option<ReplaceFn>,
    checkpoint: Option<Arc<dyn Checkpoint>>,
    provider: Option<Arc<dyn TopologyProvider>>,
    host: Option<Arc<dyn HostLibrary>>,
    catalog: Option<KernelCatalog>,
    model_config: Option<TransformerConfig>,
}

impl ConverterBuilder {
    pub fn new(config: ConverterConfig) -> Self {
        Self {
            config,
            env: None,
            transport: None,
            registry: None,
            partition_fn: None,
            replace_fn: None,
            checkpoint: None,
            provider: None,
            host: None,
            catalog: None,
            model_config: None,
        }
    }

    /// Rank and world size; read from the environment when unset and
    /// `distributed` is on
    pub fn env(mut self, env: DistributedEnv) -> Self {
        self.env = Some(env);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn CollectiveTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registry the group is published to; the process-wide one by default
    pub fn registry(mut self, registry: Arc<GroupRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn tensor_parallel_partition_fn(mut self, f: PartitionFn) -> Self {
        self.partition_fn = Some(f);
        self
    }

    pub fn replace_fn(mut self, f: ReplaceFn) -> Self {
        self.replace_fn = Some(f);
        self
    }

    /// In-memory checkpoint; exclusive with `config.checkpoint`
    pub fn checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn TopologyProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn host(mut self, host: Arc<dyn HostLibrary>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn catalog(mut self, catalog: KernelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Model hyper-parameters handed to module replacement
    pub fn model_config(mut self, config: TransformerConfig) -> Self {
        self.model_config = Some(config);
        self
    }

    /// Validate, establish the topology and open the checkpoint
    pub fn build(self) -> Result<Converter> {
        self.config.validate()?;

        let env = match self.env {
            Some(env) => env,
            None if self.config.distributed => DistributedEnv::from_env()?,
            None => DistributedEnv::single(),
        };

        let manager = ParallelGroupManager::new(
            self.transport.unwrap_or_else(|| Arc::new(LocalTransport::new())),
            self.registry.unwrap_or_else(GroupRegistry::global),
        );
        let topology = manager.create_or_get_group(env.world_size, env.rank)?;
        tracing::info!(
            rank = env.rank,
            world_size = env.world_size,
            tp_size = topology.tp_size(),
            "Established tensor-parallel topology"
        );

        let checkpoint: Option<Arc<dyn Checkpoint>> = match (&self.config.checkpoint, self.checkpoint) {
            (Some(_), Some(_)) => {
                return Err(CoreError::InvalidConfig(
                    "both a checkpoint path and an in-memory checkpoint were given".into(),
                )
                .into())
            }
            (Some(path), None) => Some(Arc::new(SafetensorsCheckpoint::open(path)?) as Arc<dyn Checkpoint>),
            (None, checkpoint) => checkpoint,
        };

        let mut policy = SlicePolicy::default();
        if let Some(f) = self.partition_fn {
            policy = policy.with_partition_fn(f);
        }
        let policy = Arc::new(policy);

        let replacer = ModuleReplacer::new(self.catalog.unwrap_or_else(KernelCatalog::xpu)).with_overrides(
            self.config.replaced_module_type.as_deref(),
            self.config.replaced_layer_type.as_deref(),
            self.replace_fn,
        );

        Ok(Converter {
            config: self.config,
            env,
            topology,
            slicer: TensorSlicer::new(policy.clone()),
            loader: WeightLoader::new(policy),
            replacer,
            checkpoint,
            provider: self.provider,
            host: self.host.unwrap_or_else(|| Arc::new(StaticHost::default())),
            model_config: self.model_config,
            stage: Stage::TopologyEstablished,
        })
    }
}

/// Converts a generic model into its sharded, accelerator-specialized form
pub struct Converter {
    config: ConverterConfig,
    env: DistributedEnv,
    topology: ParallelTopology,
    slicer: TensorSlicer,
    loader: WeightLoader,
    replacer: ModuleReplacer,
    checkpoint: Option<Arc<dyn Checkpoint>>,
    provider: Option<Arc<dyn TopologyProvider>>,
    host: Arc<dyn HostLibrary>,
    model_config: Option<TransformerConfig>,
    stage: Stage,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("config", &self.config)
            .field("env", &self.env)
            .field("topology", &self.topology)
            .field("stage", &self.stage)
            .field("has_checkpoint", &self.checkpoint.is_some())
            .finish()
    }
}

impl Converter {
    pub fn builder(config: ConverterConfig) -> ConverterBuilder {
        ConverterBuilder::new(config)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn topology(&self) -> &ParallelTopology {
        &self.topology
    }

    pub fn env(&self) -> DistributedEnv {
        self.env
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Local shapes this rank would end up with
    pub fn plan(&self, model: &ModuleTree) -> Result<ShardingPlan> {
        self.slicer.plan(model, &self.topology)
    }

    /// Convert `model` in place and hand it back
    pub fn convert<'m>(&mut self, model: &'m mut ModuleTree, dtype: DType) -> Result<&'m mut ModuleTree> {
        self.convert_with_report(model, dtype)?;
        Ok(model)
    }

    /// Convert `model` in place, reporting what each stage did
    pub fn convert_with_report(&mut self, model: &mut ModuleTree, dtype: DType) -> Result<ConversionReport> {
        if let Err(e) = require_host(&*self.host) {
            if e.core().map_or(false, CoreError::is_recoverable) {
                tracing::warn!(error = %e, "Host model library unavailable, returning model unchanged");
                return Ok(ConversionReport {
                    passed_through: true,
                    ..Default::default()
                });
            }
            return Err(e);
        }
        if self.stage != Stage::TopologyEstablished {
            return Err(CoreError::InvalidConfig(format!(
                "converter already used (stage {:?})",
                self.stage
            ))
            .into());
        }

        let mode = detect(self.provider.as_deref(), self.env.rank)?;
        if let Some(provider) = &self.provider {
            self.replacer.extend_rules(provider.replacement_rules());
        }
        let topology = match &mode {
            InteropMode::AutoTp(t) => t.clone(),
            InteropMode::Native | InteropMode::Adopted => self.topology.clone(),
        };

        let mut report = ConversionReport {
            mode: Some(mode.clone()),
            ..Default::default()
        };

        if mode.skips_slicing() {
            tracing::info!("Model already sharded by its engine, skipping slicing and loading");
        } else {
            report.plan = Some(self.slicer.plan(model, &topology)?);
            self.slicer.slice_model(model, &topology)?;
            self.advance(Stage::Sliced);

            report.load = self
                .loader
                .load_if_necessary(model, self.checkpoint.as_deref(), &topology)?;
            self.advance(Stage::Loaded);

            let device = self
                .config
                .target_device(self.config.distributed.then_some(self.env.rank));
            materialize(model, device, dtype)?;
            report.device = Some(device);
            self.advance(Stage::Materialized);
        }

        report.replace.forward_rebound = self.replacer.replace_forward_functions(model)?;
        self.advance(Stage::ForwardRebound);

        report.replace.modules_replaced =
            self.replacer
                .replace_modules(model, dtype, &topology, self.model_config.as_ref())?;
        self.advance(Stage::ModulesReplaced);

        report.replace.operators_replaced = self.replacer.replace_operators(model)?;
        self.advance(Stage::OperatorsReplaced);

        self.advance(Stage::Done);
        Ok(report)
    }

    fn advance(&mut self, stage: Stage) {
        tracing::debug!(from = ?self.stage, to = ?stage, "Conversion stage");
        self.stage = stage;
    }
}

/// Move every parameter to `device`, casting floating-point ones to `dtype`
///
/// Fails before moving anything if a parameter still has no storage.
fn materialize(model: &ModuleTree, device: Device, dtype: DType) -> Result<()> {
    let params = model.named_parameters()?;
    if let Some((name, _)) = params.iter().find(|(_, p)| p.read().is_meta()) {
        return Err(CoreError::NoStorage(name.clone()).into());
    }
    for (name, param) in &params {
        let mut tensor = param.write();
        tensor.to_device(name, device)?;
        if tensor.is_floating_point() {
            tensor.to_dtype(dtype);
        }
    }
    tracing::info!(%device, ?dtype, tensors = params.len(), "Materialized parameters");
    Ok(())
}
