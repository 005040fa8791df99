//! End-to-end conversion tests
//!
//! Each rank of a tensor-parallel run is simulated by its own converter in
//! this process; the ranks share one group registry and transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use safetensors::tensor::TensorView;
use shardconv_core::{
    parameter, CommGroup, ConverterConfig, CoreError, DType, Device, Dispatch, DistributedEnv,
    GroupRegistry, LocalTransport, ModelArchitecture, Module, ModuleTree, OnDevice, SliceRule,
    SliceSpec, Tensor, TensorFactory, TransformerConfig,
};
use shardconv_model::{
    CheckpointMap, Converter, ConverterBuilder, InferenceEngineConfig, InteropMode, PartitionFn, ReplacementRule,
    Stage, StaticHost, TransformerBuilder, WeightInit,
};

fn tiny(init: WeightInit) -> ModuleTree {
    let config = TransformerConfig::from_architecture(ModelArchitecture::Tiny);
    TransformerBuilder::new(config)
        .with_init(init)
        .build(&TensorFactory::new())
        .unwrap()
}

fn tiny_meta() -> ModuleTree {
    let config = TransformerConfig::from_architecture(ModelArchitecture::Tiny);
    let factory = TensorFactory::new();
    let _scope = factory.on_device(OnDevice::new(Device::Meta, DType::F32));
    TransformerBuilder::new(config).build(&factory).unwrap()
}

/// Single `Linear` with an `[8, 4]` weight holding 0..32 row-major
fn single_linear() -> ModuleTree {
    let mut tree = ModuleTree::new(Module::new("Toy"));
    let root = tree.root();
    let values: Vec<f32> = (0..32).map(|v| v as f32).collect();
    let weight = parameter(Tensor::from_f32(vec![8, 4], values).unwrap());
    tree.add_child(root, "proj", Module::new("Linear").with_param("weight", weight))
        .unwrap();
    tree
}

fn split_linear_rows() -> PartitionFn {
    Arc::new(|kind: &str| {
        (kind == "Linear").then(|| SliceSpec::new(kind, vec![SliceRule::split("weight", 0)]))
    })
}

fn rank_converter(
    rank: usize,
    world_size: usize,
    registry: &Arc<GroupRegistry>,
    transport: &Arc<LocalTransport>,
) -> ConverterBuilder {
    let config = ConverterConfig {
        distributed: world_size > 1,
        ..Default::default()
    };
    Converter::builder(config)
        .env(DistributedEnv { rank, world_size })
        .registry(registry.clone())
        .transport(transport.clone())
}

fn values_of(tree: &ModuleTree, name: &str) -> Vec<f32> {
    tree.parameter(name).unwrap().read().data().unwrap().to_vec()
}

// =============================================================================
// Single rank
// =============================================================================

mod single_rank {
    use super::*;

    #[test]
    fn test_tp1_keeps_values_and_names() {
        let reference = tiny(WeightInit::Pattern { seed: 11 });
        let mut model = tiny(WeightInit::Pattern { seed: 11 });

        let mut conv = Converter::builder(ConverterConfig::default())
            .env(DistributedEnv::single())
            .registry(Arc::new(GroupRegistry::new()))
            .build()
            .unwrap();
        conv.convert(&mut model, DType::BF16).unwrap();
        assert_eq!(conv.stage(), Stage::Done);

        // replaced layers list their parameters in name order
        let before: BTreeMap<_, _> = reference.named_parameters().unwrap().into_iter().collect();
        let after: BTreeMap<_, _> = model.named_parameters().unwrap().into_iter().collect();
        assert_eq!(before.len(), after.len());
        for ((a, pa), (b, pb)) in before.iter().zip(&after) {
            assert_eq!(a, b);
            let (ta, tb) = (pa.read(), pb.read());
            assert_eq!(ta.shape(), tb.shape(), "{}", a);
            assert_eq!(tb.dtype(), DType::BF16, "{}", a);
            assert_eq!(tb.device(), Device::Xpu(None), "{}", a);
            let cast: Vec<f32> = ta.data().unwrap().iter().map(|&v| DType::BF16.round(v)).collect();
            assert_eq!(tb.data().unwrap(), cast.as_slice(), "{}", a);
            assert!(tb.shard().is_none());
        }
    }

    #[test]
    fn test_single_linear_unchanged_at_tp1() {
        let mut model = single_linear();
        let mut conv = Converter::builder(ConverterConfig::default())
            .env(DistributedEnv::single())
            .registry(Arc::new(GroupRegistry::new()))
            .tensor_parallel_partition_fn(split_linear_rows())
            .build()
            .unwrap();
        conv.convert(&mut model, DType::F16).unwrap();

        let w = model.parameter("proj.weight").unwrap();
        let w = w.read();
        assert_eq!(w.shape(), &[8, 4]);
        assert_eq!(w.dtype(), DType::F16);
        assert_eq!(w.device(), Device::Xpu(None));
        let expected: Vec<f32> = (0..32).map(|v| DType::F16.round(v as f32)).collect();
        assert_eq!(w.data().unwrap(), expected.as_slice());
    }

    #[test]
    fn test_caller_handles_stay_valid() {
        let mut model = tiny(WeightInit::Pattern { seed: 2 });
        let handle = model.parameter("model.layers.0.mlp.down_proj.weight").unwrap();

        Converter::builder(ConverterConfig::default())
            .env(DistributedEnv::single())
            .registry(Arc::new(GroupRegistry::new()))
            .build()
            .unwrap()
            .convert(&mut model, DType::BF16)
            .unwrap();

        let after = model.parameter("model.layers.0.mlp.down_proj.weight").unwrap();
        assert!(Arc::ptr_eq(&handle, &after));
        assert_eq!(handle.read().dtype(), DType::BF16);

        let layer = model.get(model.find("model.layers.0").unwrap()).unwrap();
        assert_eq!(layer.kind, "XpuTransformerBlock");
        assert_eq!(layer.operators["mlp.act_fn"], "xpu_silu");
    }
}

// =============================================================================
// Two ranks
// =============================================================================

mod two_ranks {
    use super::*;

    #[test]
    fn test_single_linear_rows_split() {
        let registry = Arc::new(GroupRegistry::new());
        let transport = Arc::new(LocalTransport::new());

        for (rank, rows) in [(0usize, 0..4usize), (1, 4..8)] {
            let mut model = single_linear();
            rank_converter(rank, 2, &registry, &transport)
                .tensor_parallel_partition_fn(split_linear_rows())
                .build()
                .unwrap()
                .convert(&mut model, DType::F32)
                .unwrap();

            let w = model.parameter("proj.weight").unwrap();
            let w = w.read();
            assert_eq!(w.shape(), &[4, 4]);
            assert_eq!(w.device(), Device::Xpu(Some(rank)));
            let expected: Vec<f32> = (rows.start * 4..rows.end * 4).map(|v| v as f32).collect();
            assert_eq!(w.data().unwrap(), expected.as_slice());
        }

        // both ranks joined one group
        assert_eq!(transport.groups_formed(), 1);
        assert_eq!(registry.current().map(|g| g.size()), Some(2));
    }

    #[test]
    fn test_shards_reconstruct_full_model() {
        let reference = tiny(WeightInit::Pattern { seed: 5 });
        let registry = Arc::new(GroupRegistry::new());
        let transport = Arc::new(LocalTransport::new());

        let shards: Vec<ModuleTree> = (0..2)
            .map(|rank| {
                let mut model = tiny(WeightInit::Pattern { seed: 5 });
                rank_converter(rank, 2, &registry, &transport)
                    .build()
                    .unwrap()
                    .convert(&mut model, DType::F32)
                    .unwrap();
                model
            })
            .collect();

        // q_proj is split on rows: concatenation restores it
        let name = "model.layers.1.self_attn.q_proj.weight";
        let mut rows = values_of(&shards[0], name);
        rows.extend(values_of(&shards[1], name));
        assert_eq!(rows, values_of(&reference, name));

        // o_proj is split on columns: [64, 32] per rank
        let name = "model.layers.0.self_attn.o_proj.weight";
        let full = values_of(&reference, name);
        for (rank, shard) in shards.iter().enumerate() {
            let local = values_of(shard, name);
            for row in 0..64 {
                assert_eq!(
                    &local[row * 32..(row + 1) * 32],
                    &full[row * 64 + rank * 32..row * 64 + rank * 32 + 32]
                );
            }
        }

        // replicated tensors are identical everywhere
        for shard in &shards {
            assert_eq!(
                values_of(shard, "model.embed_tokens.weight"),
                values_of(&reference, "model.embed_tokens.weight")
            );
        }
    }

    #[test]
    fn test_meta_skeleton_loaded_from_full_checkpoint() {
        let source = tiny(WeightInit::Pattern { seed: 9 });
        let checkpoint = Arc::new(CheckpointMap::from_model(&source).unwrap());
        let registry = Arc::new(GroupRegistry::new());
        let transport = Arc::new(LocalTransport::new());

        for rank in 0..2 {
            let mut model = tiny_meta();
            let report = rank_converter(rank, 2, &registry, &transport)
                .checkpoint(checkpoint.clone())
                .build()
                .unwrap()
                .convert_with_report(&mut model, DType::F32)
                .unwrap();
            assert_eq!(report.load.loaded, source.named_parameters().unwrap().len());
            assert_eq!(report.load.resharded, 14);

            let local = values_of(&model, "model.layers.0.mlp.gate_proj.weight");
            let full = values_of(&source, "model.layers.0.mlp.gate_proj.weight");
            // gate_proj [128, 64] split on rows
            assert_eq!(local.as_slice(), &full[rank * 64 * 64..(rank + 1) * 64 * 64]);
        }
    }

    #[test]
    fn test_indivisible_fails_on_every_rank() {
        let registry = Arc::new(GroupRegistry::new());
        let transport = Arc::new(LocalTransport::new());
        for rank in 0..3 {
            // [8, 4] does not split over 3 ranks
            let mut model = single_linear();
            let err = rank_converter(rank, 3, &registry, &transport)
                .tensor_parallel_partition_fn(split_linear_rows())
                .build()
                .unwrap()
                .convert(&mut model, DType::F32)
                .unwrap_err();
            assert!(err.is_shape_error());
            assert_eq!(model.parameter("proj.weight").unwrap().read().shape(), &[8, 4]);
        }
    }
}

// =============================================================================
// Checkpoints on disk
// =============================================================================

mod safetensors_checkpoint {
    use super::*;

    fn write_bf16(dir: &std::path::Path, file: &str, model: &ModuleTree, metadata: Option<HashMap<String, String>>) {
        let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = model
            .named_parameters()
            .unwrap()
            .into_iter()
            .map(|(name, param)| {
                let t = param.read();
                let bytes = t
                    .data()
                    .unwrap()
                    .iter()
                    .flat_map(|&v| half::bf16::from_f32(v).to_le_bytes())
                    .collect();
                (name, t.shape().to_vec(), bytes)
            })
            .collect();
        let views: Vec<(String, TensorView<'_>)> = encoded
            .iter()
            .map(|(name, shape, bytes)| {
                (
                    name.clone(),
                    TensorView::new(safetensors::Dtype::BF16, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        let bytes = safetensors::serialize(views.iter().map(|(k, v)| (k.as_str(), v)), &metadata).unwrap();
        std::fs::write(dir.join(file), bytes).unwrap();
    }

    #[test]
    fn test_convert_from_safetensors_directory() {
        let source = tiny(WeightInit::Pattern { seed: 4 });
        let dir = tempfile::tempdir().unwrap();
        write_bf16(dir.path(), "model.safetensors", &source, None);

        let config = ConverterConfig {
            checkpoint: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let mut model = tiny_meta();
        let mut conv = Converter::builder(config)
            .env(DistributedEnv::single())
            .registry(Arc::new(GroupRegistry::new()))
            .build()
            .unwrap();
        conv.convert(&mut model, DType::F32).unwrap();

        for (name, param) in source.named_parameters().unwrap() {
            assert_eq!(values_of(&model, &name), param.read().data().unwrap(), "{}", name);
        }
    }

    #[test]
    fn test_presharded_file_for_this_rank() {
        let registry = Arc::new(GroupRegistry::new());
        let transport = Arc::new(LocalTransport::new());

        // what rank 1 holds after slicing
        let mut expected = single_linear();
        rank_converter(1, 2, &registry, &transport)
            .tensor_parallel_partition_fn(split_linear_rows())
            .build()
            .unwrap()
            .convert(&mut expected, DType::F32)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let metadata = HashMap::from([
            ("tp_rank".to_string(), "1".to_string()),
            ("tp_size".to_string(), "2".to_string()),
        ]);
        write_bf16(dir.path(), "rank1.safetensors", &expected, Some(metadata));

        let config = ConverterConfig {
            checkpoint: Some(dir.path().to_path_buf()),
            distributed: true,
            ..Default::default()
        };
        let mut model = single_linear();
        model
            .parameter("proj.weight")
            .unwrap()
            .write()
            .copy_values("proj.weight", &[0.0; 32])
            .unwrap();
        let report = Converter::builder(config)
            .env(DistributedEnv { rank: 1, world_size: 2 })
            .registry(registry)
            .transport(transport)
            .tensor_parallel_partition_fn(split_linear_rows())
            .build()
            .unwrap()
            .convert_with_report(&mut model, DType::F32)
            .unwrap();

        assert_eq!(report.load.loaded, 1);
        assert_eq!(report.load.resharded, 0);
        assert_eq!(values_of(&model, "proj.weight"), values_of(&expected, "proj.weight"));
    }

    #[test]
    fn test_missing_directory() {
        let config = ConverterConfig {
            checkpoint: Some("/definitely/not/here".into()),
            ..Default::default()
        };
        let err = Converter::builder(config)
            .env(DistributedEnv::single())
            .registry(Arc::new(GroupRegistry::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, shardconv_model::ConvertError::CheckpointNotFound(_)));
    }
}

// =============================================================================
// Interop
// =============================================================================

mod interop {
    use super::*;

    #[test]
    fn test_kernel_injection_fails_before_mutation() {
        let mut model = tiny(WeightInit::Zeros);
        let engine = InferenceEngineConfig {
            replace_with_kernel_inject: true,
            ..Default::default()
        };
        let mut conv = Converter::builder(ConverterConfig::default())
            .env(DistributedEnv::single())
            .registry(Arc::new(GroupRegistry::new()))
            .provider(Arc::new(engine))
            .build()
            .unwrap();
        let err = conv.convert(&mut model, DType::F16).unwrap_err();
        assert!(matches!(err.core(), Some(CoreError::UnsupportedInterop(_))));
        assert_eq!(conv.stage(), Stage::TopologyEstablished);

        let q = model.parameter("model.layers.0.self_attn.q_proj.weight").unwrap();
        assert_eq!(q.read().dtype(), DType::F32);
        assert_eq!(q.read().device(), Device::Cpu);
    }

    #[test]
    fn test_engine_tensor_parallel_skips_slicing() {
        let mut model = tiny(WeightInit::Pattern { seed: 1 });
        let engine = InferenceEngineConfig {
            tp_size: 2,
            tp_group: Some(CommGroup::new(42, vec![0, 1])),
            rules: vec![ReplacementRule::new("LlamaDecoderLayer", "EngineBlock")],
            ..Default::default()
        };
        let report = Converter::builder(ConverterConfig::default())
            .env(DistributedEnv::single())
            .registry(Arc::new(GroupRegistry::new()))
            .provider(Arc::new(engine))
            .build()
            .unwrap()
            .convert_with_report(&mut model, DType::F32)
            .unwrap();

        assert!(report.plan.is_none());
        assert!(report.device.is_none());
        let q = model.parameter("model.layers.0.self_attn.q_proj.weight").unwrap();
        assert_eq!(q.read().shape(), &[64, 64]);
        assert!(q.read().shard().is_none());

        let layer = model.get(model.find("model.layers.1").unwrap()).unwrap();
        assert_eq!(layer.kind, "EngineBlock");
        assert_eq!(layer.attr("local_num_heads"), Some(2));
        assert_eq!(layer.attr("tp_size"), Some(2));
    }

    #[test]
    fn test_engine_without_tensor_parallel_uses_converter_ranks() {
        let registry = Arc::new(GroupRegistry::new());
        let transport = Arc::new(LocalTransport::new());

        for (rank, rows) in [(0usize, 0..4usize), (1, 4..8)] {
            let mut model = single_linear();
            let report = rank_converter(rank, 2, &registry, &transport)
                .tensor_parallel_partition_fn(split_linear_rows())
                .provider(Arc::new(InferenceEngineConfig::default()))
                .build()
                .unwrap()
                .convert_with_report(&mut model, DType::F32)
                .unwrap();

            assert_eq!(report.mode, Some(InteropMode::Adopted));
            assert_eq!(report.plan.map(|p| p.tp_size), Some(2));
            let w = model.parameter("proj.weight").unwrap();
            let w = w.read();
            assert_eq!(w.shape(), &[4, 4]);
            assert_eq!(w.device(), Device::Xpu(Some(rank)));
            let expected: Vec<f32> = (rows.start * 4..rows.end * 4).map(|v| v as f32).collect();
            assert_eq!(w.data().unwrap(), expected.as_slice());
        }
    }

    #[test]
    fn test_missing_host_library_passes_model_through() {
        let mut model = tiny(WeightInit::Zeros);
        let mut conv = Converter::builder(ConverterConfig::default())
            .env(DistributedEnv::single())
            .registry(Arc::new(GroupRegistry::new()))
            .host(Arc::new(StaticHost::missing("transformers")))
            .build()
            .unwrap();
        let report = conv.convert_with_report(&mut model, DType::F16).unwrap();

        assert!(report.passed_through);
        assert_eq!(conv.stage(), Stage::TopologyEstablished);
        let layer = model.get(model.find("model.layers.0").unwrap()).unwrap();
        assert_eq!(layer.kind, "LlamaDecoderLayer");
        assert_eq!(layer.forward, Dispatch::Generic);
    }
}

// =============================================================================
// Scoped allocation
// =============================================================================

mod allocation {
    use super::*;

    #[test]
    fn test_meta_half_scope() {
        let factory = TensorFactory::new();
        {
            let _scope = factory.on_device(OnDevice::new(Device::Meta, DType::F16));
            let t = factory.empty(&[2, 3], DType::F32, None);
            assert_eq!(t.device(), Device::Meta);
            assert_eq!(t.dtype(), DType::F16);
            assert!(t.data().is_none());

            let ids = factory.zeros(&[4], DType::I32, None);
            assert_eq!(ids.dtype(), DType::I32);

            let pinned = factory.zeros(&[4], DType::F32, Some(Device::Cpu));
            assert_eq!(pinned.device(), Device::Cpu);
        }
        let t = factory.empty(&[2, 3], DType::F32, None);
        assert_eq!(t.device(), Device::Cpu);
        assert_eq!(t.dtype(), DType::F32);
        assert!(t.data().is_some());
    }
}
