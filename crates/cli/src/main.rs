//! shardconv CLI
//!
//! Converts preset transformer skeletons for tensor-parallel execution and
//! reports what every rank ends up holding.
//!
//! # Usage
//!
//! ```bash
//! # Per-rank sharding plan
//! shardconv plan --arch llama-3.1-70b --ranks 8
//!
//! # Convert, simulating 2 ranks in this process
//! shardconv convert --arch tiny --ranks 2 --dtype bf16
//!
//! # Convert from a safetensors checkpoint
//! shardconv convert --arch qwen-2.5-0.5b --checkpoint ./weights
//!
//! # Write the default configuration
//! shardconv init-config --output shardconv.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardconv_core::{
    ConverterConfig, DType, Device, DistributedEnv, GroupRegistry, LocalTransport, ModelArchitecture,
    ModuleTree, OnDevice, TensorFactory, TransformerConfig,
};
use shardconv_model::{Converter, ConversionReport, TransformerBuilder, WeightInit};

#[derive(Parser)]
#[command(name = "shardconv")]
#[command(version)]
#[command(about = "Tensor-parallel model conversion for XPU devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the sharding plan of every rank without converting
    Plan {
        /// Model architecture (tiny, llama-3.1-8b, llama-3.1-70b, qwen-2.5-0.5b, qwen-2.5-7b)
        #[arg(short, long, default_value = "tiny")]
        arch: String,

        /// Tensor-parallel degree
        #[arg(short, long, default_value = "1")]
        ranks: usize,

        /// Print every sharded tensor
        #[arg(short, long, default_value = "false")]
        verbose: bool,
    },

    /// Convert a model skeleton, one simulated rank at a time
    Convert {
        /// Model architecture (tiny, llama-3.1-8b, llama-3.1-70b, qwen-2.5-0.5b, qwen-2.5-7b)
        #[arg(short, long, default_value = "tiny")]
        arch: String,

        /// Target dtype (f32, f16, bf16)
        #[arg(short, long, default_value = "bf16")]
        dtype: String,

        /// Tensor-parallel degree to simulate
        #[arg(short, long, default_value = "1")]
        ranks: usize,

        /// Converter configuration file (TOML); environment otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory of safetensors files; overrides the configuration
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Write the default converter configuration
    InitConfig {
        /// Output file
        #[arg(short, long, default_value = "shardconv.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardconv=info,shardconv_model=info,shardconv_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::debug!("shardconv v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Plan { arch, ranks, verbose } => plan(&arch, ranks, verbose),
        Commands::Convert {
            arch,
            dtype,
            ranks,
            config,
            checkpoint,
        } => convert(&arch, &dtype, ranks, config, checkpoint),
        Commands::InitConfig { output } => {
            ConverterConfig::default().to_file(&output)?;
            println!("{} {}", style("Wrote").green(), output.display());
            Ok(())
        }
    }
}

fn parse_arch(arch: &str) -> Result<TransformerConfig> {
    let arch = ModelArchitecture::from_str(arch).with_context(|| format!("unknown architecture '{}'", arch))?;
    Ok(TransformerConfig::from_architecture(arch))
}

fn print_model(model: &TransformerConfig, ranks: usize) {
    println!("{}", style("Model").bold().cyan());
    println!("  Hidden dim:   {}", model.hidden_dim);
    println!("  Heads:        {} ({} KV)", model.num_heads, model.num_kv_heads);
    println!("  Layers:       {}", model.num_layers);
    println!("  Parameters:   {:.2}M", model.num_parameters() as f64 / 1e6);
    println!("  Ranks:        {}", ranks);
    println!();
}

/// Per-rank converters over one registry and transport
fn rank_converters(config: &ConverterConfig, ranks: usize) -> Result<Vec<Converter>> {
    if ranks == 0 {
        bail!("--ranks must be at least 1");
    }
    let registry = Arc::new(GroupRegistry::new());
    let transport = Arc::new(LocalTransport::new());
    let mut config = config.clone();
    config.distributed = ranks > 1;

    (0..ranks)
        .map(|rank| {
            Converter::builder(config.clone())
                .env(DistributedEnv {
                    rank,
                    world_size: ranks,
                })
                .registry(registry.clone())
                .transport(transport.clone())
                .build()
                .with_context(|| format!("failed to set up rank {}", rank))
        })
        .collect()
}

fn plan(arch: &str, ranks: usize, verbose: bool) -> Result<()> {
    let model_config = parse_arch(arch)?;
    print_model(&model_config, ranks);
    model_config.validate_for(ranks.max(1))?;

    // shapes only
    let factory = TensorFactory::new();
    let skeleton = {
        let _scope = factory.on_device(OnDevice::new(Device::Meta, DType::BF16));
        TransformerBuilder::new(model_config).build(&factory)?
    };

    for converter in rank_converters(&ConverterConfig::default(), ranks)? {
        let plan = converter.plan(&skeleton)?;
        if verbose {
            print!("{}", plan.summary());
        } else {
            println!(
                "rank {}/{}: {} tensors ({} sharded), {:.2} MB",
                plan.rank,
                plan.tp_size,
                plan.entries.len(),
                plan.num_sharded(),
                plan.local_mb()
            );
        }
    }
    Ok(())
}

fn convert(
    arch: &str,
    dtype: &str,
    ranks: usize,
    config_path: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
) -> Result<()> {
    let dtype = DType::from_str(dtype).with_context(|| format!("unknown dtype '{}'", dtype))?;
    if !dtype.is_floating_point() {
        bail!("target dtype must be floating point, got {:?}", dtype);
    }

    let mut config = match config_path {
        Some(path) => ConverterConfig::from_file(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => ConverterConfig::from_env(),
    };
    if checkpoint.is_some() {
        config.checkpoint = checkpoint;
    }

    let model_config = parse_arch(arch)?;
    print_model(&model_config, ranks);

    for mut converter in rank_converters(&config, ranks)? {
        let rank = converter.env().rank;
        let mut model = build_model(&model_config, config.checkpoint.is_some())?;
        let report = converter
            .convert_with_report(&mut model, dtype)
            .with_context(|| format!("conversion failed on rank {}", rank))?;
        print_report(rank, ranks, &report);
    }
    Ok(())
}

/// Meta skeleton when weights come from a checkpoint, patterned otherwise
fn build_model(model_config: &TransformerConfig, from_checkpoint: bool) -> Result<ModuleTree> {
    let builder = TransformerBuilder::new(model_config.clone()).with_init(WeightInit::Pattern { seed: 0 });
    let factory = TensorFactory::new();
    let scope = OnDevice::new(Device::Meta, DType::F32);
    let _scope = factory.on_device(if from_checkpoint { scope } else { scope.disabled() });
    Ok(builder.build(&factory)?)
}

fn print_report(rank: usize, ranks: usize, report: &ConversionReport) {
    println!("{}", style(format!("Rank {}/{}", rank, ranks)).bold().cyan());
    if report.passed_through {
        println!("  {}", style("host library missing, model unchanged").yellow());
        return;
    }
    if let Some(plan) = &report.plan {
        println!(
            "  Sharded:      {} of {} tensors, {:.2} MB local",
            plan.num_sharded(),
            plan.entries.len(),
            plan.local_mb()
        );
    }
    if report.load.loaded > 0 {
        println!(
            "  Loaded:       {} tensors ({} re-sharded, {} optional skipped)",
            report.load.loaded,
            report.load.resharded,
            report.load.skipped_optional.len()
        );
    }
    if let Some(device) = report.device {
        println!("  Device:       {}", device);
    }
    println!(
        "  Replaced:     {} forward, {} modules, {} operators",
        report.replace.forward_rebound, report.replace.modules_replaced, report.replace.operators_replaced
    );
    println!("  {}", style("done").green());
}
