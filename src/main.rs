use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use nano_cb::{
    compare_results, run_static_batch, DecodeScheduler, FinishReason, GenerationResult,
    ModelConfig, Request, SchedulerConfig, TinyLm,
};

#[derive(Parser, Debug)]
#[command(name = "nano-cb")]
#[command(about = "Continuous batching decode scheduler demo")]
struct Args {
    /// Scheduler configuration as JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of cache slots (overrides the config file)
    #[arg(long)]
    slots: Option<usize>,

    /// Decode step limit per request (overrides the config file)
    #[arg(long)]
    max_decode_steps: Option<usize>,

    /// Prompt as whitespace-separated token ids; repeat for more requests
    #[arg(short, long = "prompt", required = true)]
    prompts: Vec<String>,

    /// Re-run the prompts with static batching and report divergence
    #[arg(long)]
    compare_static: bool,

    /// Seed for the reference model weights
    #[arg(long, default_value = "1234")]
    seed: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> nano_cb::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_json_file(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(slots) = args.slots {
        config.num_cache_slots = slots;
        if config.batch_size_buckets.last().is_some_and(|&b| b < slots) {
            config.batch_size_buckets.push(slots);
        }
    }
    if let Some(steps) = args.max_decode_steps {
        config.max_decode_steps = steps;
    }
    config.validate()?;

    let requests = args
        .prompts
        .iter()
        .enumerate()
        .map(|(i, p)| -> nano_cb::Result<Request> {
            Ok(Request::new(i as u64, parse_prompt(p)?, config.max_decode_steps))
        })
        .collect::<nano_cb::Result<Vec<_>>>()?;

    let model_config = ModelConfig {
        num_cache_slots: config.num_cache_slots,
        eos_ids: config.eos_ids.clone(),
        seed: args.seed,
        ..Default::default()
    };
    let model = TinyLm::new(model_config, &Device::Cpu)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        requests = requests.len(),
        slots = config.num_cache_slots,
        "starting"
    );

    let mut scheduler = DecodeScheduler::new(config.clone(), &model)?;
    for request in requests.iter().cloned() {
        scheduler.submit(request)?;
    }
    let mut results: Vec<GenerationResult> = Vec::new();
    scheduler.run_until_idle(&mut results)?;
    results.sort_by_key(|r| r.request_id);

    for result in &results {
        println!(
            "request {}: {:?} ({:?})",
            result.request_id, result.tokens, result.finish_reason
        );
    }
    let stats = scheduler.stats();
    println!(
        "ticks={} prefill_calls={} decode_calls={} completed={}",
        stats.ticks, stats.prefill_calls, stats.decode_calls, stats.completed
    );

    let failed = results
        .iter()
        .filter(|r| r.finish_reason == FinishReason::Failed)
        .count();
    if failed > 0 {
        warn!(failed, "requests failed, see the log for the compute errors");
        std::process::exit(1);
    }

    if args.compare_static {
        let reference = run_static_batch(&model, &config, &requests)?;
        let divergences = compare_results(&results, &reference);
        if divergences.is_empty() {
            println!("static batching agrees on all {} requests", reference.len());
        } else {
            warn!(count = divergences.len(), "continuous and static batching disagree");
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_prompt(prompt: &str) -> nano_cb::Result<Vec<u32>> {
    prompt
        .split_whitespace()
        .map(|t| {
            t.parse::<u32>()
                .map_err(|e| nano_cb::Error::Config(format!("bad token id {t:?}: {e}")))
        })
        .collect()
}
