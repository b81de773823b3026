use anyhow::{Context, Result};
use audiopipe::builder::PipelineBuilder;
use audiopipe::config::EngineConfig;
use audiopipe::live::{LivePipeline, PipelineRegistry};
use audiopipe::services::Services;
use clap::Parser;
use std::path::PathBuf;

/// Streaming audio pipeline engine
#[derive(Parser, Debug)]
#[command(name = "audiopipe", version, about = "Streaming audio pipeline engine")]
struct Cli {
    /// Pipeline description, e.g. "file:in.wav | gain:0.5 | file:out.wav".
    /// Repeat to run several pipelines concurrently.
    #[arg(long = "pipe", value_name = "DSL", required = true)]
    pipes: Vec<String>,

    /// Path to a TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    // Speech services are wired by embedding applications; the bare CLI
    // runs transport and transform elements only.
    let builder = PipelineBuilder::new(Services::default())
        .with_default_rate(config.sample_rate)
        .with_frame_ms(config.mixer_frame_ms);
    let registry = PipelineRegistry::new();

    let mut workers = Vec::new();
    for (i, dsl) in cli.pipes.iter().enumerate() {
        let built = builder
            .build(dsl)
            .with_context(|| format!("building pipeline '{dsl}'"))?;
        let pipeline = LivePipeline::new(format!("pipe-{i}"), dsl.clone(), built);
        registry.register(pipeline.clone());
        workers.push(pipeline.start());
    }

    for worker in workers {
        if worker.join().is_err() {
            anyhow::bail!("pipeline worker panicked");
        }
    }
    Ok(())
}
