use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use livetap_core::{
    AnalysisConfig, ChannelFilter, Event, EventBus, Pipeline, ShutdownMode, Signal, ToneGenerator,
};
use tracing_subscriber::EnvFilter;

fn main() -> livetap_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            buffers,
            frequency,
        } => run(config.as_deref(), buffers, frequency),
        Commands::Topology { config } => print_topology(config.as_deref()),
    }
}

fn run(config: Option<&Path>, buffers: usize, frequency: f32) -> livetap_core::Result<()> {
    let config = load_config(config)?;
    tracing::info!(
        channels = config.channels,
        sampling_rate = config.sampling_rate,
        buffers,
        frequency,
        "starting pipeline"
    );

    let bus = EventBus::new();
    for signal in Signal::ALL {
        bus.subscribe(signal, ChannelFilter::Any, log_event)?;
    }

    let pipeline = Pipeline::build(&config, bus)?;
    let mut tone = ToneGenerator::new(config.sampling_rate, config.channels, frequency);
    for _ in 0..buffers {
        pipeline.push(tone.next_buffer(config.frames_per_buffer)?)?;
    }

    let report = pipeline.shutdown(ShutdownMode::Drain);
    tracing::info!(report = %serde_json::to_string(&report)?, "shutdown complete");
    Ok(())
}

fn print_topology(config: Option<&Path>) -> livetap_core::Result<()> {
    let config = load_config(config)?;
    let topology = livetap_core::build(&config)?;
    print!("{}", topology.shape());
    Ok(())
}

fn load_config(path: Option<&Path>) -> livetap_core::Result<AnalysisConfig> {
    match path {
        Some(path) => AnalysisConfig::load(path),
        None => Ok(AnalysisConfig::default()),
    }
}

fn log_event(event: &Event) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!(target: "livetap::events", "{json}"),
        Err(err) => tracing::warn!(error = %err, signal = %event.signal, "unable to encode event"),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time multi-channel audio analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a generated tone through the analysis pipeline and log every event.
    Run {
        /// JSON analysis configuration; defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of buffers to push before shutting down.
        #[arg(short, long, default_value_t = 16)]
        buffers: usize,
        /// Base tone in Hz. Channel `n` plays `frequency * (n + 1)`.
        #[arg(short, long, default_value_t = 440.0)]
        frequency: f32,
    },
    /// Print the node tree the configuration produces.
    Topology {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
