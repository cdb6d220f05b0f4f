//! Agora - coordination runtime for autonomous agents
//!
//! Main entry point for the Agora CLI.

use agora::config::{validate_config, SimulationConfig};
use agora::engine::EngineEvent;
use agora::storage::JsonlStore;
use agora::{AgoraError, SimulationContext};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

/// Agora - run agent swarms over a sealed, rate-limited message bus
#[derive(Parser, Debug)]
#[command(name = "agora")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/agora/config.yaml)
    #[arg(short, long, env = "AGORA_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a sample configuration
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration
    Validate,

    /// Run a batch of rounds and print the metrics snapshot as JSON
    Run {
        /// Number of rounds
        #[arg(short, long, default_value_t = 10)]
        steps: u64,

        /// Restore agent state from this JSONL file before running
        #[arg(long)]
        load: Option<PathBuf>,

        /// Save agent state to this JSONL file afterwards
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Run rounds on a timer until Ctrl-C
    Realtime {
        /// Tick interval in milliseconds (default: engine.tick_interval_ms)
        #[arg(short, long)]
        interval_ms: Option<u64>,

        /// Stop after this many rounds
        #[arg(short, long)]
        max_rounds: Option<u64>,
    },

    /// Run a batch of rounds and print Prometheus metrics
    Metrics {
        /// Number of rounds
        #[arg(short, long, default_value_t = 10)]
        steps: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = if cli.verbose {
        agora::logging::init_with_level("debug")
    } else {
        agora::logging::init()
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> agora::Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(SimulationConfig::default_path);

    match cli.command {
        Commands::Init { force } => handle_init(&config_path, force),
        Commands::Validate => handle_validate(&config_path),
        Commands::Run { steps, load, save } => {
            let mut context = build_context(&config_path).await?;
            if let Some(path) = load {
                let restored = context.load_state(&JsonlStore::new(path))?;
                tracing::info!(restored, "Agent state loaded");
            }

            context.engine_mut().run(steps).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&context.engine().metrics())?
            );

            if let Some(path) = save {
                let saved = context.save_state(&JsonlStore::new(&path))?;
                eprintln!("Saved {} agent records to {}", saved, path.display());
            }
            Ok(())
        }
        Commands::Realtime {
            interval_ms,
            max_rounds,
        } => handle_realtime(&config_path, interval_ms, max_rounds).await,
        Commands::Metrics { steps } => {
            let mut context = build_context(&config_path).await?;
            context.engine_mut().run(steps).await?;
            let text = context
                .engine()
                .telemetry()
                .encode()
                .map_err(|e| AgoraError::Other(format!("Failed to encode metrics: {}", e)))?;
            print!("{}", text);
            Ok(())
        }
    }
}

fn handle_init(config_path: &Path, force: bool) -> agora::Result<()> {
    if config_path.exists() && !force {
        println!("Configuration already exists at {}", config_path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    let config = SimulationConfig::sample();
    config.save(config_path)?;

    println!("✓ Created configuration at {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  agora validate");
    println!("  agora run --steps 10");
    println!("  agora realtime --interval-ms 500");
    Ok(())
}

fn handle_validate(config_path: &Path) -> agora::Result<()> {
    let config = load_config(config_path)?;
    match validate_config(&config) {
        Ok(()) => {
            println!(
                "✓ {} is valid ({} agents, {} swarms)",
                config_path.display(),
                config.agents.len(),
                config.swarms.len()
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                println!("  - {}", error);
            }
            Err(AgoraError::Config(format!(
                "{} validation error(s) in {}",
                errors.len(),
                config_path.display()
            )))
        }
    }
}

async fn handle_realtime(
    config_path: &Path,
    interval_ms: Option<u64>,
    max_rounds: Option<u64>,
) -> agora::Result<()> {
    let mut context = build_context(config_path).await?;
    let interval = interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| context.engine().config().tick_interval());

    let handle = context.engine().handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping engine");
            handle.stop();
        }
    });

    let mut events = context.engine().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::RoundCompleted {
                    round,
                    duration,
                    decisions,
                    failures,
                } => eprintln!(
                    "round {:>5}  {:>4} decisions  {:>3} failures  {:?}",
                    round, decisions, failures, duration
                ),
                EngineEvent::Stopped { .. } => break,
                _ => {}
            }
        }
    });

    let summary = context
        .engine_mut()
        .start_real_time_simulation(interval, max_rounds)
        .await?;
    printer.abort();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&context.engine().metrics())?
    );
    Ok(())
}

fn load_config(config_path: &Path) -> agora::Result<SimulationConfig> {
    if !config_path.exists() {
        return Err(AgoraError::Config(format!(
            "Config file not found: {} (run `agora init` first)",
            config_path.display()
        )));
    }
    SimulationConfig::load(config_path)
}

async fn build_context(config_path: &Path) -> agora::Result<SimulationContext> {
    let config = load_config(config_path)?;
    SimulationContext::from_config(config).await
}
