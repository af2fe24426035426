//! snipseq - Main entry point
//!
//! Operator console for snippet sequences, driving the engine with simulated
//! snippets so a sequence can be exercised without a robot.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use snippet_sequencer::cli::{Cli, Commands};
use snippet_sequencer::console::{render_event, run_console};
use snippet_sequencer::simulated::{ActivityLog, LoggingConstraint, SimulatedStep};
use snippet_sequencer::{
    ConstraintScope, EngineConfig, SequenceEngine, SequenceRegistry, TransportFlags,
};

/// Initialize logging: Info by default, RUST_LOG overrides.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Demo sequence options taken from the command line
struct DemoOptions {
    steps: usize,
    step_ms: u64,
    globals: Vec<String>,
    scoped: bool,
    transport_offline: bool,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match cli.command {
        Commands::Validate { config } => {
            info!("Validating configuration file: {:?}", config);
            match load_config(&config) {
                Ok(config) => {
                    info!("Configuration validation successful");
                    println!("✓ Configuration file is valid: {:?}", config);
                }
                Err(e) => {
                    error!("Configuration validation failed: {:#}", e);
                    eprintln!("✗ Configuration validation failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::InitConfig { path } => {
            EngineConfig::default().save_to_file(&path)?;
            println!("✓ Wrote default configuration to {:?}", path);
        }
        Commands::Run {
            config,
            steps,
            step_ms,
            progression,
            delay_ms,
            globals,
            scoped,
            transport_offline,
        } => {
            let mut engine_config = match &config {
                Some(path) => EngineConfig::load_from_file(path)?,
                None => EngineConfig::default(),
            };
            if let Err(e) = engine_config.apply_overrides(progression, delay_ms) {
                error!("Configuration validation failed: {:#}", e);
                eprintln!("✗ Configuration validation failed: {:#}", e);
                std::process::exit(1);
            }

            let options = DemoOptions {
                steps,
                step_ms,
                globals,
                scoped,
                transport_offline,
            };

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            runtime.block_on(run_demo(engine_config, options))?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let config = EngineConfig::load_from_file(path)?;
    config.validate()?;
    Ok(config)
}

async fn run_demo(config: EngineConfig, options: DemoOptions) -> Result<()> {
    let log = ActivityLog::new();
    let mut registry = SequenceRegistry::new();

    for name in &options.globals {
        registry.add_constraint(
            ConstraintScope::Global,
            Arc::new(LoggingConstraint::new(name.clone(), log.clone())),
        )?;
    }
    for n in 1..=options.steps {
        let name = format!("snippet-{}", n);
        let id = registry.push_step(Arc::new(SimulatedStep::new(
            name.clone(),
            Duration::from_millis(options.step_ms),
            log.clone(),
        )));
        if options.scoped {
            registry.add_constraint(
                ConstraintScope::Scoped(id),
                Arc::new(LoggingConstraint::new(format!("{}-zone", name), log.clone())),
            )?;
        }
    }

    let transport = if config.transport_disabled {
        TransportFlags::disabled()
    } else {
        TransportFlags::ready()
    };
    if options.transport_offline {
        transport.set_disabled(false);
        transport.set_ready(false);
    }

    let engine = SequenceEngine::spawn(registry, &config, Arc::new(transport))?;
    info!(steps = options.steps, "Demo sequence ready");

    let mut events = engine.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("· {}", render_event(&event)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let estop = engine.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCtrl-C: emergency stop");
        estop.request_emergency_stop();
    })
    .context("Failed to install Ctrl-C handler")?;

    let stdin = BufReader::new(tokio::io::stdin());
    let result = run_console(&engine, stdin).await;

    engine.shutdown().await?;
    printer.abort();
    result
}
