//! udsimd - UDS Simulator Runner
//!
//! Runs diagnostic scenarios against simulated ECUs and streams automation
//! events to stdout as JSON lines.
//!
//! Usage:
//!   udsimd [--config sim.toml] run scenario.toml
//!   udsimd exec --ecu engine_ecu 22F190
//!   udsimd key 11223344
//!
//! Without a config file the built-in defaults are used (CAN 0x7E0/0x7E8,
//! DoIP 0x0E80 -> 0x1000, every ECU answering with the generic responder).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use udsim_core::{AutomationEvent, MemoryStore, RunStatus, TransportKind, UdsServiceRequest};
use udsim_uds::uds::nrc_description;
use udsim_uds::{compute_key, AutomationEngine, ScenarioDefinition, SimulatorConfig};

#[derive(Parser)]
#[command(name = "udsimd")]
#[command(author, version, about = "UDS diagnostic simulator")]
struct Cli {
    /// Simulator config file (TOML)
    #[arg(short, long, env = "UDSIM_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON instead of text
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a scenario file and stream its events
    Run {
        /// Scenario definition (TOML)
        scenario: PathBuf,

        /// Override the scenario's retry count
        #[arg(long)]
        retries: Option<u32>,

        /// Override the run timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Send one raw request (hex, SID first) to a simulated ECU
    Exec {
        /// Target ECU
        #[arg(short, long, default_value = "engine_ecu")]
        ecu: String,

        /// Transport binding
        #[arg(short, long, default_value = "can", value_parser = parse_transport)]
        transport: TransportKind,

        /// Request bytes, e.g. `22F190` or `10 03`
        request: String,
    },

    /// Print the key for a security-access seed
    Key {
        /// Seed bytes in hex
        seed: String,
    },
}

fn parse_transport(value: &str) -> Result<TransportKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "can" => Ok(TransportKind::Can),
        "doip" => Ok(TransportKind::DoIp),
        other => Err(format!("unknown transport '{}' (expected can or doip)", other)),
    }
}

fn parse_hex(value: &str) -> Result<Vec<u8>> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).with_context(|| format!("invalid hex '{}'", value))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "udsimd=info,udsim_uds=info".into());
    // Logs go to stderr; stdout carries events
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SimulatorConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading config from: {}", path.display());
            SimulatorConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            tracing::info!("No config file provided, using defaults");
            Ok(SimulatorConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            scenario,
            retries,
            timeout_ms,
        } => {
            let config = load_config(cli.config.as_ref())?;
            run_scenario(config, scenario, retries, timeout_ms).await
        }
        Commands::Exec {
            ecu,
            transport,
            request,
        } => {
            let config = load_config(cli.config.as_ref())?;
            exec(config, &ecu, transport, &request).await
        }
        Commands::Key { seed } => {
            let seed = parse_hex(&seed)?;
            if seed.is_empty() {
                bail!("seed must not be empty");
            }
            println!("{}", hex::encode_upper(compute_key(&seed)));
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_scenario(
    config: SimulatorConfig,
    path: PathBuf,
    retries: Option<u32>,
    timeout_ms: Option<u64>,
) -> Result<ExitCode> {
    let definition = ScenarioDefinition::load(&path)
        .with_context(|| format!("loading scenario {}", path.display()))?;
    let mut command = definition.into_command()?;
    if retries.is_some() {
        command.retries = retries;
    }
    if timeout_ms.is_some() {
        command.timeout_ms = timeout_ms;
    }

    let store = Arc::new(MemoryStore::new());
    let engine = AutomationEngine::from_config(&config, store.clone(), store.clone())?
        .with_store(store.clone())
        .spawn();

    let mut events = engine.subscribe();
    let run_id = engine.run_scenario(command).await?;
    tracing::info!(run_id = %run_id, "Scenario submitted");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if event.run_id() != Some(run_id.as_str()) {
                        continue;
                    }
                    println!("{}", serde_json::to_string(&event)?);
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, cancelling run");
                if let Err(e) = engine.cancel(&run_id, "interrupted").await {
                    tracing::warn!(error = %e, "Cancel failed");
                }
            }
        }
    }

    let run = engine.wait_for_run(&run_id).await?;
    engine.shutdown().await;

    tracing::info!(
        run_id = %run_id,
        status = %run.status,
        audit_entries = store.audit_entries().len(),
        "Run finished"
    );
    Ok(match run.status {
        RunStatus::Passed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn exec(
    config: SimulatorConfig,
    ecu: &str,
    transport: TransportKind,
    raw: &str,
) -> Result<ExitCode> {
    let bytes = parse_hex(raw)?;
    let Some((&sid, data)) = bytes.split_first() else {
        bail!("request must contain at least a service id");
    };

    let store = Arc::new(MemoryStore::new());
    let engine = AutomationEngine::from_config(&config, store.clone(), store.clone())?;
    let request = UdsServiceRequest::new(sid)
        .with_data(data.to_vec())
        .with_transport(transport);

    let exchange = engine.tester().execute(ecu, &request).await?;
    if let Some(nrc) = exchange.response.nrc {
        tracing::warn!(
            nrc = format!("0x{:02X}", nrc),
            "Negative response: {}",
            nrc_description(nrc)
        );
    }
    let record = exchange.to_record(ecu, None, None);
    println!(
        "{}",
        serde_json::to_string(&AutomationEvent::TransportExchange(record))?
    );
    Ok(if exchange.response.is_positive {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
