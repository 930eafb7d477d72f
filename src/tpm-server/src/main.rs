// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;
mod listener;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tpm_app::{init_logging, normalize_name, ConfigFile};
use tpm_backend::{
    register_builtin_backends_on, BoardAccess, RegistrationContext, SimulatedPowerSupply,
    SimulatorHandle, SupplyEvent,
};
use tpm_core::{BoardManager, DynResult};

use config::{InitialTarget, ServerConfig};
use listener::LoggingListener;

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - TPM board driver daemon");
const SIMULATOR_BACKEND: &str = "simulator";

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Board backend to use (e.g. simulator)
    #[arg(short = 'b', long = "backend")]
    backend: Option<String>,
    /// Tile id the board is initialised with
    #[arg(short = 't', long = "tile-id")]
    tile_id: Option<u32>,
    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

/// Resolved configuration after merging config file and CLI arguments.
struct ResolvedConfig {
    backend: String,
    access: BoardAccess,
    hardware: Option<SimulatorHandle>,
}

/// Fold CLI overrides into the loaded config.
fn apply_cli_overrides(cli: &Cli, cfg: &mut ServerConfig) {
    if let Some(backend) = &cli.backend {
        cfg.board.backend = Some(backend.clone());
    }
    if let Some(tile_id) = cli.tile_id {
        cfg.board.tile_id = tile_id;
    }
    if let Some(level) = &cli.log_level {
        cfg.general.log_level = Some(level.clone());
    }
}

fn resolve_config(cfg: &ServerConfig, registry: &RegistrationContext) -> DynResult<ResolvedConfig> {
    let backend = match cfg.board.backend.as_deref() {
        Some(name) => normalize_name(name),
        None => {
            return Err(
                "Board backend not specified. Use --backend or set [board].backend in config."
                    .into(),
            )
        }
    };
    if !registry.is_backend_registered(&backend) {
        return Err(format!(
            "Unknown board backend: {} (available: {})",
            backend,
            registry.registered_backends().join(", ")
        )
        .into());
    }

    if backend == SIMULATOR_BACKEND {
        let hardware = SimulatorHandle::new(cfg.simulator.clone());
        return Ok(ResolvedConfig {
            backend,
            access: BoardAccess::Simulated {
                hardware: hardware.clone(),
            },
            hardware: Some(hardware),
        });
    }

    let host = cfg
        .board
        .host
        .clone()
        .ok_or("Network access requires [board].host in config.")?;
    Ok(ResolvedConfig {
        backend,
        access: BoardAccess::Udp {
            host,
            port: cfg.board.port,
        },
        hardware: None,
    })
}

fn apply_target(manager: &BoardManager, target: InitialTarget) {
    match target {
        InitialTarget::Offline => manager.desire_offline(),
        InitialTarget::Online => manager.desire_online(),
        InitialTarget::On => manager.desire_on(),
        InitialTarget::Off => manager.desire_off(),
        InitialTarget::Standby => manager.desire_standby(),
    }
}

/// Deliver supply events for `slot` to the board manager.
fn spawn_supply_forwarder(
    mut events: mpsc::UnboundedReceiver<SupplyEvent>,
    slot: u8,
    manager: Arc<BoardManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SupplyEvent::Communication(status) => manager.on_supply_communication(status),
                SupplyEvent::Power { slot: s, power } if s == slot => manager.on_board_power(power),
                SupplyEvent::Power { .. } => {}
            }
        }
    })
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let mut registry = RegistrationContext::new();
    register_builtin_backends_on(&mut registry);

    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_combined_toml());
        return Ok(());
    }

    let (mut cfg, config_path) = if let Some(ref path) = cli.config {
        let cfg = ServerConfig::load_from_file(path)?;
        (cfg, Some(path.clone()))
    } else {
        ServerConfig::load_from_default_paths()?
    };
    apply_cli_overrides(&cli, &mut cfg);
    cfg.validate()
        .map_err(|e| format!("Invalid server configuration: {}", e))?;

    init_logging(cfg.general.log_level.as_deref());

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let resolved = resolve_config(&cfg, &registry)?;
    match &resolved.access {
        BoardAccess::Udp { host, port } => info!(
            "Starting tpm-server {} (backend: {}, access: udp {}:{})",
            env!("CARGO_PKG_VERSION"),
            resolved.backend,
            host,
            port
        ),
        BoardAccess::Simulated { .. } => info!(
            "Starting tpm-server {} (backend: {}, access: simulated)",
            env!("CARGO_PKG_VERSION"),
            resolved.backend
        ),
    }
    info!(
        "Tile {} of station {}, supply slot {}",
        cfg.board.tile_id, cfg.board.station_id, cfg.board.subrack_slot
    );

    let board = registry.build_board(&resolved.backend, resolved.access.clone())?;

    let slot = cfg.board.subrack_slot;
    let (supply, supply_events) = SimulatedPowerSupply::new();
    match resolved.hardware {
        Some(hardware) => supply.attach(slot, hardware),
        None => warn!("No power supply driver for this backend; board power stays unknown"),
    }

    let manager = Arc::new(BoardManager::new(
        board,
        Arc::new(supply),
        slot,
        cfg.engine_config(),
    ));
    manager.register_listener(Arc::new(LoggingListener::new(cfg.board.tile_id)));
    let forwarder = spawn_supply_forwarder(supply_events, slot, manager.clone());

    apply_target(&manager, cfg.board.initial_target);

    signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    manager.shutdown().await;
    forwarder.abort();
    let _ = forwarder.await;
    Ok(())
}
