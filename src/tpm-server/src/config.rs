// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for tpm-server.
//!
//! Config is loaded from the `[tpm-server]` section of `tpm-rs.toml`.
//! Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./tpm-rs.toml`
//! 3. `~/.config/tpm-rs/tpm-rs.toml`
//! 4. `/etc/tpm-rs/tpm-rs.toml`

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tpm_app::ConfigFile;
use tpm_backend::SimulatorConfig;
use tpm_core::board::controller::{EngineConfig, FixedDelay, TieredPolling};

/// Top-level server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Board backend and identity
    pub board: BoardConfig,
    /// Polling, retry and locking behavior
    pub behavior: BehaviorConfig,
    /// Simulated board (only used with backend = "simulator")
    pub simulator: SimulatorConfig,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

/// Target the board is driven to at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialTarget {
    Offline,
    #[default]
    Online,
    On,
    Off,
    Standby,
}

/// Board backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Backend name (e.g. "simulator")
    pub backend: Option<String>,
    /// Board host address (for network access)
    pub host: Option<String>,
    /// Board UDP port (for network access)
    pub port: u16,
    /// Tile id this board is initialised with
    pub tile_id: u32,
    /// Station id this board is initialised with
    pub station_id: u32,
    /// Power supply slot feeding the board
    pub subrack_slot: u8,
    /// Registers that flag a valid data stream on each FPGA
    pub stream_status_registers: [String; 2],
    /// Target requested right after startup
    pub initial_target: InitialTarget,
}

impl Default for BoardConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            backend: None,
            host: None,
            port: 10000,
            tile_id: engine.tile_id,
            station_id: engine.station_id,
            subrack_slot: 1,
            stream_status_registers: engine.stream_status_registers,
            initial_target: InitialTarget::default(),
        }
    }
}

/// Behavior configuration for polling, retries and locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Poll loop interval in milliseconds
    pub poll_interval_ms: u64,
    /// Refresh interval of the medium telemetry tier in milliseconds
    pub medium_interval_ms: u64,
    /// Refresh interval of the slow telemetry tier in milliseconds
    pub slow_interval_ms: u64,
    /// Bounded wait for the hardware lock in milliseconds
    pub lock_timeout_ms: u64,
    /// Connection attempts before cooling down
    pub connect_attempts: u32,
    /// Pause between connection attempts in milliseconds
    pub connect_delay_ms: u64,
    /// Pause after the attempts are exhausted in milliseconds
    pub connect_cooldown_ms: u64,
    /// Time a queued command may wait before it is aborted, in milliseconds
    pub command_timeout_ms: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            medium_interval_ms: 5_000,
            slow_interval_ms: 30_000,
            lock_timeout_ms: 200,
            connect_attempts: 5,
            connect_delay_ms: 500,
            connect_cooldown_ms: 10_000,
            command_timeout_ms: 60_000,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration and return a descriptive error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;

        if let Some(backend) = &self.board.backend {
            if backend.trim().is_empty() {
                return Err("[board].backend must not be empty".to_string());
            }
        }
        if let Some(host) = &self.board.host {
            if host.trim().is_empty() {
                return Err("[board].host must not be empty".to_string());
            }
            if self.board.port == 0 {
                return Err("[board].port must be > 0 when [board].host is set".to_string());
            }
        }
        if self.board.subrack_slot == 0 {
            return Err("[board].subrack_slot must be > 0".to_string());
        }
        if self
            .board
            .stream_status_registers
            .iter()
            .any(|r| r.trim().is_empty())
        {
            return Err("[board].stream_status_registers must not contain empty names".to_string());
        }

        let behavior = &self.behavior;
        if behavior.poll_interval_ms == 0 {
            return Err("[behavior].poll_interval_ms must be > 0".to_string());
        }
        if behavior.medium_interval_ms < behavior.poll_interval_ms {
            return Err(
                "[behavior].medium_interval_ms must be >= [behavior].poll_interval_ms".to_string(),
            );
        }
        if behavior.slow_interval_ms < behavior.medium_interval_ms {
            return Err(
                "[behavior].slow_interval_ms must be >= [behavior].medium_interval_ms".to_string(),
            );
        }
        if behavior.lock_timeout_ms == 0 {
            return Err("[behavior].lock_timeout_ms must be > 0".to_string());
        }
        if behavior.connect_attempts == 0 {
            return Err("[behavior].connect_attempts must be > 0".to_string());
        }
        if behavior.command_timeout_ms == 0 {
            return Err("[behavior].command_timeout_ms must be > 0".to_string());
        }

        if self.simulator.default_bitfile.trim().is_empty() {
            return Err("[simulator].default_bitfile must not be empty".to_string());
        }
        Ok(())
    }

    /// Engine settings for the configured board.
    pub fn engine_config(&self) -> EngineConfig {
        let behavior = &self.behavior;
        EngineConfig {
            polling: TieredPolling::new(
                Duration::from_millis(behavior.poll_interval_ms),
                Duration::from_millis(behavior.medium_interval_ms),
                Duration::from_millis(behavior.slow_interval_ms),
            ),
            retry: FixedDelay::new(
                behavior.connect_attempts,
                Duration::from_millis(behavior.connect_delay_ms),
                Duration::from_millis(behavior.connect_cooldown_ms),
            ),
            lock_timeout: Duration::from_millis(behavior.lock_timeout_ms),
            command_timeout: Duration::from_millis(behavior.command_timeout_ms),
            tile_id: self.board.tile_id,
            station_id: self.board.station_id,
            stream_status_registers: self.board.stream_status_registers.clone(),
        }
    }

    /// Generate an example configuration wrapped under the `[tpm-server]`
    /// section header, suitable for use in a combined `tpm-rs.toml` file.
    pub fn example_combined_toml() -> String {
        #[derive(serde::Serialize)]
        struct Wrapper {
            #[serde(rename = "tpm-server")]
            inner: ServerConfig,
        }
        let example = ServerConfig {
            general: GeneralConfig {
                log_level: Some("info".to_string()),
            },
            board: BoardConfig {
                backend: Some("simulator".to_string()),
                tile_id: 1,
                station_id: 1,
                initial_target: InitialTarget::On,
                ..BoardConfig::default()
            },
            behavior: BehaviorConfig::default(),
            simulator: SimulatorConfig::default(),
        };
        toml::to_string_pretty(&Wrapper { inner: example }).unwrap_or_default()
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    if let Some(level) = level {
        match level {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(format!(
                    "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
                    level
                ))
            }
        }
    }
    Ok(())
}

impl ConfigFile for ServerConfig {
    fn section_key() -> &'static str {
        "tpm-server"
    }
}
