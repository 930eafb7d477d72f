// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Behavioural board simulator for development and testing.
//!
//! Holds board state in memory and answers every operation immediately.
//! It models the lifecycle a real board goes through (power, programming,
//! initialisation, acquisition) but none of the register map.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use tpm_core::board::command::{AcquisitionParams, AntennaBufferParams, InitialiseParams};
use tpm_core::board::{Board, BoardAccessMethod, BoardFuture, BoardInfo};
use tpm_core::{BoardError, BoardResult, TelemetryField, TelemetryValue};

const STREAM_REGISTERS: [&str; 2] = [
    "fpga1.dsp_regfile.stream_status.channelizer_vld",
    "fpga2.dsp_regfile.stream_status.channelizer_vld",
];
const ADC_CHANNELS: usize = 32;
const UNSET_ID: i64 = -1;

/// Tunables for the simulated board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Bitfile loaded by `initialise` on an unprogrammed board.
    pub default_bitfile: String,
    /// Whether the FPGAs carry firmware right after power-up.
    pub start_programmed: bool,
    /// Size in bytes of the memory backing the antenna buffer.
    pub ddr_size: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            default_bitfile: "tpm_firmware.bit".to_string(),
            start_programmed: false,
            ddr_size: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct SimulatedHardware {
    config: SimulatorConfig,
    powered: bool,
    reachable: bool,
    firmware: Option<String>,
    tile_id: i64,
    station_id: i64,
    pps_delay: i64,
    acquisition_start: Option<u64>,
    antenna_buffer: Option<AntennaBufferParams>,
    registers: HashMap<String, u32>,
    memory: BTreeMap<u32, u32>,
    frame: i64,
}

impl SimulatedHardware {
    fn new(config: SimulatorConfig) -> Self {
        let mut hardware = Self {
            config,
            powered: true,
            reachable: true,
            firmware: None,
            tile_id: UNSET_ID,
            station_id: UNSET_ID,
            pps_delay: 0,
            acquisition_start: None,
            antenna_buffer: None,
            registers: HashMap::new(),
            memory: BTreeMap::new(),
            frame: 0,
        };
        hardware.power_cycle();
        hardware
    }

    /// Reset everything the FPGAs hold, as a power cycle does.
    fn power_cycle(&mut self) {
        self.firmware = None;
        if self.config.start_programmed {
            self.load_firmware(self.config.default_bitfile.clone());
        } else {
            self.clear_fpga_state();
        }
    }

    fn load_firmware(&mut self, bitfile: String) {
        self.clear_fpga_state();
        self.firmware = Some(bitfile);
    }

    fn clear_fpga_state(&mut self) {
        self.tile_id = UNSET_ID;
        self.station_id = UNSET_ID;
        self.pps_delay = 0;
        self.acquisition_start = None;
        self.antenna_buffer = None;
        self.registers.clear();
        self.memory.clear();
        self.frame = 0;
        for register in STREAM_REGISTERS {
            self.registers.insert(register.to_string(), 0);
        }
    }

    fn programmed(&self) -> bool {
        self.firmware.is_some()
    }

    fn initialised(&self) -> bool {
        self.tile_id != UNSET_ID
    }

    fn require_programmed(&self) -> BoardResult<()> {
        if self.programmed() {
            Ok(())
        } else {
            Err(BoardError::command("FPGAs are not programmed"))
        }
    }

    fn acquiring(&self) -> bool {
        self.acquisition_start.is_some()
    }

    fn board_temperature(&self) -> f64 {
        if self.programmed() {
            48.5
        } else {
            36.0
        }
    }

    fn fpga_temperatures(&self) -> Vec<f64> {
        if self.programmed() {
            vec![61.0, 62.5]
        } else {
            vec![35.0, 35.0]
        }
    }

    fn health_status(&self) -> String {
        json!({
            "temperatures": {
                "board": self.board_temperature(),
                "fpgas": self.fpga_temperatures(),
            },
            "voltages": { "board": 5.0 },
            "timing": { "pll_locked": true, "pps_present": self.initialised() },
            "dsp": { "streaming": self.acquiring() },
        })
        .to_string()
    }

    fn telemetry(&mut self, field: TelemetryField) -> BoardResult<TelemetryValue> {
        use TelemetryField::*;
        // The management CPLD answers these without firmware.
        if !matches!(
            field,
            Voltage | BoardTemperature | CheckCpldComms | IsProgrammed | HealthStatus
        ) {
            self.require_programmed()?;
        }

        let value = match field {
            Voltage => TelemetryValue::Float(5.0),
            BoardTemperature => TelemetryValue::Float(self.board_temperature()),
            CheckCpldComms => TelemetryValue::Bool(true),
            IsProgrammed => TelemetryValue::Bool(self.programmed()),
            HealthStatus => TelemetryValue::Text(self.health_status()),
            FpgaTemperatures => TelemetryValue::Floats(self.fpga_temperatures()),
            PllLocked => TelemetryValue::Bool(true),
            CspRounding => TelemetryValue::Ints(vec![2; 384]),
            ChanneliserRounding => TelemetryValue::Ints(vec![4; 512]),
            StationId => TelemetryValue::Int(self.station_id),
            TileId => TelemetryValue::Int(self.tile_id),
            AdcRms => {
                let level = if self.acquiring() { 17.5 } else { 0.0 };
                TelemetryValue::Floats(vec![level; ADC_CHANNELS])
            }
            PendingDataRequests => TelemetryValue::Bool(false),
            PpsDelay => TelemetryValue::Int(self.pps_delay),
            PpsDrift | PpsDelayCorrection | PhaseTerminalCount => TelemetryValue::Int(0),
            PpsPresent => TelemetryValue::Bool(self.initialised()),
            IsBeamformerRunning => TelemetryValue::Bool(self.acquiring()),
            FpgaReferenceTime => {
                TelemetryValue::Int(self.acquisition_start.map_or(0, |t| t as i64))
            }
            PreaduLevels => TelemetryValue::Floats(vec![16.0; ADC_CHANNELS]),
            StaticDelays => TelemetryValue::Floats(vec![0.0; ADC_CHANNELS]),
            BeamformerTable => TelemetryValue::Table(
                (0..48).map(|region| vec![region * 8, 8, 0, 0, 0, 0, 0]).collect(),
            ),
            TileBeamformerFrame => {
                if self.acquiring() {
                    self.frame += 1;
                }
                TelemetryValue::Int(self.frame)
            }
            RfiCount => TelemetryValue::Table(vec![vec![0; 2]; ADC_CHANNELS / 2]),
        };
        Ok(value)
    }
}

/// Shared handle on a simulated board's hardware.
///
/// Cloned into the [`SimulatorBoard`] and the simulated power supply so the
/// supply can power the board up and down, and used by tests to inject
/// faults.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    hardware: Arc<Mutex<SimulatedHardware>>,
}

impl SimulatorHandle {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            hardware: Arc::new(Mutex::new(SimulatedHardware::new(config))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedHardware> {
        self.hardware.lock().expect("simulator mutex poisoned")
    }

    /// Switch the board's supply. Losing power clears the FPGAs.
    pub fn set_powered(&self, powered: bool) {
        let mut hardware = self.lock();
        if hardware.powered == powered {
            return;
        }
        info!("Simulated board powered {}", if powered { "on" } else { "off" });
        hardware.powered = powered;
        hardware.power_cycle();
    }

    pub fn is_powered(&self) -> bool {
        self.lock().powered
    }

    /// Make the board stop (or resume) answering on the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn firmware(&self) -> Option<String> {
        self.lock().firmware.clone()
    }

    /// Tile and station id, or `None` until initialised.
    pub fn ids(&self) -> Option<(i64, i64)> {
        let hardware = self.lock();
        hardware
            .initialised()
            .then_some((hardware.tile_id, hardware.station_id))
    }
}

pub struct SimulatorBoard {
    info: BoardInfo,
    hardware: SimulatorHandle,
    connected: bool,
}

impl SimulatorBoard {
    pub fn new(hardware: SimulatorHandle) -> Self {
        Self {
            info: BoardInfo {
                manufacturer: "Sanitas EG".to_string(),
                model: "TPM 1.6 (simulated)".to_string(),
                revision: "1.6".to_string(),
                access: BoardAccessMethod::Simulated,
            },
            hardware,
            connected: false,
        }
    }

    /// Lock the hardware after checking the link is up.
    fn link(&self) -> BoardResult<MutexGuard<'_, SimulatedHardware>> {
        if !self.connected {
            return Err(BoardError::connectivity("not connected"));
        }
        let hardware = self.hardware.lock();
        if !hardware.powered || !hardware.reachable {
            return Err(BoardError::connectivity("no reply from board"));
        }
        Ok(hardware)
    }
}

impl Board for SimulatorBoard {
    fn info(&self) -> &BoardInfo {
        &self.info
    }

    fn connect<'a>(&'a mut self) -> BoardFuture<'a, ()> {
        Box::pin(async move {
            {
                let hardware = self.hardware.lock();
                if !hardware.powered || !hardware.reachable {
                    return Err(BoardError::connectivity("board did not answer"));
                }
            }
            self.connected = true;
            debug!("Simulator connected");
            Ok(())
        })
    }

    fn disconnect<'a>(&'a mut self) -> BoardFuture<'a, ()> {
        Box::pin(async move {
            self.connected = false;
            Ok(())
        })
    }

    fn check_communication<'a>(&'a mut self) -> BoardFuture<'a, ()> {
        Box::pin(async move { self.link().map(drop) })
    }

    fn is_programmed<'a>(&'a mut self) -> BoardFuture<'a, bool> {
        Box::pin(async move { Ok(self.link()?.programmed()) })
    }

    fn read_register<'a>(&'a mut self, name: &'a str) -> BoardFuture<'a, u32> {
        Box::pin(async move {
            let hardware = self.link()?;
            hardware.require_programmed()?;
            hardware
                .registers
                .get(name)
                .copied()
                .ok_or_else(|| BoardError::command(format!("unknown register {name}")))
        })
    }

    fn write_register<'a>(&'a mut self, name: &'a str, value: u32) -> BoardFuture<'a, ()> {
        Box::pin(async move {
            let mut hardware = self.link()?;
            hardware.require_programmed()?;
            hardware.registers.insert(name.to_string(), value);
            Ok(())
        })
    }

    fn read_address<'a>(&'a mut self, address: u32, words: usize) -> BoardFuture<'a, Vec<u32>> {
        Box::pin(async move {
            let hardware = self.link()?;
            Ok((0..words as u32)
                .map(|offset| {
                    hardware
                        .memory
                        .get(&address.wrapping_add(offset * 4))
                        .copied()
                        .unwrap_or(0)
                })
                .collect())
        })
    }

    fn write_address<'a>(&'a mut self, address: u32, values: &'a [u32]) -> BoardFuture<'a, ()> {
        Box::pin(async move {
            let mut hardware = self.link()?;
            for (offset, value) in values.iter().enumerate() {
                hardware
                    .memory
                    .insert(address.wrapping_add(offset as u32 * 4), *value);
            }
            Ok(())
        })
    }

    fn read_telemetry<'a>(&'a mut self, field: TelemetryField) -> BoardFuture<'a, TelemetryValue> {
        Box::pin(async move { self.link()?.telemetry(field) })
    }

    fn initialise<'a>(&'a mut self, params: &'a InitialiseParams) -> BoardFuture<'a, ()> {
        Box::pin(async move {
            let mut hardware = self.link()?;
            if !hardware.programmed() {
                let bitfile = hardware.config.default_bitfile.clone();
                info!("Programming default firmware {}", bitfile);
                hardware.load_firmware(bitfile);
            }
            hardware.acquisition_start = None;
            hardware.antenna_buffer = None;
            for register in STREAM_REGISTERS {
                hardware.registers.insert(register.to_string(), 0);
            }
            hardware.tile_id = i64::from(params.tile_id);
            hardware.station_id = i64::from(params.station_id);
            hardware.pps_delay = i64::from(params.pps_delay);
            Ok(())
        })
    }

    fn download_firmware<'a>(&'a mut self, bitfile: &'a str) -> BoardFuture<'a, ()> {
        Box::pin(async move {
            let mut hardware = self.link()?;
            if !bitfile.ends_with(".bit") {
                return Err(BoardError::command(format!("{bitfile} is not a bitfile")));
            }
            hardware.load_firmware(bitfile.to_string());
            Ok(())
        })
    }

    fn start_acquisition<'a>(&'a mut self, params: &'a AcquisitionParams) -> BoardFuture<'a, ()> {
        Box::pin(async move {
            let mut hardware = self.link()?;
            hardware.require_programmed()?;
            if !hardware.initialised() {
                return Err(BoardError::command("board is not initialised"));
            }
            let start = params.start_time.unwrap_or_else(unix_now) + u64::from(params.delay);
            hardware.acquisition_start = Some(start);
            for register in STREAM_REGISTERS {
                hardware.registers.insert(register.to_string(), 1);
            }
            Ok(())
        })
    }

    fn start_antenna_buffer<'a>(
        &'a mut self,
        params: &'a AntennaBufferParams,
    ) -> BoardFuture<'a, ()> {
        Box::pin(async move {
            let mut hardware = self.link()?;
            hardware.require_programmed()?;
            let end = u64::from(params.start_address) + u64::from(params.max_size);
            if end > u64::from(hardware.config.ddr_size) {
                return Err(BoardError::command(format!(
                    "antenna buffer ends at {end:#x}, past the end of DDR"
                )));
            }
            hardware.antenna_buffer = Some(params.clone());
            Ok(())
        })
    }

    fn read_antenna_buffer<'a>(&'a mut self) -> BoardFuture<'a, usize> {
        Box::pin(async move {
            let mut hardware = self.link()?;
            let params = hardware
                .antenna_buffer
                .take()
                .ok_or_else(|| BoardError::command("antenna buffer was not started"))?;
            // Two bytes per sample, split across the selected antennas.
            Ok(params.max_size as usize / 2)
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
