// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Command handlers for board operations.
//!
//! Each command is its own struct carrying validation and execution logic.
//! The engine validates against the current status before running a command
//! and runs it with the board's hardware lock held.

use std::fmt::Debug;

use crate::board::command::{
    AcquisitionParams, AntennaBufferParams, CommandCategory, InitialiseParams,
};
use crate::board::status::TpmStatus;
use crate::board::{Board, BoardFuture};

/// Result of command validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Command can be executed.
    Ok,
    /// Command cannot be executed due to current status.
    InvalidState(String),
    /// Command parameters are invalid.
    InvalidParams(String),
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// A long-running board command.
pub trait CommandHandler: Debug + Send + Sync {
    /// Human-readable name of the command.
    fn name(&self) -> &'static str;

    fn category(&self) -> CommandCategory;

    /// Check parameters only; used when the command is submitted.
    fn validate_params(&self) -> ValidationResult {
        ValidationResult::Ok
    }

    /// Check whether the command can run with the board in `status`.
    fn can_execute(&self, status: TpmStatus) -> ValidationResult;

    /// Run the command. Returns an optional completion message.
    fn execute<'a>(&'a self, board: &'a mut dyn Board) -> BoardFuture<'a, Option<String>>;
}

// ============================================================================
// Concrete Command Implementations
// ============================================================================

/// Bring the board to a known configuration and stamp it with our tile and
/// station ids, programming the default firmware first if needed.
#[derive(Debug, Clone)]
pub struct InitialiseCommand {
    pub params: InitialiseParams,
}

impl InitialiseCommand {
    pub fn new(params: InitialiseParams) -> Self {
        Self { params }
    }
}

impl CommandHandler for InitialiseCommand {
    fn name(&self) -> &'static str {
        "Initialise"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Initialise
    }

    fn can_execute(&self, status: TpmStatus) -> ValidationResult {
        if !status.is_connected() {
            return ValidationResult::InvalidState(format!("board is {status}"));
        }
        ValidationResult::Ok
    }

    fn execute<'a>(&'a self, board: &'a mut dyn Board) -> BoardFuture<'a, Option<String>> {
        Box::pin(async move {
            board.initialise(&self.params).await?;
            Ok(Some(format!(
                "initialised as tile {} of station {}",
                self.params.tile_id, self.params.station_id
            )))
        })
    }
}

/// Load a firmware bitfile onto the FPGAs.
#[derive(Debug, Clone)]
pub struct DownloadFirmwareCommand {
    pub bitfile: String,
}

impl DownloadFirmwareCommand {
    pub fn new(bitfile: impl Into<String>) -> Self {
        Self {
            bitfile: bitfile.into(),
        }
    }
}

impl CommandHandler for DownloadFirmwareCommand {
    fn name(&self) -> &'static str {
        "DownloadFirmware"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::DownloadFirmware
    }

    fn validate_params(&self) -> ValidationResult {
        if self.bitfile.trim().is_empty() {
            return ValidationResult::InvalidParams("bitfile path is empty".into());
        }
        ValidationResult::Ok
    }

    fn can_execute(&self, status: TpmStatus) -> ValidationResult {
        if !status.is_connected() {
            return ValidationResult::InvalidState(format!("board is {status}"));
        }
        ValidationResult::Ok
    }

    fn execute<'a>(&'a self, board: &'a mut dyn Board) -> BoardFuture<'a, Option<String>> {
        Box::pin(async move {
            board.download_firmware(&self.bitfile).await?;
            Ok(Some(format!("downloaded {}", self.bitfile)))
        })
    }
}

/// Start the synchronised data acquisition.
#[derive(Debug, Clone)]
pub struct StartAcquisitionCommand {
    pub params: AcquisitionParams,
}

impl StartAcquisitionCommand {
    pub fn new(params: AcquisitionParams) -> Self {
        Self { params }
    }
}

impl CommandHandler for StartAcquisitionCommand {
    fn name(&self) -> &'static str {
        "StartAcquisition"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::StartAcquisition
    }

    fn can_execute(&self, status: TpmStatus) -> ValidationResult {
        if !status.is_initialised() {
            return ValidationResult::InvalidState(format!(
                "acquisition needs an initialised board, board is {status}"
            ));
        }
        ValidationResult::Ok
    }

    fn execute<'a>(&'a self, board: &'a mut dyn Board) -> BoardFuture<'a, Option<String>> {
        Box::pin(async move {
            board.start_acquisition(&self.params).await?;
            Ok(None)
        })
    }
}

/// Arm the antenna buffer for the given antennas.
#[derive(Debug, Clone)]
pub struct StartAntennaBufferCommand {
    pub params: AntennaBufferParams,
}

impl StartAntennaBufferCommand {
    pub fn new(params: AntennaBufferParams) -> Self {
        Self { params }
    }
}

impl CommandHandler for StartAntennaBufferCommand {
    fn name(&self) -> &'static str {
        "StartAntennaBuffer"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::StartAntennaBuffer
    }

    fn validate_params(&self) -> ValidationResult {
        if self.params.antennas.is_empty() {
            return ValidationResult::InvalidParams("no antennas selected".into());
        }
        if self.params.max_size == 0 {
            return ValidationResult::InvalidParams("buffer size cannot be 0".into());
        }
        ValidationResult::Ok
    }

    fn can_execute(&self, status: TpmStatus) -> ValidationResult {
        if !status.is_initialised() {
            return ValidationResult::InvalidState(format!("board is {status}"));
        }
        ValidationResult::Ok
    }

    fn execute<'a>(&'a self, board: &'a mut dyn Board) -> BoardFuture<'a, Option<String>> {
        Box::pin(async move {
            board.start_antenna_buffer(&self.params).await?;
            Ok(None)
        })
    }
}

/// Read the previously armed antenna buffer back.
#[derive(Debug, Clone, Default)]
pub struct ReadAntennaBufferCommand;

impl CommandHandler for ReadAntennaBufferCommand {
    fn name(&self) -> &'static str {
        "ReadAntennaBuffer"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::ReadAntennaBuffer
    }

    fn can_execute(&self, status: TpmStatus) -> ValidationResult {
        if !status.is_initialised() {
            return ValidationResult::InvalidState(format!("board is {status}"));
        }
        ValidationResult::Ok
    }

    fn execute<'a>(&'a self, board: &'a mut dyn Board) -> BoardFuture<'a, Option<String>> {
        Box::pin(async move {
            let samples = board.read_antenna_buffer().await?;
            Ok(Some(format!("read {samples} samples")))
        })
    }
}

/// Command requests as they arrive from callers.
#[derive(Debug, Clone)]
pub enum BoardCommand {
    Initialise(InitialiseParams),
    DownloadFirmware(String),
    StartAcquisition(AcquisitionParams),
    StartAntennaBuffer(AntennaBufferParams),
    ReadAntennaBuffer,
}

/// Convert a [`BoardCommand`] into its handler.
pub fn command_from_board_command(cmd: BoardCommand) -> Box<dyn CommandHandler> {
    match cmd {
        BoardCommand::Initialise(params) => Box::new(InitialiseCommand::new(params)),
        BoardCommand::DownloadFirmware(bitfile) => Box::new(DownloadFirmwareCommand::new(bitfile)),
        BoardCommand::StartAcquisition(params) => Box::new(StartAcquisitionCommand::new(params)),
        BoardCommand::StartAntennaBuffer(params) => {
            Box::new(StartAntennaBufferCommand::new(params))
        }
        BoardCommand::ReadAntennaBuffer => Box::new(ReadAntennaBufferCommand),
    }
}
