// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

pub mod command;
pub mod controller;
pub mod error;
pub mod lock;
pub mod manager;
pub mod power;
pub mod status;
pub mod telemetry;

use command::{AcquisitionParams, AntennaBufferParams, InitialiseParams};
use error::{BoardError, BoardResult};
use telemetry::{TelemetryField, TelemetryValue};

/// Alias to reduce type complexity in [`Board`].
pub type BoardFuture<'a, T> = Pin<Box<dyn Future<Output = BoardResult<T>> + Send + 'a>>;

fn not_supported<'a, T: Send + 'a>(operation: &'static str) -> BoardFuture<'a, T> {
    Box::pin(std::future::ready(Err(BoardError::not_supported(operation))))
}

/// How this backend reaches the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardAccessMethod {
    Udp { host: String, port: u16 },
    Simulated,
}

/// Static info describing a board backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardInfo {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    pub access: BoardAccessMethod,
}

/// Hardware capability the engine drives.
///
/// Implementations are the hardware driver and the simulator; the engine
/// only ever talks to this trait and always holds the board's
/// [`lock::HardwareLock`] while a future returned from here is running.
pub trait Board: Send {
    fn info(&self) -> &BoardInfo;

    /// Open the link to the board.
    fn connect<'a>(&'a mut self) -> BoardFuture<'a, ()>;

    /// Close the link. Must be safe to call when not connected.
    fn disconnect<'a>(&'a mut self) -> BoardFuture<'a, ()>;

    /// Cheap liveness probe of the management CPLD.
    fn check_communication<'a>(&'a mut self) -> BoardFuture<'a, ()>;

    /// Whether both FPGAs carry firmware.
    fn is_programmed<'a>(&'a mut self) -> BoardFuture<'a, bool>;

    fn read_register<'a>(&'a mut self, name: &'a str) -> BoardFuture<'a, u32>;

    fn write_register<'a>(&'a mut self, name: &'a str, value: u32) -> BoardFuture<'a, ()>;

    fn read_address<'a>(&'a mut self, address: u32, words: usize) -> BoardFuture<'a, Vec<u32>>;

    fn write_address<'a>(&'a mut self, address: u32, values: &'a [u32]) -> BoardFuture<'a, ()>;

    /// Read one telemetry quantity.
    fn read_telemetry<'a>(&'a mut self, field: TelemetryField) -> BoardFuture<'a, TelemetryValue>;

    fn initialise<'a>(&'a mut self, _params: &'a InitialiseParams) -> BoardFuture<'a, ()> {
        not_supported("initialise")
    }

    fn download_firmware<'a>(&'a mut self, _bitfile: &'a str) -> BoardFuture<'a, ()> {
        not_supported("download_firmware")
    }

    fn start_acquisition<'a>(&'a mut self, _params: &'a AcquisitionParams) -> BoardFuture<'a, ()> {
        not_supported("start_acquisition")
    }

    fn start_antenna_buffer<'a>(
        &'a mut self,
        _params: &'a AntennaBufferParams,
    ) -> BoardFuture<'a, ()> {
        not_supported("start_antenna_buffer")
    }

    /// Read back the antenna buffer, returning the number of samples read.
    fn read_antenna_buffer<'a>(&'a mut self) -> BoardFuture<'a, usize> {
        not_supported("read_antenna_buffer")
    }
}
