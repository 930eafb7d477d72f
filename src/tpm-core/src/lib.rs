// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod board;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use board::command::{CommandCategory, CommandHandle, CommandStatus, CommandUpdate};
pub use board::error::{BoardError, BoardResult};
pub use board::manager::BoardManager;
pub use board::status::{CommunicationStatus, PowerState, TpmStatus};
pub use board::telemetry::{TelemetryCache, TelemetryField, TelemetryValue};
pub use board::Board;
