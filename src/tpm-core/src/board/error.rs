// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use serde::Serialize;
use thiserror::Error;

/// Error type returned by board operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
pub enum BoardError {
    /// The link to the board failed or is not up.
    #[error("connectivity error: {0}")]
    Connectivity(String),
    /// The exclusive hardware lock could not be acquired in time.
    #[error("hardware lock not acquired within timeout")]
    LockTimeout,
    /// The board or its firmware does not implement this operation.
    #[error("{0} not supported by this board")]
    NotSupported(&'static str),
    /// A command ran but the board reported a failure.
    #[error("{0}")]
    Command(String),
}

pub type BoardResult<T> = Result<T, BoardError>;

impl BoardError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    pub fn not_supported(operation: &'static str) -> Self {
        Self::NotSupported(operation)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }

    /// Connectivity failures and lock timeouts clear up on their own and are
    /// worth retrying; everything else is surfaced as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::LockTimeout)
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}
