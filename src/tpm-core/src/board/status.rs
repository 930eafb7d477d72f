// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a TPM board.
///
/// This is not a total order: a board can drop from any phase back to
/// `Unconnected` or `Unprogrammed`, and `Unknown`/`Off` are set from the
/// power state rather than from hardware probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TpmStatus {
    #[default]
    Unknown,
    Off,
    Unconnected,
    Unprogrammed,
    Programmed,
    Initialised,
    Synchronised,
}

impl TpmStatus {
    pub const ALL: [TpmStatus; 7] = [
        TpmStatus::Unknown,
        TpmStatus::Off,
        TpmStatus::Unconnected,
        TpmStatus::Unprogrammed,
        TpmStatus::Programmed,
        TpmStatus::Initialised,
        TpmStatus::Synchronised,
    ];

    /// Human readable name as shown to operators.
    pub fn pretty_name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Off => "Off",
            Self::Unconnected => "Unconnected",
            Self::Unprogrammed => "NotProgrammed",
            Self::Programmed => "Programmed",
            Self::Initialised => "Initialised",
            Self::Synchronised => "Synchronised",
        }
    }

    /// True when the FPGAs carry firmware, regardless of initialisation.
    pub fn is_programmed(self) -> bool {
        matches!(
            self,
            Self::Programmed | Self::Initialised | Self::Synchronised
        )
    }

    /// True once this process has initialised the board.
    pub fn is_initialised(self) -> bool {
        matches!(self, Self::Initialised | Self::Synchronised)
    }

    /// True when a live link to the board exists.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Unprogrammed | Self::Programmed | Self::Initialised | Self::Synchronised
        )
    }
}

impl fmt::Display for TpmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pretty_name())
    }
}

/// State of a communication channel (board link, power supply, or both merged).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommunicationStatus {
    #[default]
    Disabled,
    NotEstablished,
    Established,
}

impl fmt::Display for CommunicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::NotEstablished => write!(f, "NotEstablished"),
            Self::Established => write!(f, "Established"),
        }
    }
}

/// Power state of the board as reported by the upstream power supply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    #[default]
    Unknown,
    Off,
    Standby,
    On,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Off => write!(f, "Off"),
            Self::Standby => write!(f, "Standby"),
            Self::On => write!(f, "On"),
        }
    }
}
