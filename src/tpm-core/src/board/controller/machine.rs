// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Board status state machine.
//!
//! Status is never assumed: it is inferred from hardware facts gathered by
//! the poll loop, and the machine only records transitions between inferred
//! values.

use std::time::{Duration, Instant};

use crate::board::status::{CommunicationStatus, PowerState, TpmStatus};

/// Facts probed from the hardware during one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareFacts {
    pub communication: CommunicationStatus,
    pub programmed: bool,
    /// Tile and station ids on the board match the ones we configured.
    /// A freshly programmed board still carries default ids.
    pub id_matches: bool,
    /// Stream-valid flag of each processing half (FPGA).
    pub streams_valid: [bool; 2],
}

impl HardwareFacts {
    pub fn unconnected() -> Self {
        Self {
            communication: CommunicationStatus::NotEstablished,
            programmed: false,
            id_matches: false,
            streams_valid: [false; 2],
        }
    }
}

/// Infer the board status from hardware facts.
pub fn infer_status(facts: &HardwareFacts) -> TpmStatus {
    if facts.communication != CommunicationStatus::Established {
        return TpmStatus::Unconnected;
    }
    if !facts.programmed {
        return TpmStatus::Unprogrammed;
    }
    if !facts.id_matches {
        return TpmStatus::Programmed;
    }
    if !facts.streams_valid.iter().all(|valid| *valid) {
        return TpmStatus::Initialised;
    }
    TpmStatus::Synchronised
}

/// Apply the power-state override: a board that is not known to be on is
/// reported as `Unknown` or `Off` whatever the engine last inferred.
pub fn override_for_power(power: PowerState, inferred: TpmStatus) -> TpmStatus {
    match power {
        PowerState::Unknown => TpmStatus::Unknown,
        PowerState::Off | PowerState::Standby => TpmStatus::Off,
        PowerState::On => inferred,
    }
}

/// Tracks the current status and its transitions.
#[derive(Debug, Clone)]
pub struct StatusMachine {
    status: TpmStatus,
    transition_count: u64,
    last_transition: Option<Instant>,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMachine {
    /// Create a new machine in the `Unknown` state.
    pub fn new() -> Self {
        Self {
            status: TpmStatus::Unknown,
            transition_count: 0,
            last_transition: None,
        }
    }

    /// Create a machine that continues from a previously published status.
    pub fn resume(status: TpmStatus) -> Self {
        Self {
            status,
            ..Self::new()
        }
    }

    pub fn status(&self) -> TpmStatus {
        self.status
    }

    /// Get the number of transitions that have occurred.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Get the time since the last transition.
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Move to `status`. Returns the previous status when this is a transition.
    pub fn apply(&mut self, status: TpmStatus) -> Option<TpmStatus> {
        if status == self.status {
            return None;
        }
        let previous = self.status;
        self.status = status;
        self.transition_count += 1;
        self.last_transition = Some(Instant::now());
        Some(previous)
    }

    /// Infer from `facts` and apply the result.
    pub fn observe(&mut self, facts: &HardwareFacts) -> Option<TpmStatus> {
        self.apply(infer_status(facts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established(programmed: bool, id_matches: bool, streams_valid: [bool; 2]) -> HardwareFacts {
        HardwareFacts {
            communication: CommunicationStatus::Established,
            programmed,
            id_matches,
            streams_valid,
        }
    }

    #[test]
    fn test_initial_state() {
        let sm = StatusMachine::new();
        assert_eq!(sm.status(), TpmStatus::Unknown);
        assert_eq!(sm.transition_count(), 0);
        assert!(sm.time_in_state().is_none());
    }

    #[test]
    fn test_not_established_is_unconnected() {
        assert_eq!(
            infer_status(&HardwareFacts::unconnected()),
            TpmStatus::Unconnected
        );
        let mut facts = established(true, true, [true, true]);
        facts.communication = CommunicationStatus::Disabled;
        assert_eq!(infer_status(&facts), TpmStatus::Unconnected);
    }

    #[test]
    fn test_bring_up_sequence() {
        let probes = [
            established(false, false, [false, false]),
            established(true, false, [false, false]),
            established(true, true, [false, false]),
            established(true, true, [true, true]),
        ];
        let mut sm = StatusMachine::new();
        let statuses: Vec<TpmStatus> = probes
            .iter()
            .map(|facts| {
                sm.observe(facts);
                sm.status()
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                TpmStatus::Unprogrammed,
                TpmStatus::Programmed,
                TpmStatus::Initialised,
                TpmStatus::Synchronised,
            ]
        );
        assert_eq!(sm.transition_count(), 4);
    }

    #[test]
    fn test_one_invalid_stream_is_not_synchronised() {
        assert_eq!(
            infer_status(&established(true, true, [true, false])),
            TpmStatus::Initialised
        );
        assert_eq!(
            infer_status(&established(true, true, [false, true])),
            TpmStatus::Initialised
        );
    }

    #[test]
    fn test_repeated_status_is_not_a_transition() {
        let mut sm = StatusMachine::new();
        assert_eq!(sm.apply(TpmStatus::Unconnected), Some(TpmStatus::Unknown));
        assert_eq!(sm.apply(TpmStatus::Unconnected), None);
        assert_eq!(sm.transition_count(), 1);
    }

    #[test]
    fn test_power_override() {
        assert_eq!(
            override_for_power(PowerState::Unknown, TpmStatus::Synchronised),
            TpmStatus::Unknown
        );
        assert_eq!(
            override_for_power(PowerState::Off, TpmStatus::Synchronised),
            TpmStatus::Off
        );
        assert_eq!(
            override_for_power(PowerState::Standby, TpmStatus::Programmed),
            TpmStatus::Off
        );
        assert_eq!(
            override_for_power(PowerState::On, TpmStatus::Programmed),
            TpmStatus::Programmed
        );
    }
}
