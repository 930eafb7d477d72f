// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! In-memory subrack that powers simulated boards.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tpm_core::board::power::{PowerRequestResult, PowerSupplyProxy};
use tpm_core::{CommunicationStatus, PowerState};

use crate::simulator::SimulatorHandle;

/// Something the supply reports back to whoever drives the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyEvent {
    Communication(CommunicationStatus),
    Power { slot: u8, power: PowerState },
}

#[derive(Debug)]
struct SupplyState {
    connected: bool,
    reachable: bool,
    slots: BTreeMap<u8, SimulatorHandle>,
}

impl SupplyState {
    fn power_of(hardware: &SimulatorHandle) -> PowerState {
        if hardware.is_powered() {
            PowerState::On
        } else {
            PowerState::Off
        }
    }

    fn online_events(&self) -> Vec<SupplyEvent> {
        let mut events = vec![SupplyEvent::Communication(CommunicationStatus::Established)];
        events.extend(self.slots.iter().map(|(slot, hardware)| SupplyEvent::Power {
            slot: *slot,
            power: Self::power_of(hardware),
        }));
        events
    }
}

/// Simulated power supply.
///
/// Events go out on the channel returned by [`SimulatedPowerSupply::new`]
/// and never from within the call that caused them.
#[derive(Debug)]
pub struct SimulatedPowerSupply {
    state: Mutex<SupplyState>,
    events: mpsc::UnboundedSender<SupplyEvent>,
}

impl SimulatedPowerSupply {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupplyEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supply = Self {
            state: Mutex::new(SupplyState {
                connected: false,
                reachable: true,
                slots: BTreeMap::new(),
            }),
            events,
        };
        (supply, rx)
    }

    fn state(&self) -> MutexGuard<'_, SupplyState> {
        self.state.lock().expect("supply mutex poisoned")
    }

    fn send(&self, events: Vec<SupplyEvent>) {
        for event in events {
            debug!("Supply event {:?}", event);
            if self.events.send(event).is_err() {
                warn!("Supply event receiver dropped");
                return;
            }
        }
    }

    /// Put a board into `slot`.
    pub fn attach(&self, slot: u8, hardware: SimulatorHandle) {
        let events = {
            let mut state = self.state();
            let power = SupplyState::power_of(&hardware);
            state.slots.insert(slot, hardware);
            if state.connected && state.reachable {
                vec![SupplyEvent::Power { slot, power }]
            } else {
                Vec::new()
            }
        };
        self.send(events);
    }

    /// Make the supply stop (or resume) answering.
    pub fn set_reachable(&self, reachable: bool) {
        let events = {
            let mut state = self.state();
            if state.reachable == reachable {
                return;
            }
            state.reachable = reachable;
            if !state.connected {
                Vec::new()
            } else if reachable {
                state.online_events()
            } else {
                vec![SupplyEvent::Communication(
                    CommunicationStatus::NotEstablished,
                )]
            }
        };
        self.send(events);
    }

    pub fn slot_power(&self, slot: u8) -> Option<PowerState> {
        self.state().slots.get(&slot).map(SupplyState::power_of)
    }

    fn switch(&self, slot: u8, on: bool) -> PowerRequestResult {
        let event = {
            let state = self.state();
            if !state.connected || !state.reachable {
                warn!("Power request for slot {} while supply is offline", slot);
                return PowerRequestResult::Rejected;
            }
            let Some(hardware) = state.slots.get(&slot) else {
                warn!("Power request for empty slot {}", slot);
                return PowerRequestResult::Rejected;
            };
            hardware.set_powered(on);
            SupplyEvent::Power {
                slot,
                power: SupplyState::power_of(hardware),
            }
        };
        info!("Slot {} powered {}", slot, if on { "on" } else { "off" });
        self.send(vec![event]);
        PowerRequestResult::Accepted
    }
}

impl PowerSupplyProxy for SimulatedPowerSupply {
    fn connect(&self) {
        let events = {
            let mut state = self.state();
            state.connected = true;
            if state.reachable {
                state.online_events()
            } else {
                vec![SupplyEvent::Communication(
                    CommunicationStatus::NotEstablished,
                )]
            }
        };
        self.send(events);
    }

    fn disconnect(&self) {
        self.state().connected = false;
        self.send(vec![SupplyEvent::Communication(CommunicationStatus::Disabled)]);
    }

    fn power_on(&self, slot: u8) -> PowerRequestResult {
        self.switch(slot, true)
    }

    fn power_off(&self, slot: u8) -> PowerRequestResult {
        self.switch(slot, false)
    }
}
