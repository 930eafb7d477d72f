// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Lifecycle orchestration.
//!
//! The orchestrator reconciles what the caller wants (offline, online, or a
//! power target) with two facts that arrive on their own schedule: whether
//! the power supply is reachable and whether it reports the board as
//! powered. Nothing here blocks or fails; a request that cannot be honoured
//! yet is honoured once its dependencies become available.
//!
//! Every entry point updates the intent under a lock, computes the effects
//! needed to move towards it, and runs them after releasing the lock. This
//! lets collaborators report back synchronously from within an effect.
//! Status notifications are the exception: they are delivered under a
//! separate dispatch lock, in the order the intent produced them.

use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::board::power::{BoardConnection, PowerRequestResult, PowerSupplyProxy};
use crate::board::status::{CommunicationStatus, PowerState};

use super::events::BoardEventEmitter;

/// What the caller asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum DesiredTarget {
    #[default]
    Offline,
    /// Online without an opinion on board power.
    Online,
    Off,
    Standby,
    On,
}

impl DesiredTarget {
    pub fn is_online(self) -> bool {
        self != Self::Offline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerRequest {
    On,
    Off,
}

#[derive(Debug)]
enum Effect {
    // Notifications, always listed before the actions.
    Communication(CommunicationStatus),
    Power(PowerState),
    ConnectSupply,
    DisconnectSupply,
    Request(PowerRequest),
    StartEngine,
    StopEngine,
}

impl Effect {
    fn is_notification(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::Power(_))
    }
}

#[derive(Debug, Default)]
struct Intent {
    target: DesiredTarget,
    supply_comms: CommunicationStatus,
    board_comms: CommunicationStatus,
    board_power: PowerState,
    supply_requested: bool,
    engine_running: bool,
    /// Power request sent and not yet reflected by the supply.
    pending: Option<PowerRequest>,
    /// Refused request, not repeated until the caller or the supply moves.
    rejected: Option<PowerRequest>,
    reported_comms: CommunicationStatus,
    reported_power: PowerState,
}

impl Intent {
    fn merged(&self) -> CommunicationStatus {
        use CommunicationStatus::*;

        if !self.target.is_online() && self.supply_comms == Disabled && self.board_comms == Disabled
        {
            return Disabled;
        }
        if self.supply_comms != Established {
            return NotEstablished;
        }
        let board_ready = match self.target {
            DesiredTarget::On | DesiredTarget::Standby => self.board_comms == Established,
            _ => self.board_comms == Established || self.board_power != PowerState::On,
        };
        if board_ready {
            Established
        } else {
            NotEstablished
        }
    }

    fn power_request(&self) -> Option<PowerRequest> {
        let request = match self.target {
            DesiredTarget::On | DesiredTarget::Standby if self.board_power != PowerState::On => {
                PowerRequest::On
            }
            DesiredTarget::Off if self.board_power != PowerState::Off => PowerRequest::Off,
            _ => return None,
        };
        if self.pending == Some(request) || self.rejected == Some(request) {
            return None;
        }
        Some(request)
    }

    /// Move the bookkeeping to where the intent wants it and list the
    /// effects that get the collaborators there. Notifications come first.
    fn reconcile(&mut self) -> Vec<Effect> {
        let mut actions = Vec::new();

        if !self.target.is_online() {
            if self.engine_running {
                actions.push(Effect::StopEngine);
                self.engine_running = false;
                self.board_comms = CommunicationStatus::Disabled;
            }
            if self.supply_requested {
                actions.push(Effect::DisconnectSupply);
                self.supply_requested = false;
                self.supply_comms = CommunicationStatus::Disabled;
                self.board_power = PowerState::Unknown;
                self.pending = None;
            }
        } else {
            if !self.supply_requested {
                actions.push(Effect::ConnectSupply);
                self.supply_requested = true;
                if self.supply_comms == CommunicationStatus::Disabled {
                    self.supply_comms = CommunicationStatus::NotEstablished;
                }
            }
            if self.supply_comms == CommunicationStatus::Established {
                if let Some(request) = self.power_request() {
                    actions.push(Effect::Request(request));
                    self.pending = Some(request);
                }
            }
            let should_run = self.supply_comms == CommunicationStatus::Established
                && self.board_power == PowerState::On;
            if should_run && !self.engine_running {
                actions.push(Effect::StartEngine);
                self.engine_running = true;
                self.board_comms = CommunicationStatus::NotEstablished;
            } else if !should_run && self.engine_running {
                actions.push(Effect::StopEngine);
                self.engine_running = false;
                self.board_comms = CommunicationStatus::Disabled;
            }
        }

        let mut effects = Vec::with_capacity(actions.len() + 2);
        if self.board_power != self.reported_power {
            self.reported_power = self.board_power;
            effects.push(Effect::Power(self.board_power));
        }
        let merged = self.merged();
        if merged != self.reported_comms {
            self.reported_comms = merged;
            effects.push(Effect::Communication(merged));
        }
        effects.extend(actions);
        effects
    }
}

/// Reconciles the desired target with supply reachability and board power.
pub struct LifecycleOrchestrator {
    slot: u8,
    supply: Arc<dyn PowerSupplyProxy>,
    board: Arc<dyn BoardConnection>,
    emitter: Arc<RwLock<BoardEventEmitter>>,
    intent: Mutex<Intent>,
    /// Held from reconciling until the resulting notifications are delivered.
    dispatch: Mutex<()>,
}

impl LifecycleOrchestrator {
    pub fn new(
        slot: u8,
        supply: Arc<dyn PowerSupplyProxy>,
        board: Arc<dyn BoardConnection>,
        emitter: Arc<RwLock<BoardEventEmitter>>,
    ) -> Self {
        Self {
            slot,
            supply,
            board,
            emitter,
            intent: Mutex::new(Intent::default()),
            dispatch: Mutex::new(()),
        }
    }

    pub fn desire_online(&self) {
        self.update(|intent| {
            intent.rejected = None;
            if intent.target == DesiredTarget::Offline {
                intent.target = DesiredTarget::Online;
            }
        });
    }

    pub fn desire_offline(&self) {
        self.set_target(DesiredTarget::Offline);
    }

    pub fn desire_on(&self) {
        self.set_target(DesiredTarget::On);
    }

    pub fn desire_off(&self) {
        self.set_target(DesiredTarget::Off);
    }

    pub fn desire_standby(&self) {
        self.set_target(DesiredTarget::Standby);
    }

    /// The power supply became (un)reachable.
    pub fn on_supply_communication(&self, status: CommunicationStatus) {
        self.update(|intent| {
            if !intent.supply_requested && status != CommunicationStatus::Disabled {
                debug!("Ignoring supply {} while not requested", status);
                return;
            }
            intent.supply_comms = status;
            intent.rejected = None;
            if status != CommunicationStatus::Established {
                // Nothing the supply said about the board holds any more.
                intent.pending = None;
                intent.board_power = PowerState::Unknown;
            }
        });
    }

    /// The power supply reported a new power state for this board.
    pub fn on_board_power(&self, power: PowerState) {
        self.update(|intent| {
            intent.board_power = power;
            let satisfied = match intent.pending {
                Some(PowerRequest::On) => power == PowerState::On,
                Some(PowerRequest::Off) => power == PowerState::Off,
                None => false,
            };
            if satisfied {
                intent.pending = None;
            }
        });
    }

    /// The connection engine's link to the board changed.
    pub fn on_board_communication(&self, status: CommunicationStatus) {
        self.update(|intent| {
            if intent.engine_running || status == CommunicationStatus::Disabled {
                intent.board_comms = status;
            }
        });
    }

    pub fn target(&self) -> DesiredTarget {
        self.intent().target
    }

    /// Merged communication status as last reported to listeners.
    pub fn communication_status(&self) -> CommunicationStatus {
        self.intent().reported_comms
    }

    pub fn power_state(&self) -> PowerState {
        self.intent().board_power
    }

    pub fn supply_communication(&self) -> CommunicationStatus {
        self.intent().supply_comms
    }

    pub fn board_communication(&self) -> CommunicationStatus {
        self.intent().board_comms
    }

    fn intent(&self) -> std::sync::MutexGuard<'_, Intent> {
        self.intent.lock().expect("intent mutex poisoned")
    }

    fn set_target(&self, target: DesiredTarget) {
        self.update(|intent| {
            intent.rejected = None;
            if intent.target != target {
                info!("Desired target {:?} -> {:?}", intent.target, target);
                intent.target = target;
            }
        });
    }

    fn update(&self, change: impl FnOnce(&mut Intent)) {
        let actions = {
            let _dispatch = self.dispatch.lock().expect("dispatch mutex poisoned");
            let mut effects = {
                let mut intent = self.intent();
                change(&mut intent);
                intent.reconcile()
            };
            let split = effects
                .iter()
                .position(|effect| !effect.is_notification())
                .unwrap_or(effects.len());
            let actions = effects.split_off(split);
            for notification in effects {
                self.execute(notification);
            }
            actions
        };
        for effect in actions {
            self.execute(effect);
        }
    }

    fn execute(&self, effect: Effect) {
        debug!("Orchestrator effect {:?}", effect);
        match effect {
            Effect::Communication(status) => {
                info!("Communication status {}", status);
                self.emitter().notify_communication_change(status);
            }
            Effect::Power(power) => {
                info!("Board power {}", power);
                self.emitter().notify_power_change(power);
            }
            Effect::ConnectSupply => self.supply.connect(),
            Effect::DisconnectSupply => self.supply.disconnect(),
            Effect::Request(request) => {
                let result = match request {
                    PowerRequest::On => self.supply.power_on(self.slot),
                    PowerRequest::Off => self.supply.power_off(self.slot),
                };
                if result == PowerRequestResult::Rejected {
                    warn!("Power supply rejected {:?} for slot {}", request, self.slot);
                    self.update(|intent| {
                        if intent.pending == Some(request) {
                            intent.pending = None;
                        }
                        intent.rejected = Some(request);
                    });
                }
            }
            Effect::StartEngine => self.board.start(),
            Effect::StopEngine => self.board.stop(),
        }
    }

    fn emitter(&self) -> BoardEventEmitter {
        self.emitter.read().expect("emitter lock poisoned").clone()
    }
}
