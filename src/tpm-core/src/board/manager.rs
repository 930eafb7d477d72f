// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-board façade tying the engine and the orchestrator together.

use std::sync::{Arc, RwLock, Weak};

use tokio::sync::watch;
use tracing::info;

use crate::board::command::{CommandHandle, CommandStatus};
use crate::board::controller::engine::{BoardState, ConnectionEngine, EngineConfig};
use crate::board::controller::events::{BoardEventEmitter, BoardListener, ListenerId};
use crate::board::controller::handlers::{command_from_board_command, BoardCommand};
use crate::board::controller::machine::override_for_power;
use crate::board::controller::orchestrator::{DesiredTarget, LifecycleOrchestrator};
use crate::board::power::PowerSupplyProxy;
use crate::board::status::{CommunicationStatus, PowerState, TpmStatus};
use crate::board::telemetry::{TelemetryCache, TelemetryField, TelemetryValue};
use crate::board::Board;

/// Feeds the engine's link changes into the orchestrator.
struct LinkBridge {
    orchestrator: Weak<LifecycleOrchestrator>,
}

impl BoardListener for LinkBridge {
    fn on_link_change(&self, status: CommunicationStatus) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.on_board_communication(status);
        }
    }
}

/// One managed board: its engine, its orchestrator and their listeners.
pub struct BoardManager {
    engine: Arc<ConnectionEngine>,
    orchestrator: Arc<LifecycleOrchestrator>,
    emitter: Arc<RwLock<BoardEventEmitter>>,
}

impl BoardManager {
    /// Wire up a board fed from `slot` of `supply`.
    ///
    /// Nothing runs until one of the `desire_*` calls. Power supply events
    /// must be forwarded to [`BoardManager::on_supply_communication`] and
    /// [`BoardManager::on_board_power`].
    pub fn new(
        board: Box<dyn Board>,
        supply: Arc<dyn PowerSupplyProxy>,
        slot: u8,
        config: EngineConfig,
    ) -> Self {
        let emitter = Arc::new(RwLock::new(BoardEventEmitter::new()));
        let engine = Arc::new(ConnectionEngine::new(board, config, emitter.clone()));
        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            slot,
            supply,
            engine.clone(),
            emitter.clone(),
        ));
        emitter
            .write()
            .expect("emitter lock poisoned")
            .register(Arc::new(LinkBridge {
                orchestrator: Arc::downgrade(&orchestrator),
            }));

        Self {
            engine,
            orchestrator,
            emitter,
        }
    }

    /// Board status, forced to `Off` or `Unknown` when the supply says the
    /// board is not powered.
    pub fn status(&self) -> TpmStatus {
        override_for_power(self.orchestrator.power_state(), self.engine.status())
    }

    pub fn pretty_status(&self) -> &'static str {
        self.status().pretty_name()
    }

    /// Last cached value of `field`, if it is valid in the current status.
    pub fn telemetry(&self, field: TelemetryField) -> Option<TelemetryValue> {
        self.engine.telemetry(field)
    }

    pub fn telemetry_snapshot(&self) -> TelemetryCache {
        self.engine.telemetry_snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<BoardState> {
        self.engine.subscribe()
    }

    /// Queue a command; its progress arrives on the returned handle.
    pub fn submit(&self, command: BoardCommand) -> (CommandStatus, CommandHandle) {
        self.engine.submit(command_from_board_command(command))
    }

    /// Abort every queued command. Returns how many were aborted.
    pub fn abort_commands(&self) -> usize {
        self.engine.abort_commands()
    }

    /// Ask the engine to drop and re-establish its link on its next tick.
    pub fn request_connection(&self) {
        self.engine.request_connection();
    }

    pub fn desire_online(&self) {
        self.orchestrator.desire_online();
    }

    pub fn desire_offline(&self) {
        self.orchestrator.desire_offline();
    }

    pub fn desire_on(&self) {
        self.orchestrator.desire_on();
    }

    pub fn desire_off(&self) {
        self.orchestrator.desire_off();
    }

    pub fn desire_standby(&self) {
        self.orchestrator.desire_standby();
    }

    pub fn target(&self) -> DesiredTarget {
        self.orchestrator.target()
    }

    pub fn communication_status(&self) -> CommunicationStatus {
        self.orchestrator.communication_status()
    }

    pub fn power_state(&self) -> PowerState {
        self.orchestrator.power_state()
    }

    pub fn on_supply_communication(&self, status: CommunicationStatus) {
        self.orchestrator.on_supply_communication(status);
    }

    pub fn on_board_power(&self, power: PowerState) {
        self.orchestrator.on_board_power(power);
    }

    pub fn register_listener(&self, listener: Arc<dyn BoardListener>) -> ListenerId {
        self.emitter
            .write()
            .expect("emitter lock poisoned")
            .register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.emitter
            .write()
            .expect("emitter lock poisoned")
            .unregister(id);
    }

    pub fn engine(&self) -> &Arc<ConnectionEngine> {
        &self.engine
    }

    pub fn orchestrator(&self) -> &Arc<LifecycleOrchestrator> {
        &self.orchestrator
    }

    /// Take the board offline and wait for the engine task to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down board manager");
        self.orchestrator.desire_offline();
        self.engine.shutdown().await;
    }
}
