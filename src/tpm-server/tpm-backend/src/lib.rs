// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::HashMap;

use tpm_app::normalize_name;
use tpm_core::board::Board;
use tpm_core::DynResult;

pub mod power_supply;
pub mod simulator;

pub use power_supply::{SimulatedPowerSupply, SupplyEvent};
pub use simulator::{SimulatorBoard, SimulatorConfig, SimulatorHandle};

/// Connection details for instantiating a board backend.
#[derive(Debug, Clone)]
pub enum BoardAccess {
    Udp { host: String, port: u16 },
    Simulated { hardware: SimulatorHandle },
}

pub type BackendFactory = fn(BoardAccess) -> DynResult<Box<dyn Board>>;

/// Context for registering and instantiating board backends.
#[derive(Clone)]
pub struct RegistrationContext {
    factories: HashMap<String, BackendFactory>,
}

impl RegistrationContext {
    /// Create a new empty registration context.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory under a stable name (e.g. "simulator").
    pub fn register_backend(&mut self, name: &str, factory: BackendFactory) {
        let key = normalize_name(name);
        self.factories.insert(key, factory);
    }

    /// Check whether a backend name is registered.
    pub fn is_backend_registered(&self, name: &str) -> bool {
        let key = normalize_name(name);
        self.factories.contains_key(&key)
    }

    /// List registered backend names.
    pub fn registered_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate a board backend based on the selected name and access method.
    pub fn build_board(&self, name: &str, access: BoardAccess) -> DynResult<Box<dyn Board>> {
        let key = normalize_name(name);
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| format!("Unknown board backend: {}", name))?;
        factory(access)
    }
}

impl Default for RegistrationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Register all built-in backends on a context.
pub fn register_builtin_backends_on(context: &mut RegistrationContext) {
    context.register_backend("simulator", simulator_factory);
}

fn simulator_factory(access: BoardAccess) -> DynResult<Box<dyn Board>> {
    match access {
        BoardAccess::Simulated { hardware } => Ok(Box::new(SimulatorBoard::new(hardware))),
        BoardAccess::Udp { .. } => Err("simulator backend requires simulated access".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tpm_core::board::command::{AcquisitionParams, InitialiseParams};
    use tpm_core::board::controller::{BoardCommand, EngineConfig, FixedDelay, TieredPolling};
    use tpm_core::{
        BoardManager, CommandStatus, CommunicationStatus, PowerState, TelemetryField, TpmStatus,
    };

    #[test]
    fn test_registry_normalizes_names() {
        let mut context = RegistrationContext::new();
        register_builtin_backends_on(&mut context);
        assert!(context.is_backend_registered("Simulator"));
        assert!(!context.is_backend_registered("tpm16"));
        assert_eq!(context.registered_backends(), vec!["simulator".to_string()]);
    }

    #[test]
    fn test_build_board() {
        let mut context = RegistrationContext::default();
        register_builtin_backends_on(&mut context);

        let hardware = SimulatorHandle::new(SimulatorConfig::default());
        let board = context
            .build_board("SIMULATOR", BoardAccess::Simulated { hardware })
            .unwrap();
        assert_eq!(board.info().revision, "1.6");

        let udp = BoardAccess::Udp {
            host: "10.0.10.1".into(),
            port: 10000,
        };
        assert!(context.build_board("simulator", udp.clone()).is_err());
        let err = context.build_board("tpm16", udp).err().unwrap();
        assert_eq!(err.to_string(), "Unknown board backend: tpm16");
    }

    fn forward(mut rx: mpsc::UnboundedReceiver<SupplyEvent>, slot: u8, manager: Arc<BoardManager>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SupplyEvent::Communication(status) => manager.on_supply_communication(status),
                    SupplyEvent::Power { slot: s, power } if s == slot => {
                        manager.on_board_power(power)
                    }
                    SupplyEvent::Power { .. } => {}
                }
            }
        });
    }

    async fn wait_for(manager: &BoardManager, status: TpmStatus) {
        let mut state = manager.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.status() != status {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("board never reached {status}, is {}", manager.status()));
    }

    #[tokio::test]
    async fn test_simulated_board_bring_up() {
        let hardware = SimulatorHandle::new(SimulatorConfig::default());
        hardware.set_powered(false);
        let (supply, rx) = SimulatedPowerSupply::new();
        supply.attach(4, hardware.clone());
        let supply = Arc::new(supply);

        let config = EngineConfig {
            polling: TieredPolling::new(
                Duration::from_millis(10),
                Duration::from_millis(50),
                Duration::from_millis(100),
            ),
            retry: FixedDelay::new(3, Duration::from_millis(10), Duration::from_millis(50)),
            tile_id: 4,
            station_id: 1,
            ..EngineConfig::default()
        };
        let manager = Arc::new(BoardManager::new(
            Box::new(SimulatorBoard::new(hardware.clone())),
            supply.clone(),
            4,
            config,
        ));
        forward(rx, 4, manager.clone());

        manager.desire_on();
        wait_for(&manager, TpmStatus::Unprogrammed).await;
        assert!(hardware.is_powered());
        assert_eq!(manager.power_state(), PowerState::On);
        assert_eq!(
            manager.communication_status(),
            CommunicationStatus::Established
        );

        let (status, mut handle) = manager.submit(BoardCommand::Initialise(InitialiseParams {
            tile_id: 4,
            station_id: 1,
            pps_delay: 0,
        }));
        assert_eq!(status, CommandStatus::Queued);
        assert_eq!(handle.wait().await.unwrap().status, CommandStatus::Completed);
        wait_for(&manager, TpmStatus::Initialised).await;

        let (_, mut handle) =
            manager.submit(BoardCommand::StartAcquisition(AcquisitionParams::default()));
        assert_eq!(handle.wait().await.unwrap().status, CommandStatus::Completed);
        wait_for(&manager, TpmStatus::Synchronised).await;
        assert!(manager.telemetry(TelemetryField::Voltage).is_some());

        manager.desire_off();
        wait_for(&manager, TpmStatus::Off).await;
        assert!(!hardware.is_powered());

        manager.shutdown().await;
        assert!(manager.telemetry(TelemetryField::Voltage).is_none());
    }
}
