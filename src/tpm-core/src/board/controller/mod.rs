// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Board controller components.
//!
//! This module contains the core control logic for driving a board: status
//! inference, the connection and polling engine, per-tick request
//! scheduling, lifecycle orchestration, events and operational policies.

pub mod engine;
pub mod events;
pub mod handlers;
pub mod machine;
pub mod orchestrator;
pub mod policies;
pub mod scheduler;

pub use engine::{BoardState, ConnectionEngine, EngineConfig};
pub use events::{BoardEventEmitter, BoardListener, ListenerId};
pub use handlers::{command_from_board_command, BoardCommand, CommandHandler, ValidationResult};
pub use machine::{infer_status, override_for_power, HardwareFacts, StatusMachine};
pub use orchestrator::{DesiredTarget, LifecycleOrchestrator};
pub use policies::{FixedDelay, PollingPolicy, RetryPolicy, TieredPolling};
pub use scheduler::{Action, ProbeRequest, RequestScheduler};
