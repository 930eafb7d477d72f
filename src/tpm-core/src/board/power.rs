// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Collaborators the lifecycle orchestrator drives.

use serde::{Deserialize, Serialize};

/// Answer of the power supply to a power request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerRequestResult {
    Accepted,
    Rejected,
}

/// Upstream power supply (subrack) feeding this board.
///
/// Calls must return promptly. Reachability and power state changes are
/// reported back asynchronously through
/// [`LifecycleOrchestrator::on_supply_communication`] and
/// [`LifecycleOrchestrator::on_board_power`], possibly from within the call
/// that caused them.
///
/// [`LifecycleOrchestrator::on_supply_communication`]: crate::board::controller::orchestrator::LifecycleOrchestrator::on_supply_communication
/// [`LifecycleOrchestrator::on_board_power`]: crate::board::controller::orchestrator::LifecycleOrchestrator::on_board_power
pub trait PowerSupplyProxy: Send + Sync {
    /// Start talking to the supply.
    fn connect(&self);

    /// Stop talking to the supply.
    fn disconnect(&self);

    fn power_on(&self, slot: u8) -> PowerRequestResult;

    fn power_off(&self, slot: u8) -> PowerRequestResult;
}

/// Something that keeps a link to the board alive while started.
pub trait BoardConnection: Send + Sync {
    fn start(&self);

    fn stop(&self);
}
