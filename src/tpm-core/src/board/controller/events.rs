// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Board event notification system.
//!
//! This module provides typed event notifications for board state changes,
//! allowing the orchestrator, the server and other sinks to react to
//! specific events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::board::command::CommandUpdate;
use crate::board::status::{CommunicationStatus, PowerState, TpmStatus};
use crate::board::telemetry::{TelemetryField, TelemetryValue};

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Trait for components that want to receive board events.
///
/// All methods have default no-op implementations, so listeners can
/// selectively override only the events they care about. Listeners are
/// called from the engine task and must not block.
///
/// `on_telemetry_stale` runs while the engine's scheduler is locked, so it
/// must not submit commands or request a connection.
/// `on_communication_change` and `on_power_change` are delivered while the
/// orchestrator holds its dispatch lock, so they must not call back into it.
pub trait BoardListener: Send + Sync {
    /// Called when the board status changes.
    fn on_status_change(&self, _old: TpmStatus, _new: TpmStatus) {}

    /// Called when a telemetry value was read.
    fn on_telemetry_update(&self, _field: TelemetryField, _value: &TelemetryValue) {}

    /// Called once with the fields that stopped being valid after a status change.
    fn on_telemetry_stale(&self, _fields: &[TelemetryField]) {}

    /// Called when the engine's own link to the board changes.
    fn on_link_change(&self, _status: CommunicationStatus) {}

    /// Called when the merged communication status changes.
    fn on_communication_change(&self, _status: CommunicationStatus) {}

    /// Called when the power supply reports a new board power state.
    fn on_power_change(&self, _power: PowerState) {}

    /// Called when the engine refuses, starts or finishes a submitted command.
    fn on_command_update(&self, _update: &CommandUpdate) {}
}

/// Manages registered listeners and dispatches events.
///
/// Cloning is cheap and yields a snapshot of the current listeners, which
/// lets callers dispatch without holding the lock the emitter is shared under.
#[derive(Clone)]
pub struct BoardEventEmitter {
    listeners: Vec<(ListenerId, Arc<dyn BoardListener>)>,
}

impl Default for BoardEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardEventEmitter {
    /// Create a new event emitter with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Register a listener to receive events.
    /// Returns an ID that can be used to unregister the listener.
    pub fn register(&mut self, listener: Arc<dyn BoardListener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.push((id, listener));
        id
    }

    /// Unregister a listener by its ID.
    pub fn unregister(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    /// Get the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn notify_status_change(&self, old: TpmStatus, new: TpmStatus) {
        for (_, listener) in &self.listeners {
            listener.on_status_change(old, new);
        }
    }

    pub fn notify_telemetry_update(&self, field: TelemetryField, value: &TelemetryValue) {
        for (_, listener) in &self.listeners {
            listener.on_telemetry_update(field, value);
        }
    }

    pub fn notify_telemetry_stale(&self, fields: &[TelemetryField]) {
        if fields.is_empty() {
            return;
        }
        for (_, listener) in &self.listeners {
            listener.on_telemetry_stale(fields);
        }
    }

    pub fn notify_link_change(&self, status: CommunicationStatus) {
        for (_, listener) in &self.listeners {
            listener.on_link_change(status);
        }
    }

    pub fn notify_communication_change(&self, status: CommunicationStatus) {
        for (_, listener) in &self.listeners {
            listener.on_communication_change(status);
        }
    }

    pub fn notify_power_change(&self, power: PowerState) {
        for (_, listener) in &self.listeners {
            listener.on_power_change(power);
        }
    }

    pub fn notify_command_update(&self, update: &CommandUpdate) {
        for (_, listener) in &self.listeners {
            listener.on_command_update(update);
        }
    }
}
