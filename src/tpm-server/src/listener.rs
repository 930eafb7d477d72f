// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Event sink that writes board events to the log.

use tracing::{debug, info, warn};

use tpm_core::board::controller::BoardListener;
use tpm_core::{
    CommandStatus, CommandUpdate, CommunicationStatus, PowerState, TelemetryField,
    TelemetryValue, TpmStatus,
};

pub struct LoggingListener {
    tile_id: u32,
}

impl LoggingListener {
    pub fn new(tile_id: u32) -> Self {
        Self { tile_id }
    }
}

/// Render a telemetry value as compact JSON for the log line.
fn render(value: &TelemetryValue) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unrenderable: {e}>"))
}

impl BoardListener for LoggingListener {
    fn on_status_change(&self, old: TpmStatus, new: TpmStatus) {
        info!(
            "[tile {}] status {} -> {}",
            self.tile_id,
            old.pretty_name(),
            new.pretty_name()
        );
    }

    fn on_telemetry_update(&self, field: TelemetryField, value: &TelemetryValue) {
        debug!("[tile {}] {} = {}", self.tile_id, field, render(value));
    }

    fn on_telemetry_stale(&self, fields: &[TelemetryField]) {
        let names: Vec<&str> = fields.iter().map(|f| f.probe_name()).collect();
        info!("[tile {}] telemetry stale: {}", self.tile_id, names.join(", "));
    }

    fn on_communication_change(&self, status: CommunicationStatus) {
        info!("[tile {}] communication {}", self.tile_id, status);
    }

    fn on_power_change(&self, power: PowerState) {
        info!("[tile {}] power {}", self.tile_id, power);
    }

    fn on_command_update(&self, update: &CommandUpdate) {
        let line = serde_json::to_string(update).unwrap_or_else(|_| format!("{update:?}"));
        match update.status {
            CommandStatus::Failed | CommandStatus::Rejected => {
                warn!("[tile {}] command {}", self.tile_id, line)
            }
            _ => info!("[tile {}] command {}", self.tile_id, line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_telemetry() {
        assert_eq!(render(&TelemetryValue::Float(5.0)), "5.0");
        assert_eq!(render(&TelemetryValue::Ints(vec![1, 2])), "[1,2]");
        assert_eq!(render(&TelemetryValue::Text("ok".into())), "\"ok\"");
    }
}
