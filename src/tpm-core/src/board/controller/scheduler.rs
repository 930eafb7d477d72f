// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-tick work selection for the poll loop.
//!
//! Every poll cycle the engine asks the scheduler for exactly one action:
//! a requested reconnect, the highest priority queued command the current
//! status allows, or the next probe from the status' round-robin table.
//! Commands wait in one slot per category and expire after their deadline.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::board::command::{CommandCategory, CommandHandle, CommandStatus, QueuedCommand};
use crate::board::status::TpmStatus;
use crate::board::telemetry::{valid_fields, TelemetryField};

use super::handlers::CommandHandler;

/// Default lifetime of a queued command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// A unit of polling work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeRequest {
    /// (Re)open the link to the board.
    Connect,
    /// Refresh one telemetry field.
    Read(TelemetryField),
}

impl fmt::Display for ProbeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("CONNECT"),
            Self::Read(field) => f.write_str(field.probe_name()),
        }
    }
}

/// What the engine should do this cycle.
#[derive(Debug)]
pub enum Action {
    Connect,
    Command(QueuedCommand),
    Probe(ProbeRequest),
}

/// Invoked once with the fields that stopped being valid on a status change.
pub type StaleCallback = Box<dyn Fn(&[TelemetryField]) + Send + Sync>;

use ProbeRequest::Read;
use TelemetryField as F;

const OFF_PROBES: &[ProbeRequest] = &[ProbeRequest::Connect];

const UNCONNECTED_PROBES: &[ProbeRequest] = &[ProbeRequest::Connect, Read(F::CheckCpldComms)];

const UNPROGRAMMED_PROBES: &[ProbeRequest] = &[Read(F::CheckCpldComms)];

const PROGRAMMED_PROBES: &[ProbeRequest] = &[
    Read(F::CheckCpldComms),
    Read(F::CspRounding),
    Read(F::ChanneliserRounding),
    Read(F::IsProgrammed),
    Read(F::BoardTemperature),
    Read(F::HealthStatus),
    Read(F::PllLocked),
];

const INITIALISED_PROBES: &[ProbeRequest] = &[
    Read(F::CheckCpldComms),
    Read(F::CspRounding),
    Read(F::ChanneliserRounding),
    Read(F::IsProgrammed),
    Read(F::BoardTemperature),
    Read(F::HealthStatus),
    Read(F::PllLocked),
    Read(F::StationId),
    Read(F::AdcRms),
    Read(F::PendingDataRequests),
    Read(F::PpsDelay),
    Read(F::PpsDrift),
    Read(F::PpsDelayCorrection),
    Read(F::IsBeamformerRunning),
    Read(F::FpgaReferenceTime),
    Read(F::PhaseTerminalCount),
    Read(F::PreaduLevels),
    Read(F::StaticDelays),
    Read(F::TileId),
    Read(F::BeamformerTable),
];

const SYNCHRONISED_PROBES: &[ProbeRequest] = &[
    Read(F::CheckCpldComms),
    Read(F::CspRounding),
    Read(F::ChanneliserRounding),
    Read(F::IsProgrammed),
    Read(F::BoardTemperature),
    Read(F::HealthStatus),
    Read(F::PllLocked),
    Read(F::StationId),
    Read(F::AdcRms),
    Read(F::PendingDataRequests),
    Read(F::PpsDelay),
    Read(F::PpsDrift),
    Read(F::PpsDelayCorrection),
    Read(F::IsBeamformerRunning),
    Read(F::FpgaReferenceTime),
    Read(F::PhaseTerminalCount),
    Read(F::PreaduLevels),
    Read(F::StaticDelays),
    Read(F::TileId),
    Read(F::BeamformerTable),
    Read(F::TileBeamformerFrame),
    Read(F::RfiCount),
];

/// Probes polled in round-robin order while the board is in `status`.
pub fn probes_for(status: TpmStatus) -> &'static [ProbeRequest] {
    match status {
        TpmStatus::Off => OFF_PROBES,
        TpmStatus::Unknown | TpmStatus::Unconnected => UNCONNECTED_PROBES,
        TpmStatus::Unprogrammed => UNPROGRAMMED_PROBES,
        TpmStatus::Programmed => PROGRAMMED_PROBES,
        TpmStatus::Initialised => INITIALISED_PROBES,
        TpmStatus::Synchronised => SYNCHRONISED_PROBES,
    }
}

/// Command categories eligible to run in `status`, in priority order.
pub fn categories_for(status: TpmStatus) -> &'static [CommandCategory] {
    const PROGRAMMING: &[CommandCategory] = &[
        CommandCategory::Initialise,
        CommandCategory::DownloadFirmware,
    ];
    match status {
        TpmStatus::Unprogrammed | TpmStatus::Programmed => PROGRAMMING,
        TpmStatus::Initialised | TpmStatus::Synchronised => &CommandCategory::ALL,
        TpmStatus::Unknown | TpmStatus::Off | TpmStatus::Unconnected => &[],
    }
}

/// Decides the single next action of each poll cycle.
pub struct RequestScheduler {
    previous: TpmStatus,
    cursor: usize,
    slots: [Option<QueuedCommand>; 5],
    connect_requested: bool,
    epoch: u64,
    command_timeout: Duration,
    on_stale: Option<StaleCallback>,
}

impl fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("previous", &self.previous)
            .field("cursor", &self.cursor)
            .field("slots", &self.slots)
            .field("connect_requested", &self.connect_requested)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self {
            previous: TpmStatus::Unknown,
            cursor: 0,
            slots: Default::default(),
            connect_requested: false,
            epoch: 0,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            on_stale: None,
        }
    }

    /// Lifetime given to commands queued without an explicit deadline.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_stale_callback(mut self, callback: StaleCallback) -> Self {
        self.on_stale = Some(callback);
        self
    }

    /// Queue a command, displacing any queued command of the same category.
    ///
    /// `deadline` defaults to now plus the command timeout.
    pub fn desire(
        &mut self,
        handler: Box<dyn CommandHandler>,
        deadline: Option<Instant>,
    ) -> CommandHandle {
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.command_timeout);
        let (command, handle) = QueuedCommand::new(handler, deadline);
        self.enqueue(command);
        handle
    }

    /// Start a new engine run and return its number. Commands queued from
    /// now on belong to it.
    pub fn begin_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Put an already created command into its slot.
    pub fn enqueue(&mut self, mut command: QueuedCommand) {
        command.epoch = self.epoch;
        let slot = &mut self.slots[command.category().index()];
        if let Some(displaced) = slot.take() {
            info!(
                "{} {} displaced by {}",
                displaced.handler.name(),
                displaced.id,
                command.id
            );
            displaced.notify(CommandStatus::Aborted, Some("removed from queue".into()));
        }
        command.notify(CommandStatus::Queued, None);
        *slot = Some(command);
    }

    /// Give a command back its slot after it could not run this cycle.
    ///
    /// A newer command of the same category wins; the returned command is
    /// aborted in that case.
    pub fn requeue(&mut self, command: QueuedCommand) {
        let slot = &mut self.slots[command.category().index()];
        if slot.is_some() {
            command.notify(CommandStatus::Aborted, Some("removed from queue".into()));
            return;
        }
        *slot = Some(command);
    }

    /// Ask for a reconnect on the next call, ahead of everything else.
    pub fn desire_connection(&mut self) {
        self.connect_requested = true;
    }

    /// Abort every queued command. Returns how many were aborted.
    pub fn abort_all(&mut self, reason: &str) -> usize {
        self.abort_through(u64::MAX, reason)
    }

    /// Abort the commands queued during run `epoch` or earlier, leaving
    /// those of later runs in place. Returns how many were aborted.
    pub fn abort_through(&mut self, epoch: u64, reason: &str) -> usize {
        let mut aborted = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|command| command.epoch <= epoch) {
                if let Some(command) = slot.take() {
                    command.notify(CommandStatus::Aborted, Some(reason.to_string()));
                    aborted += 1;
                }
            }
        }
        aborted
    }

    /// Whether a command of `category` is waiting.
    pub fn pending(&self, category: CommandCategory) -> bool {
        self.slots[category.index()].is_some()
    }

    /// Record `status`, reporting newly invalid fields and resetting the
    /// round-robin cursor when it differs from the previous one.
    pub fn observe_status(&mut self, status: TpmStatus) {
        if status == self.previous {
            return;
        }
        let now_valid = valid_fields(status);
        let stale: Vec<TelemetryField> = valid_fields(self.previous)
            .into_iter()
            .filter(|field| !now_valid.contains(field))
            .collect();
        debug!(
            "scheduler: {} -> {}, {} stale fields",
            self.previous,
            status,
            stale.len()
        );
        self.previous = status;
        self.cursor = 0;
        if stale.is_empty() {
            return;
        }
        if let Some(callback) = &self.on_stale {
            callback(&stale);
        }
    }

    pub fn next_action(&mut self, status: TpmStatus) -> Option<Action> {
        self.next_action_at(status, Instant::now())
    }

    /// [`RequestScheduler::next_action`] with an explicit clock.
    pub fn next_action_at(&mut self, status: TpmStatus, now: Instant) -> Option<Action> {
        self.expire(now);
        self.observe_status(status);

        if std::mem::take(&mut self.connect_requested) {
            return Some(Action::Connect);
        }

        for category in categories_for(status) {
            if let Some(command) = self.slots[category.index()].take() {
                return Some(Action::Command(command));
            }
        }

        let probes = probes_for(status);
        let probe = probes.get(self.cursor % probes.len().max(1))?;
        self.cursor = (self.cursor + 1) % probes.len();
        Some(Action::Probe(*probe))
    }

    fn expire(&mut self, now: Instant) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|command| command.deadline <= now) {
                if let Some(command) = slot.take() {
                    info!("{} {} expired", command.handler.name(), command.id);
                    command.notify(CommandStatus::Aborted, Some("deadline expired".into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::board::command::{AcquisitionParams, InitialiseParams};
    use crate::board::controller::handlers::{
        DownloadFirmwareCommand, InitialiseCommand, StartAcquisitionCommand,
    };

    fn initialise() -> Box<dyn CommandHandler> {
        Box::new(InitialiseCommand::new(InitialiseParams {
            tile_id: 1,
            station_id: 1,
            pps_delay: 0,
        }))
    }

    fn probe_sequence(scheduler: &mut RequestScheduler, status: TpmStatus, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| match scheduler.next_action(status) {
                Some(Action::Probe(probe)) => probe.to_string(),
                other => panic!("expected probe, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_probe_tables_are_non_empty_and_distinct() {
        for status in TpmStatus::ALL {
            let probes = probes_for(status);
            assert!(!probes.is_empty(), "{status} has no probes");
            for (i, probe) in probes.iter().enumerate() {
                assert!(!probes[i + 1..].contains(probe), "{status} repeats {probe}");
            }
        }
    }

    #[test]
    fn test_round_robin_visits_each_probe_once_per_cycle() {
        for status in TpmStatus::ALL {
            let mut scheduler = RequestScheduler::new();
            let probes = probes_for(status);
            let mut seen = Vec::new();
            for _ in 0..probes.len() {
                match scheduler.next_action(status) {
                    Some(Action::Probe(probe)) => seen.push(probe),
                    other => panic!("expected probe, got {other:?}"),
                }
            }
            assert_eq!(seen, probes.to_vec());
            match scheduler.next_action(status) {
                Some(Action::Probe(probe)) => assert_eq!(probe, probes[0]),
                other => panic!("expected probe, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_programmed_probe_order() {
        let mut scheduler = RequestScheduler::new();
        assert_eq!(
            probe_sequence(&mut scheduler, TpmStatus::Programmed, 8),
            vec![
                "CHECK_CPLD_COMMS",
                "CSP_ROUNDING",
                "CHANNELISER_ROUNDING",
                "IS_PROGRAMMED",
                "CHECK_BOARD_TEMPERATURE",
                "HEALTH_STATUS",
                "PLL_LOCKED",
                "CHECK_CPLD_COMMS",
            ]
        );
    }

    #[test]
    fn test_cursor_resets_on_status_change() {
        let mut scheduler = RequestScheduler::new();
        probe_sequence(&mut scheduler, TpmStatus::Programmed, 3);
        assert_eq!(
            probe_sequence(&mut scheduler, TpmStatus::Initialised, 1),
            vec!["CHECK_CPLD_COMMS"]
        );
    }

    #[test]
    fn test_connect_request_is_consumed_once() {
        let mut scheduler = RequestScheduler::new();
        scheduler.desire_connection();
        assert!(matches!(
            scheduler.next_action(TpmStatus::Unprogrammed),
            Some(Action::Connect)
        ));
        assert_eq!(
            probe_sequence(&mut scheduler, TpmStatus::Unprogrammed, 2),
            vec!["CHECK_CPLD_COMMS", "CHECK_CPLD_COMMS"]
        );
    }

    #[test]
    fn test_same_category_displaces_previous() {
        let mut scheduler = RequestScheduler::new();
        let mut first = scheduler.desire(initialise(), None);
        let mut second = scheduler.desire(initialise(), None);

        assert_eq!(first.try_update().map(|u| u.status), Some(CommandStatus::Queued));
        let aborted = first.try_update().expect("abort notification");
        assert_eq!(aborted.status, CommandStatus::Aborted);
        assert_eq!(aborted.message.as_deref(), Some("removed from queue"));
        assert!(first.try_update().is_none());

        assert_eq!(second.try_update().map(|u| u.status), Some(CommandStatus::Queued));
        match scheduler.next_action(TpmStatus::Programmed) {
            Some(Action::Command(command)) => assert_eq!(command.id, second.id),
            other => panic!("expected command, got {other:?}"),
        }
        assert!(!scheduler.pending(CommandCategory::Initialise));
    }

    #[test]
    fn test_default_deadline_expires_after_sixty_seconds() {
        let mut scheduler = RequestScheduler::new();
        let t0 = Instant::now();
        let mut handle = scheduler.desire(initialise(), None);
        handle.try_update();

        let late = t0 + Duration::from_secs(61);
        assert!(matches!(
            scheduler.next_action_at(TpmStatus::Programmed, late),
            Some(Action::Probe(_))
        ));
        let update = handle.try_update().expect("abort notification");
        assert_eq!(update.status, CommandStatus::Aborted);
        assert_eq!(update.message.as_deref(), Some("deadline expired"));

        for _ in 0..10 {
            assert!(!matches!(
                scheduler.next_action_at(TpmStatus::Programmed, late),
                Some(Action::Command(_))
            ));
        }
    }

    #[test]
    fn test_command_not_returned_before_deadline() {
        let mut scheduler = RequestScheduler::new();
        let t0 = Instant::now();
        scheduler.desire(initialise(), Some(t0 + Duration::from_secs(5)));
        assert!(matches!(
            scheduler.next_action_at(TpmStatus::Programmed, t0 + Duration::from_secs(4)),
            Some(Action::Command(_))
        ));
    }

    #[test]
    fn test_category_eligibility_and_priority() {
        let mut scheduler = RequestScheduler::new();
        scheduler.desire(
            Box::new(StartAcquisitionCommand::new(AcquisitionParams::default())),
            None,
        );
        scheduler.desire(Box::new(DownloadFirmwareCommand::new("tpm.bit")), None);

        // Acquisition waits until the board is initialised.
        match scheduler.next_action(TpmStatus::Programmed) {
            Some(Action::Command(command)) => {
                assert_eq!(command.category(), CommandCategory::DownloadFirmware)
            }
            other => panic!("expected command, got {other:?}"),
        }
        assert!(matches!(
            scheduler.next_action(TpmStatus::Programmed),
            Some(Action::Probe(_))
        ));
        match scheduler.next_action(TpmStatus::Initialised) {
            Some(Action::Command(command)) => {
                assert_eq!(command.category(), CommandCategory::StartAcquisition)
            }
            other => panic!("expected command, got {other:?}"),
        }
        scheduler.desire(initialise(), None);
        assert!(matches!(
            scheduler.next_action(TpmStatus::Unconnected),
            Some(Action::Probe(ProbeRequest::Connect))
        ));
    }

    #[test]
    fn test_stale_fields_reported_once() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let mut scheduler = RequestScheduler::new().with_stale_callback(Box::new(move |fields| {
            sink.lock().unwrap().push(fields.to_vec());
        }));

        scheduler.next_action(TpmStatus::Synchronised);
        scheduler.next_action(TpmStatus::Initialised);
        scheduler.next_action(TpmStatus::Initialised);

        let reported = reported.lock().unwrap();
        assert_eq!(
            *reported,
            vec![vec![
                TelemetryField::TileBeamformerFrame,
                TelemetryField::RfiCount
            ]]
        );
    }

    #[test]
    fn test_abort_all() {
        let mut scheduler = RequestScheduler::new();
        let mut handle = scheduler.desire(initialise(), None);
        scheduler.desire(Box::new(DownloadFirmwareCommand::new("tpm.bit")), None);
        assert_eq!(scheduler.abort_all("engine stopped"), 2);
        handle.try_update();
        assert_eq!(
            handle.try_update().and_then(|u| u.message),
            Some("engine stopped".into())
        );
        assert!(!scheduler.pending(CommandCategory::Initialise));
    }

    #[test]
    fn test_abort_through_spares_later_runs() {
        let mut scheduler = RequestScheduler::new();
        let old_run = scheduler.begin_epoch();
        let mut old = scheduler.desire(Box::new(DownloadFirmwareCommand::new("tpm.bit")), None);
        scheduler.begin_epoch();
        let mut fresh = scheduler.desire(initialise(), None);

        assert_eq!(scheduler.abort_through(old_run, "board engine stopped"), 1);
        old.try_update();
        assert_eq!(
            old.try_update().map(|u| u.status),
            Some(CommandStatus::Aborted)
        );
        fresh.try_update();
        assert!(fresh.try_update().is_none());
        assert!(scheduler.pending(CommandCategory::Initialise));
        assert!(!scheduler.pending(CommandCategory::DownloadFirmware));
    }

    #[test]
    fn test_requeue_loses_to_newer_command() {
        let mut scheduler = RequestScheduler::new();
        let mut first = scheduler.desire(initialise(), None);
        let Some(Action::Command(command)) = scheduler.next_action(TpmStatus::Programmed) else {
            panic!("expected command");
        };
        let second = scheduler.desire(initialise(), None);
        scheduler.requeue(command);

        first.try_update();
        assert_eq!(first.try_update().map(|u| u.status), Some(CommandStatus::Aborted));
        match scheduler.next_action(TpmStatus::Programmed) {
            Some(Action::Command(command)) => assert_eq!(command.id, second.id),
            other => panic!("expected command, got {other:?}"),
        }
    }
}
