// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Long-running command requests and their completion notifications.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::controller::handlers::CommandHandler;

pub type CommandId = Uuid;

/// Commands are grouped into fixed categories; at most one command per
/// category is queued at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCategory {
    Initialise,
    DownloadFirmware,
    StartAcquisition,
    StartAntennaBuffer,
    ReadAntennaBuffer,
}

impl CommandCategory {
    /// All categories in scheduling priority order.
    pub const ALL: [CommandCategory; 5] = [
        CommandCategory::Initialise,
        CommandCategory::DownloadFirmware,
        CommandCategory::StartAcquisition,
        CommandCategory::StartAntennaBuffer,
        CommandCategory::ReadAntennaBuffer,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Initialise => 0,
            Self::DownloadFirmware => 1,
            Self::StartAcquisition => 2,
            Self::StartAntennaBuffer => 3,
            Self::ReadAntennaBuffer => 4,
        }
    }
}

impl fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialise => write!(f, "Initialise"),
            Self::DownloadFirmware => write!(f, "DownloadFirmware"),
            Self::StartAcquisition => write!(f, "StartAcquisition"),
            Self::StartAntennaBuffer => write!(f, "StartAntennaBuffer"),
            Self::ReadAntennaBuffer => write!(f, "ReadAntennaBuffer"),
        }
    }
}

/// Lifecycle of a submitted command as seen by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    /// Displaced by a newer command, explicitly aborted, or past its deadline.
    Aborted,
    /// The board does not support the operation.
    Rejected,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress)
    }
}

/// Notification sent on a command's channel each time its status changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandUpdate {
    pub id: CommandId,
    pub category: CommandCategory,
    pub status: CommandStatus,
    pub message: Option<String>,
}

/// Parameters for [`CommandCategory::Initialise`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialiseParams {
    pub tile_id: u32,
    pub station_id: u32,
    pub pps_delay: i32,
}

/// Parameters for [`CommandCategory::StartAcquisition`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionParams {
    /// Unix time to start at; `None` starts at the next PPS.
    pub start_time: Option<u64>,
    /// Delay in frames added to `start_time`.
    pub delay: u32,
}

/// Parameters for [`CommandCategory::StartAntennaBuffer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntennaBufferParams {
    pub antennas: Vec<u8>,
    pub start_address: u32,
    pub max_size: u32,
}

/// Sending half of a command's notification channel.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    id: CommandId,
    category: CommandCategory,
    tx: mpsc::UnboundedSender<CommandUpdate>,
}

impl CommandNotifier {
    pub fn notify(&self, status: CommandStatus, message: Option<String>) {
        // The caller may have dropped its handle; that is not our concern.
        let _ = self.tx.send(CommandUpdate {
            id: self.id,
            category: self.category,
            status,
            message,
        });
    }
}

/// Caller side of a submitted command.
#[derive(Debug)]
pub struct CommandHandle {
    pub id: CommandId,
    pub category: CommandCategory,
    rx: mpsc::UnboundedReceiver<CommandUpdate>,
}

impl CommandHandle {
    /// Wait for the next status update; `None` once the engine dropped the command.
    pub async fn next_update(&mut self) -> Option<CommandUpdate> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`CommandHandle::next_update`].
    pub fn try_update(&mut self) -> Option<CommandUpdate> {
        self.rx.try_recv().ok()
    }

    /// Wait until the command reaches a terminal status.
    pub async fn wait(&mut self) -> Option<CommandUpdate> {
        while let Some(update) = self.rx.recv().await {
            if update.status.is_terminal() {
                return Some(update);
            }
        }
        None
    }
}

/// A command waiting in its category slot.
#[derive(Debug)]
pub struct QueuedCommand {
    pub id: CommandId,
    pub handler: Box<dyn CommandHandler>,
    pub deadline: Instant,
    /// Engine run the command was queued under.
    pub(crate) epoch: u64,
    notifier: CommandNotifier,
}

impl QueuedCommand {
    pub fn new(handler: Box<dyn CommandHandler>, deadline: Instant) -> (Self, CommandHandle) {
        let id = Uuid::new_v4();
        let category = handler.category();
        let (tx, rx) = mpsc::unbounded_channel();
        let command = Self {
            id,
            handler,
            deadline,
            epoch: 0,
            notifier: CommandNotifier { id, category, tx },
        };
        let handle = CommandHandle { id, category, rx };
        (command, handle)
    }

    pub fn category(&self) -> CommandCategory {
        self.handler.category()
    }

    pub fn notify(&self, status: CommandStatus, message: Option<String>) {
        self.notifier.notify(status, message);
    }

    pub fn notifier(&self) -> &CommandNotifier {
        &self.notifier
    }
}
