// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Connection and polling engine.
//!
//! One background task per board owns the link: it connects with a bounded
//! retry loop, then polls the board every interval, infers its status,
//! refreshes tiered telemetry and performs exactly one scheduler action per
//! cycle. Every hardware access goes through the board's [`HardwareLock`]
//! with a bounded wait, so a busy board costs a skipped cycle, never a stall.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::board::command::{CommandHandle, CommandStatus, CommandUpdate, QueuedCommand};
use crate::board::error::{BoardError, BoardResult};
use crate::board::lock::HardwareLock;
use crate::board::power::BoardConnection;
use crate::board::status::{CommunicationStatus, TpmStatus};
use crate::board::telemetry::{TelemetryCache, TelemetryField, TelemetryValue};
use crate::board::Board;

use super::events::BoardEventEmitter;
use super::handlers::{CommandHandler, ValidationResult};
use super::machine::{infer_status, HardwareFacts, StatusMachine};
use super::policies::{FixedDelay, PollingPolicy, RetryPolicy, TierClock, TieredPolling};
use super::scheduler::{Action, ProbeRequest, RequestScheduler, DEFAULT_COMMAND_TIMEOUT};

/// Configuration for the connection engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub polling: TieredPolling,
    pub retry: FixedDelay,
    /// Longest wait for the hardware lock at any access site.
    pub lock_timeout: Duration,
    pub command_timeout: Duration,
    /// Ids this process stamps on the board when initialising it.
    pub tile_id: u32,
    pub station_id: u32,
    /// Stream status register of each processing half.
    pub stream_status_registers: [String; 2],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            polling: TieredPolling::default(),
            retry: FixedDelay::default(),
            lock_timeout: Duration::from_millis(200),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            tile_id: 0,
            station_id: 0,
            stream_status_registers: [
                "fpga1.dsp_regfile.stream_status.channelizer_vld".to_string(),
                "fpga2.dsp_regfile.stream_status.channelizer_vld".to_string(),
            ],
        }
    }
}

/// Snapshot published by the engine after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardState {
    pub status: TpmStatus,
    /// The engine's own link to the board.
    pub link: CommunicationStatus,
    pub telemetry: TelemetryCache,
    /// Completed poll cycles since the engine was created, skipped ones included.
    pub poll_cycles: u64,
}

struct EngineShared {
    config: EngineConfig,
    board: HardwareLock<Box<dyn Board>>,
    scheduler: Mutex<RequestScheduler>,
    state_tx: Arc<watch::Sender<BoardState>>,
    emitter: Arc<RwLock<BoardEventEmitter>>,
    wake: Notify,
}

impl EngineShared {
    fn scheduler(&self) -> MutexGuard<'_, RequestScheduler> {
        self.scheduler.lock().expect("scheduler mutex poisoned")
    }

    fn emitter(&self) -> BoardEventEmitter {
        self.emitter.read().expect("emitter lock poisoned").clone()
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the exclusive link to one board.
pub struct ConnectionEngine {
    shared: Arc<EngineShared>,
    task: Mutex<Option<RunningTask>>,
}

impl ConnectionEngine {
    pub fn new(
        board: Box<dyn Board>,
        config: EngineConfig,
        emitter: Arc<RwLock<BoardEventEmitter>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(BoardState::default());
        let state_tx = Arc::new(state_tx);

        let stale_tx = state_tx.clone();
        let stale_emitter = emitter.clone();
        let scheduler = RequestScheduler::new()
            .with_command_timeout(config.command_timeout)
            .with_stale_callback(Box::new(move |fields: &[TelemetryField]| {
                stale_tx.send_modify(|state| {
                    state.telemetry.evict(fields);
                });
                let emitter = stale_emitter.read().expect("emitter lock poisoned").clone();
                emitter.notify_telemetry_stale(fields);
            }));

        Self {
            shared: Arc::new(EngineShared {
                config,
                board: HardwareLock::new(board),
                scheduler: Mutex::new(scheduler),
                state_tx,
                emitter,
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the background task. Does nothing while already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().expect("engine task mutex poisoned");
        if task
            .as_ref()
            .is_some_and(|running| !running.cancel.is_cancelled())
        {
            return;
        }
        let previous = task.take().map(|running| running.handle);
        let epoch = self.shared.scheduler().begin_epoch();
        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    error!("Previous board task panicked: {}", e);
                }
            }
            Worker::new(shared, token, epoch).run().await;
        });
        *task = Some(RunningTask { cancel, handle });
    }

    /// Signal the background task to release the board and exit.
    pub fn stop(&self) {
        let task = self.task.lock().expect("engine task mutex poisoned");
        if let Some(running) = task.as_ref() {
            if !running.cancel.is_cancelled() {
                info!("Stopping board engine");
                running.cancel.cancel();
            }
        }
    }

    /// Stop and wait for the background task to finish.
    pub async fn shutdown(&self) {
        let running = self
            .task
            .lock()
            .expect("engine task mutex poisoned")
            .take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                error!("Board task panicked: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("engine task mutex poisoned")
            .as_ref()
            .is_some_and(|running| !running.cancel.is_cancelled())
    }

    pub fn status(&self) -> TpmStatus {
        self.shared.state_tx.borrow().status
    }

    pub fn link(&self) -> CommunicationStatus {
        self.shared.state_tx.borrow().link
    }

    /// Last cached value of `field`, if it is valid under the current status.
    pub fn telemetry(&self, field: TelemetryField) -> Option<TelemetryValue> {
        self.shared.state_tx.borrow().telemetry.get(field).cloned()
    }

    pub fn telemetry_snapshot(&self) -> TelemetryCache {
        self.shared.state_tx.borrow().telemetry.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BoardState> {
        self.shared.state_tx.subscribe()
    }

    /// Direct access to the board, serialized with the engine.
    pub fn hardware_lock(&self) -> HardwareLock<Box<dyn Board>> {
        self.shared.board.clone()
    }

    /// Queue a command. The returned status is `Queued`, or `Failed` when the
    /// command was refused outright.
    pub fn submit(&self, handler: Box<dyn CommandHandler>) -> (CommandStatus, CommandHandle) {
        let deadline = Instant::now() + self.shared.config.command_timeout;
        let (command, handle) = QueuedCommand::new(handler, deadline);

        let refusal = match command.handler.validate_params() {
            ValidationResult::InvalidParams(msg) | ValidationResult::InvalidState(msg) => Some(msg),
            ValidationResult::Ok if !self.is_running() => Some("board engine is not running".into()),
            ValidationResult::Ok => None,
        };
        if let Some(msg) = refusal {
            warn!("{} refused: {}", command.handler.name(), msg);
            self.shared
                .report(&command, CommandStatus::Failed, Some(msg));
            return (CommandStatus::Failed, handle);
        }

        debug!("{} {} queued", command.handler.name(), command.id);
        self.shared.scheduler().enqueue(command);
        self.shared.wake.notify_one();
        (CommandStatus::Queued, handle)
    }

    /// Reconnect on the next poll cycle.
    pub fn request_connection(&self) {
        self.shared.scheduler().desire_connection();
        self.shared.wake.notify_one();
    }

    /// Abort every queued command. Returns how many were aborted.
    pub fn abort_commands(&self) -> usize {
        self.shared.scheduler().abort_all("aborted by request")
    }
}

impl BoardConnection for ConnectionEngine {
    fn start(&self) {
        ConnectionEngine::start(self);
    }

    fn stop(&self) {
        ConnectionEngine::stop(self);
    }
}

impl EngineShared {
    fn report(&self, command: &QueuedCommand, status: CommandStatus, message: Option<String>) {
        let update = CommandUpdate {
            id: command.id,
            category: command.category(),
            status,
            message: message.clone(),
        };
        command.notify(status, message);
        self.emitter().notify_command_update(&update);
    }
}

/// State private to one run of the background task.
struct Worker {
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
    /// Commands queued under a later run belong to the task that follows.
    epoch: u64,
    machine: StatusMachine,
    tiers: TierClock,
    connected: bool,
}

impl Worker {
    fn new(shared: Arc<EngineShared>, cancel: CancellationToken, epoch: u64) -> Self {
        let published = shared.state_tx.borrow().status;
        Self {
            shared,
            cancel,
            epoch,
            machine: StatusMachine::resume(published),
            tiers: TierClock::new(),
            connected: false,
        }
    }

    async fn run(mut self) {
        info!("Board engine started");
        self.set_status(TpmStatus::Unconnected);
        self.set_link(CommunicationStatus::NotEstablished);

        let interval = self.shared.config.polling.interval();
        while !self.cancel.is_cancelled() {
            if !self.connected && !self.connect().await {
                break;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.poll_cycle().await;
            self.shared
                .state_tx
                .send_modify(|state| state.poll_cycles += 1);
            if !self.pause(interval).await {
                break;
            }
        }

        self.teardown().await;
        info!("Board engine stopped");
    }

    /// Connect phase. Returns false when stopped before connecting.
    async fn connect(&mut self) -> bool {
        let retry = &self.shared.config.retry;
        let max = retry.max_attempts();
        loop {
            for attempt in 0..max {
                match self.try_connect().await {
                    Ok(()) => {
                        info!("Connected to board");
                        self.connected = true;
                        self.tiers.reset();
                        self.set_link(CommunicationStatus::Established);
                        return true;
                    }
                    Err(e) => {
                        warn!("Connect attempt {}/{} failed: {}", attempt + 1, max, e);
                        if !retry.should_retry(attempt + 1, &e) {
                            break;
                        }
                        if !self.sleep(retry.delay(attempt)).await {
                            return false;
                        }
                    }
                }
            }
            error!(
                "Board unreachable after {} attempts, retrying in {:?}",
                max,
                retry.cooldown()
            );
            if !self.sleep(retry.cooldown()).await {
                return false;
            }
        }
    }

    async fn try_connect(&self) -> BoardResult<()> {
        let mut board = self
            .shared
            .board
            .try_lock_for(self.shared.config.lock_timeout)
            .await
            .ok_or(BoardError::LockTimeout)?;
        board.connect().await
    }

    async fn poll_cycle(&mut self) {
        let config = &self.shared.config;
        let Some(mut board) = self.shared.board.try_lock_for(config.lock_timeout).await else {
            debug!("Hardware lock busy, skipping poll cycle");
            return;
        };

        if let Err(e) = board.check_communication().await {
            warn!("Lost link to board: {}", e);
            if let Err(e) = board.disconnect().await {
                debug!("Disconnect after link loss failed: {}", e);
            }
            drop(board);
            self.link_lost();
            return;
        }

        let facts = match read_facts(&mut **board, config).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!("Status probe failed: {}", e);
                return;
            }
        };
        let status = infer_status(&facts);

        let mut readings = Vec::new();
        for tier in self.tiers.due(&config.polling, status, Instant::now()) {
            for field in tier.fields() {
                if !field.is_valid_in(status) {
                    continue;
                }
                match board.read_telemetry(*field).await {
                    Ok(value) => readings.push((*field, value)),
                    Err(e) if e.is_not_supported() => debug!("{} not available: {}", field, e),
                    Err(e) => warn!("Reading {} failed: {}", field, e),
                }
            }
        }
        drop(board);

        self.set_status(status);
        self.store(status, readings);
        if self.cancel.is_cancelled() {
            return;
        }
        self.perform_next_action().await;
    }

    async fn perform_next_action(&mut self) {
        let status = self.machine.status();
        let action = {
            let mut scheduler = self.shared.scheduler();
            match scheduler.next_action(status) {
                Some(Action::Command(command)) if command.epoch > self.epoch => {
                    scheduler.requeue(command);
                    return;
                }
                action => action,
            }
        };
        let Some(action) = action else {
            return;
        };
        match action {
            Action::Connect => {
                info!("Reconnect requested");
                if let Some(mut board) = self
                    .shared
                    .board
                    .try_lock_for(self.shared.config.lock_timeout)
                    .await
                {
                    if let Err(e) = board.disconnect().await {
                        debug!("Disconnect before reconnect failed: {}", e);
                    }
                    drop(board);
                    self.link_lost();
                } else {
                    debug!("Hardware lock busy, reconnect postponed");
                    self.shared.scheduler().desire_connection();
                }
            }
            Action::Probe(ProbeRequest::Connect) => {}
            Action::Probe(ProbeRequest::Read(field)) => self.probe(status, field).await,
            Action::Command(command) => self.run_command(status, command).await,
        }
    }

    async fn probe(&mut self, status: TpmStatus, field: TelemetryField) {
        let Some(mut board) = self
            .shared
            .board
            .try_lock_for(self.shared.config.lock_timeout)
            .await
        else {
            debug!("Hardware lock busy, skipping {}", field);
            return;
        };
        let result = board.read_telemetry(field).await;
        drop(board);
        match result {
            Ok(value) => self.store(status, vec![(field, value)]),
            Err(e) if e.is_not_supported() => debug!("{} not available: {}", field, e),
            Err(e) => warn!("Probe {} failed: {}", field, e),
        }
    }

    async fn run_command(&mut self, status: TpmStatus, command: QueuedCommand) {
        let name = command.handler.name();
        match command.handler.can_execute(status) {
            ValidationResult::Ok => {}
            ValidationResult::InvalidState(msg) | ValidationResult::InvalidParams(msg) => {
                warn!("{} blocked: {}", name, msg);
                self.shared.report(&command, CommandStatus::Failed, Some(msg));
                return;
            }
        }

        let Some(mut board) = self
            .shared
            .board
            .try_lock_for(self.shared.config.lock_timeout)
            .await
        else {
            debug!("Hardware lock busy, {} stays queued", name);
            self.shared.scheduler().requeue(command);
            return;
        };

        self.shared.report(&command, CommandStatus::InProgress, None);
        let started = Instant::now();
        let result = command.handler.execute(&mut **board).await;
        drop(board);

        match result {
            Ok(message) => {
                info!("{} completed in {:?}", name, started.elapsed());
                self.shared
                    .report(&command, CommandStatus::Completed, message);
            }
            Err(e) if e.is_not_supported() => {
                warn!("{} rejected: {}", name, e);
                self.shared
                    .report(&command, CommandStatus::Rejected, Some(e.to_string()));
            }
            Err(e) => {
                error!("{} failed: {}", name, e);
                self.shared
                    .report(&command, CommandStatus::Failed, Some(e.to_string()));
            }
        }
    }

    fn store(&self, status: TpmStatus, readings: Vec<(TelemetryField, TelemetryValue)>) {
        if readings.is_empty() {
            return;
        }
        let mut stored = Vec::with_capacity(readings.len());
        self.shared.state_tx.send_modify(|state| {
            for (field, value) in readings {
                if state.telemetry.store(field, value.clone(), status) {
                    stored.push((field, value));
                }
            }
        });
        let emitter = self.shared.emitter();
        for (field, value) in &stored {
            emitter.notify_telemetry_update(*field, value);
        }
    }

    fn set_status(&mut self, status: TpmStatus) {
        // Evict stale fields before anyone sees the new status.
        self.shared.scheduler().observe_status(status);
        if let Some(old) = self.machine.apply(status) {
            info!("Board status {} -> {}", old, status);
            self.shared
                .state_tx
                .send_modify(|state| state.status = status);
            self.shared.emitter().notify_status_change(old, status);
        }
    }

    fn set_link(&self, link: CommunicationStatus) {
        let changed = self.shared.state_tx.send_if_modified(|state| {
            if state.link == link {
                return false;
            }
            state.link = link;
            true
        });
        if changed {
            debug!("Board link {}", link);
            self.shared.emitter().notify_link_change(link);
        }
    }

    fn link_lost(&mut self) {
        self.connected = false;
        self.set_status(TpmStatus::Unconnected);
        self.set_link(CommunicationStatus::NotEstablished);
    }

    /// Sleep unless stopped first. Returns false when stopped.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = time::sleep(duration) => true,
        }
    }

    /// Like [`Worker::sleep`], but also ends early when new work arrives.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = time::sleep(duration) => true,
            _ = self.shared.wake.notified() => true,
        }
    }

    async fn teardown(&mut self) {
        if self.connected {
            match self
                .shared
                .board
                .try_lock_for(self.shared.config.lock_timeout)
                .await
            {
                Some(mut board) => {
                    if let Err(e) = board.disconnect().await {
                        warn!("Disconnect on stop failed: {}", e);
                    }
                }
                None => warn!("Hardware lock busy, leaving board link to its holder"),
            }
            self.connected = false;
        }

        let aborted = self
            .shared
            .scheduler()
            .abort_through(self.epoch, "board engine stopped");
        if aborted > 0 {
            info!("Aborted {} queued commands", aborted);
        }
        self.set_status(TpmStatus::Unconnected);
        let mut cleared = Vec::new();
        self.shared.state_tx.send_modify(|state| {
            cleared = state.telemetry.clear();
        });
        self.shared.emitter().notify_telemetry_stale(&cleared);
        self.set_link(CommunicationStatus::Disabled);
    }
}

/// Gather the hardware facts the status is inferred from.
async fn read_facts(board: &mut dyn Board, config: &EngineConfig) -> BoardResult<HardwareFacts> {
    let mut facts = HardwareFacts {
        communication: CommunicationStatus::Established,
        ..HardwareFacts::unconnected()
    };

    facts.programmed = board.is_programmed().await?;
    if !facts.programmed {
        return Ok(facts);
    }

    let tile_id = board.read_telemetry(TelemetryField::TileId).await?;
    let station_id = board.read_telemetry(TelemetryField::StationId).await?;
    facts.id_matches = tile_id.as_int() == Some(i64::from(config.tile_id))
        && station_id.as_int() == Some(i64::from(config.station_id));
    if !facts.id_matches {
        return Ok(facts);
    }

    for (valid, register) in facts
        .streams_valid
        .iter_mut()
        .zip(&config.stream_status_registers)
    {
        *valid = board.read_register(register).await? != 0;
    }
    Ok(facts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::command::{AntennaBufferParams, CommandCategory, InitialiseParams};
    use crate::board::controller::events::BoardListener;
    use crate::board::controller::handlers::{InitialiseCommand, StartAntennaBufferCommand};
    use crate::board::{BoardAccessMethod, BoardFuture, BoardInfo};

    #[derive(Debug, Default)]
    struct FakeHardware {
        reachable: bool,
        programmed: bool,
        tile_id: i64,
        station_id: i64,
        streams: [u32; 2],
        connects: u32,
    }

    struct FakeBoard {
        info: BoardInfo,
        hw: Arc<Mutex<FakeHardware>>,
        connected: bool,
    }

    impl FakeBoard {
        fn new(hw: Arc<Mutex<FakeHardware>>) -> Box<dyn Board> {
            Box::new(Self {
                info: BoardInfo {
                    manufacturer: "Test".into(),
                    model: "fake".into(),
                    revision: "1".into(),
                    access: BoardAccessMethod::Simulated,
                },
                hw,
                connected: false,
            })
        }

        fn check(&self) -> BoardResult<()> {
            if self.connected && self.hw.lock().unwrap().reachable {
                Ok(())
            } else {
                Err(BoardError::connectivity("no reply"))
            }
        }
    }

    impl Board for FakeBoard {
        fn info(&self) -> &BoardInfo {
            &self.info
        }

        fn connect<'a>(&'a mut self) -> BoardFuture<'a, ()> {
            Box::pin(async move {
                let mut hw = self.hw.lock().unwrap();
                hw.connects += 1;
                if !hw.reachable {
                    return Err(BoardError::connectivity("unreachable"));
                }
                self.connected = true;
                Ok(())
            })
        }

        fn disconnect<'a>(&'a mut self) -> BoardFuture<'a, ()> {
            Box::pin(async move {
                self.connected = false;
                Ok(())
            })
        }

        fn check_communication<'a>(&'a mut self) -> BoardFuture<'a, ()> {
            Box::pin(async move { self.check() })
        }

        fn is_programmed<'a>(&'a mut self) -> BoardFuture<'a, bool> {
            Box::pin(async move {
                self.check()?;
                Ok(self.hw.lock().unwrap().programmed)
            })
        }

        fn read_register<'a>(&'a mut self, name: &'a str) -> BoardFuture<'a, u32> {
            Box::pin(async move {
                self.check()?;
                let hw = self.hw.lock().unwrap();
                Ok(if name.starts_with("fpga1") {
                    hw.streams[0]
                } else {
                    hw.streams[1]
                })
            })
        }

        fn write_register<'a>(&'a mut self, _name: &'a str, _value: u32) -> BoardFuture<'a, ()> {
            Box::pin(async move { self.check() })
        }

        fn read_address<'a>(&'a mut self, _address: u32, words: usize) -> BoardFuture<'a, Vec<u32>> {
            Box::pin(async move {
                self.check()?;
                Ok(vec![0; words])
            })
        }

        fn write_address<'a>(&'a mut self, _address: u32, _values: &'a [u32]) -> BoardFuture<'a, ()> {
            Box::pin(async move { self.check() })
        }

        fn read_telemetry<'a>(
            &'a mut self,
            field: TelemetryField,
        ) -> BoardFuture<'a, TelemetryValue> {
            Box::pin(async move {
                self.check()?;
                let hw = self.hw.lock().unwrap();
                Ok(match field {
                    TelemetryField::TileId => TelemetryValue::Int(hw.tile_id),
                    TelemetryField::StationId => TelemetryValue::Int(hw.station_id),
                    _ => TelemetryValue::Float(1.0),
                })
            })
        }

        fn initialise<'a>(&'a mut self, params: &'a InitialiseParams) -> BoardFuture<'a, ()> {
            Box::pin(async move {
                self.check()?;
                let mut hw = self.hw.lock().unwrap();
                hw.tile_id = i64::from(params.tile_id);
                hw.station_id = i64::from(params.station_id);
                Ok(())
            })
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            polling: TieredPolling::new(
                Duration::from_millis(20),
                Duration::from_millis(100),
                Duration::from_millis(300),
            ),
            retry: FixedDelay::new(3, Duration::from_millis(10), Duration::from_millis(50)),
            lock_timeout: Duration::from_millis(50),
            tile_id: 1,
            station_id: 2,
            ..EngineConfig::default()
        }
    }

    fn engine_with(hw: FakeHardware) -> (ConnectionEngine, Arc<Mutex<FakeHardware>>) {
        let hw = Arc::new(Mutex::new(hw));
        let engine = ConnectionEngine::new(
            FakeBoard::new(hw.clone()),
            test_config(),
            Arc::new(RwLock::new(BoardEventEmitter::new())),
        );
        (engine, hw)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<BoardState>,
        what: impl Fn(&BoardState) -> bool,
    ) -> BoardState {
        time::timeout(Duration::from_secs(5), async {
            loop {
                let state = rx.borrow_and_update().clone();
                if what(&state) {
                    return state;
                }
                rx.changed().await.expect("engine state sender alive");
            }
        })
        .await
        .expect("engine reached expected state")
    }

    fn programmed_board() -> FakeHardware {
        FakeHardware {
            reachable: true,
            programmed: true,
            ..FakeHardware::default()
        }
    }

    #[tokio::test]
    async fn test_connects_and_infers_synchronised() {
        let (engine, _hw) = engine_with(FakeHardware {
            tile_id: 1,
            station_id: 2,
            streams: [1, 1],
            ..programmed_board()
        });
        let mut rx = engine.subscribe();
        engine.start();

        let state = wait_for(&mut rx, |s| s.status == TpmStatus::Synchronised).await;
        assert_eq!(state.link, CommunicationStatus::Established);
        let state = wait_for(&mut rx, |s| s.telemetry.get(TelemetryField::Voltage).is_some()).await;
        assert_eq!(
            state.telemetry.get(TelemetryField::Voltage),
            Some(&TelemetryValue::Float(1.0))
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_board_keeps_retrying() {
        let (engine, hw) = engine_with(FakeHardware::default());
        let mut rx = engine.subscribe();
        engine.start();

        wait_for(&mut rx, |s| s.status == TpmStatus::Unconnected).await;
        time::sleep(Duration::from_millis(200)).await;
        assert!(hw.lock().unwrap().connects >= 4);
        assert_eq!(engine.status(), TpmStatus::Unconnected);
        assert_eq!(engine.link(), CommunicationStatus::NotEstablished);

        hw.lock().unwrap().reachable = true;
        wait_for(&mut rx, |s| s.status == TpmStatus::Unprogrammed).await;
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rounds_pause_for_cooldown() {
        let (engine, hw) = engine_with(FakeHardware::default());
        let connects = || hw.lock().unwrap().connects;
        let started = Instant::now();
        engine.start();

        // Attempts at 0, 10 and 20 ms, then 50 ms of cooldown.
        time::sleep_until(started + Duration::from_millis(30)).await;
        assert_eq!(connects(), 3);
        time::sleep_until(started + Duration::from_millis(65)).await;
        assert_eq!(connects(), 3);
        assert_eq!(engine.link(), CommunicationStatus::NotEstablished);
        time::sleep_until(started + Duration::from_millis(95)).await;
        assert_eq!(connects(), 6);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_loss_returns_to_unconnected_and_evicts() {
        let (engine, hw) = engine_with(programmed_board());
        let mut rx = engine.subscribe();
        engine.start();

        wait_for(&mut rx, |s| {
            s.status == TpmStatus::Programmed && s.telemetry.get(TelemetryField::Voltage).is_some()
        })
        .await;
        hw.lock().unwrap().reachable = false;

        let state = wait_for(&mut rx, |s| s.status == TpmStatus::Unconnected).await;
        assert_eq!(state.link, CommunicationStatus::NotEstablished);
        assert!(state.telemetry.get(TelemetryField::Voltage).is_none());

        hw.lock().unwrap().reachable = true;
        wait_for(&mut rx, |s| s.status == TpmStatus::Programmed).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_held_lock_costs_one_skipped_cycle() {
        let (engine, _hw) = engine_with(programmed_board());
        let mut rx = engine.subscribe();
        engine.start();
        wait_for(&mut rx, |s| s.status == TpmStatus::Programmed).await;

        let lock = engine.hardware_lock();
        let held = lock.try_lock_for(Duration::from_secs(1)).await.expect("lock");
        let before = engine.subscribe().borrow().poll_cycles;
        let started = std::time::Instant::now();
        wait_for(&mut rx, |s| s.poll_cycles >= before + 2).await;
        // Two cycles, each at most interval + lock timeout.
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(engine.status(), TpmStatus::Programmed);
        drop(held);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialise_command_completes() {
        let (engine, _hw) = engine_with(programmed_board());
        let mut rx = engine.subscribe();
        engine.start();
        wait_for(&mut rx, |s| s.status == TpmStatus::Programmed).await;

        let (status, mut handle) = engine.submit(Box::new(InitialiseCommand::new(InitialiseParams {
            tile_id: 1,
            station_id: 2,
            pps_delay: 0,
        })));
        assert_eq!(status, CommandStatus::Queued);
        assert_eq!(handle.category, CommandCategory::Initialise);

        let mut seen = Vec::new();
        while let Some(update) = time::timeout(Duration::from_secs(5), handle.next_update())
            .await
            .expect("command update")
        {
            seen.push(update.status);
            if update.status.is_terminal() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                CommandStatus::Queued,
                CommandStatus::InProgress,
                CommandStatus::Completed
            ]
        );
        wait_for(&mut rx, |s| s.status == TpmStatus::Initialised).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_command_is_rejected() {
        let (engine, _hw) = engine_with(FakeHardware {
            tile_id: 1,
            station_id: 2,
            ..programmed_board()
        });
        let mut rx = engine.subscribe();
        engine.start();
        wait_for(&mut rx, |s| s.status == TpmStatus::Initialised).await;

        let (_, mut handle) = engine.submit(Box::new(StartAntennaBufferCommand::new(
            AntennaBufferParams {
                antennas: vec![0, 1],
                start_address: 0,
                max_size: 1024,
            },
        )));
        let update = time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("terminal update")
            .expect("update");
        assert_eq!(update.status, CommandStatus::Rejected);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_while_stopped_fails() {
        let (engine, _hw) = engine_with(programmed_board());
        let (status, mut handle) = engine.submit(Box::new(InitialiseCommand::new(InitialiseParams {
            tile_id: 1,
            station_id: 2,
            pps_delay: 0,
        })));
        assert_eq!(status, CommandStatus::Failed);
        assert_eq!(
            handle.try_update().map(|u| u.status),
            Some(CommandStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_stop_releases_and_restart_reconnects() {
        let (engine, hw) = engine_with(programmed_board());
        let mut rx = engine.subscribe();
        engine.start();
        engine.start();
        wait_for(&mut rx, |s| s.status == TpmStatus::Programmed).await;

        engine.stop();
        engine.stop();
        let state = wait_for(&mut rx, |s| s.link == CommunicationStatus::Disabled).await;
        assert_eq!(state.status, TpmStatus::Unconnected);
        assert!(state.telemetry.is_empty());
        assert!(!engine.is_running());

        engine.start();
        wait_for(&mut rx, |s| s.status == TpmStatus::Programmed).await;
        assert_eq!(hw.lock().unwrap().connects, 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_command_submitted_after_restart_runs() {
        let (engine, _hw) = engine_with(programmed_board());
        let mut rx = engine.subscribe();
        engine.start();
        wait_for(&mut rx, |s| s.status == TpmStatus::Programmed).await;

        for _ in 0..5 {
            engine.stop();
            engine.start();
            assert!(engine.is_running());

            let (status, mut handle) =
                engine.submit(Box::new(InitialiseCommand::new(InitialiseParams {
                    tile_id: 1,
                    station_id: 2,
                    pps_delay: 0,
                })));
            assert_eq!(status, CommandStatus::Queued);
            let update = time::timeout(Duration::from_secs(5), handle.wait())
                .await
                .expect("terminal update")
                .expect("update");
            assert_eq!(
                update.status,
                CommandStatus::Completed,
                "{:?}",
                update.message
            );
        }
        engine.shutdown().await;
    }

    #[derive(Default)]
    struct StaleRecorder(Mutex<Vec<TelemetryField>>);

    impl BoardListener for StaleRecorder {
        fn on_telemetry_stale(&self, fields: &[TelemetryField]) {
            self.0.lock().unwrap().extend_from_slice(fields);
        }
    }

    #[tokio::test]
    async fn test_stop_reports_every_dropped_field() {
        let stale = Arc::new(StaleRecorder::default());
        let mut emitter = BoardEventEmitter::new();
        emitter.register(stale.clone());
        let engine = ConnectionEngine::new(
            FakeBoard::new(Arc::new(Mutex::new(programmed_board()))),
            test_config(),
            Arc::new(RwLock::new(emitter)),
        );
        let mut rx = engine.subscribe();
        engine.start();

        let state = wait_for(&mut rx, |s| {
            s.status == TpmStatus::Programmed
                && s.telemetry.get(TelemetryField::CheckCpldComms).is_some()
                && s.telemetry.get(TelemetryField::Voltage).is_some()
        })
        .await;
        engine.shutdown().await;
        assert!(engine.telemetry_snapshot().is_empty());

        let reported = stale.0.lock().unwrap().clone();
        for field in state.telemetry.fields() {
            assert!(reported.contains(&field), "{field} dropped silently");
        }
        // Still valid while unconnected, so only the final clear reports it.
        assert_eq!(
            reported
                .iter()
                .filter(|f| **f == TelemetryField::CheckCpldComms)
                .count(),
            1
        );
    }
}
