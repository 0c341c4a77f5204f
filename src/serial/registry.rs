//! # Link Registry
//!
//! Owns every board [`Link`] keyed by logical board name. This is the only
//! path through which commands reach hardware.
//!
//! Each board sits behind its own `tokio::sync::Mutex`, which is FIFO fair:
//! dispatches to the same board run one at a time in arrival order, while
//! dispatches to different boards never wait on each other.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::port_trait::PortOpener;
use super::{CloseHandle, Link, LinkState, DEFAULT_BAUD_RATE, DEFAULT_SETTLE_TIME};
use crate::config::{BoardConfig, SerialConfig};
use crate::error::{DispatchError, LinkError, RegistryError};
use crate::firmware::{FirmwareUploader, UploadOutcome};
use crate::wire::Command;

/// Connection parameters shared by every link in a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Baud rate for boards that do not set their own
    pub baud_rate: u32,
    /// Delay after opening a port before it is usable
    pub settle: Duration,
    /// Acknowledgement wait used by [`LinkRegistry::dispatch`]
    pub ack_timeout: Option<Duration>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            settle: DEFAULT_SETTLE_TIME,
            ack_timeout: None,
        }
    }
}

impl From<&SerialConfig> for LinkSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            settle: Duration::from_millis(config.settle_ms),
            ack_timeout: match config.ack_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }
}

/// Point-in-time view of one registered board
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardStatus {
    pub name: String,
    pub address: String,
    pub baud_rate: u32,
    pub state: LinkState,
}

/// Outcome of [`LinkRegistry::sync`]
#[derive(Debug, Default)]
pub struct SyncSummary {
    /// Boards registered by this sync (not yet connected)
    pub added: Vec<String>,
    /// Boards closed and removed by this sync
    pub removed: Vec<String>,
    /// Boards from the list that could not be registered
    pub rejected: Vec<RegistryError>,
}

struct BoardSlot {
    config: BoardConfig,
    baud_rate: u32,
    link: Mutex<Link>,
    state: watch::Receiver<LinkState>,
    closer: CloseHandle,
    /// Set once the slot has left the registry
    retired: AtomicBool,
}

impl BoardSlot {
    fn is_connected(&self) -> bool {
        *self.state.borrow() == LinkState::Connected
    }

    /// Open this board's link unless the slot was deregistered first
    async fn connect(&self, opener: &dyn PortOpener, settle: Duration) -> Result<(), RegistryError> {
        let name = &self.config.name;
        let mut link = self.link.lock().await;

        // Deregister may have run while we waited for the lock
        if self.retired.load(Ordering::Acquire) {
            debug!("Connect of deregistered board {} skipped", name);
            return Err(RegistryError::UnknownBoard(name.clone()));
        }

        link.connect(opener, settle)
            .await
            .map_err(|source| RegistryError::Link {
                board: name.clone(),
                source,
            })
    }
}

/// Board name to [`Link`] map with per-board dispatch serialization
pub struct LinkRegistry {
    boards: RwLock<HashMap<String, Arc<BoardSlot>>>,
    opener: Arc<dyn PortOpener>,
    settings: LinkSettings,
}

impl LinkRegistry {
    /// Create an empty registry
    ///
    /// # Arguments
    ///
    /// * `opener` - Transport factory used for every connect and reconnect
    /// * `settings` - Default baud rate, settle delay and ack timeout
    pub fn new(opener: Arc<dyn PortOpener>, settings: LinkSettings) -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            opener,
            settings,
        }
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Register a board without connecting it
    ///
    /// # Errors
    ///
    /// - `DuplicateName`: a board with this name is already registered
    /// - `AddressInUse`: another board already claims this address
    pub async fn register(&self, config: BoardConfig) -> Result<(), RegistryError> {
        let mut boards = self.boards.write().await;

        if boards.contains_key(&config.name) {
            return Err(RegistryError::DuplicateName(config.name));
        }
        if let Some(owner) = boards.values().find(|slot| slot.config.address == config.address) {
            return Err(RegistryError::AddressInUse {
                address: config.address,
                owner: owner.config.name.clone(),
            });
        }

        let baud_rate = config.baud_rate.unwrap_or(self.settings.baud_rate);
        let link = Link::new(config.address.clone(), baud_rate);
        let slot = BoardSlot {
            state: link.watch_state(),
            closer: link.close_handle(),
            retired: AtomicBool::new(false),
            link: Mutex::new(link),
            baud_rate,
            config,
        };

        info!(
            "Registered board {} at {} ({} baud)",
            slot.config.name, slot.config.address, baud_rate
        );
        boards.insert(slot.config.name.clone(), Arc::new(slot));
        Ok(())
    }

    /// Connect a board, including the settle delay
    ///
    /// Works from any state. A connected board is closed and reopened.
    ///
    /// # Errors
    ///
    /// - `UnknownBoard`: no board with this name, or it was deregistered before the connect started
    /// - `Link`: the port could not be opened, or the board was deregistered while settling
    pub async fn connect(&self, name: &str) -> Result<(), RegistryError> {
        let slot = self
            .slot(name)
            .await
            .ok_or_else(|| RegistryError::UnknownBoard(name.to_string()))?;

        slot.connect(self.opener.as_ref(), self.settings.settle).await
    }

    /// Explicitly recover a faulted (or any) link
    pub async fn reconnect(&self, name: &str) -> Result<(), RegistryError> {
        info!("Reconnecting board {}", name);
        self.connect(name).await
    }

    /// Connect every registered board that is not already connected
    ///
    /// Boards connect concurrently, so the settle delays overlap. Failures
    /// are logged and returned, sorted by board name; they never stop the
    /// remaining boards.
    pub async fn connect_all(&self) -> Vec<RegistryError> {
        let pending: Vec<Arc<BoardSlot>> = self
            .boards
            .read()
            .await
            .values()
            .filter(|slot| !slot.is_connected())
            .cloned()
            .collect();

        let mut join_set = JoinSet::new();
        for slot in pending {
            let opener = self.opener.clone();
            let settle = self.settings.settle;
            join_set.spawn(async move {
                let result = slot.connect(opener.as_ref(), settle).await;
                (slot.config.name.clone(), result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    warn!("{}", e);
                    failures.push((name, e));
                }
                Err(e) => warn!("Connect task failed: {}", e),
            }
        }

        failures.sort_by(|a, b| a.0.cmp(&b.0));
        failures.into_iter().map(|(_, e)| e).collect()
    }

    /// Send a command using the registry's default ack timeout
    ///
    /// # Errors
    ///
    /// - `UnknownBoard`: no board with this name
    /// - `NotConnected`: the board's link is not `Connected`
    /// - `Link`: the link reported a failure
    pub async fn dispatch(&self, name: &str, command: &Command) -> Result<(), DispatchError> {
        self.dispatch_with_timeout(name, command, self.settings.ack_timeout)
            .await
    }

    /// Send a command with a per-call ack timeout (`None` = fire and forget)
    pub async fn dispatch_with_timeout(
        &self,
        name: &str,
        command: &Command,
        ack_timeout: Option<Duration>,
    ) -> Result<(), DispatchError> {
        let slot = self
            .slot(name)
            .await
            .ok_or_else(|| DispatchError::UnknownBoard(name.to_string()))?;

        // Fail fast instead of queueing behind a connect that is settling
        if !slot.is_connected() {
            return Err(DispatchError::NotConnected(name.to_string()));
        }

        let mut link = slot.link.lock().await;
        if link.state() != LinkState::Connected {
            return Err(DispatchError::NotConnected(name.to_string()));
        }

        link.send(command, ack_timeout)
            .await
            .map_err(|source| match source {
                LinkError::NotConnected => DispatchError::NotConnected(name.to_string()),
                source => DispatchError::Link {
                    board: name.to_string(),
                    source,
                },
            })
    }

    /// Close a board's link and forget it. Unknown names are a no-op.
    ///
    /// Any dispatch waiting for an acknowledgement on this board is cancelled
    /// with `LinkError::Closed` before the link lock is taken.
    pub async fn deregister(&self, name: &str) {
        let removed = self.boards.write().await.remove(name);
        let Some(slot) = removed else {
            debug!("Deregister of unknown board {} ignored", name);
            return;
        };

        slot.retired.store(true, Ordering::Release);
        slot.closer.request_close();
        slot.link.lock().await.close().await;
        info!("Deregistered board {}", name);
    }

    /// Make the registry match a board list
    ///
    /// Boards missing from `boards`, or whose address or baud rate changed,
    /// are deregistered. New boards are registered but not connected.
    pub async fn sync(&self, boards: &[BoardConfig]) -> SyncSummary {
        let mut summary = SyncSummary::default();

        let current: Vec<(String, BoardConfig)> = self
            .boards
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), slot.config.clone()))
            .collect();

        for (name, config) in &current {
            let keep = boards.iter().any(|wanted| wanted == config);
            if !keep {
                self.deregister(name).await;
                summary.removed.push(name.clone());
            }
        }

        for wanted in boards {
            let unchanged = current
                .iter()
                .any(|(name, config)| name == &wanted.name && config == wanted);
            if unchanged {
                continue;
            }
            match self.register(wanted.clone()).await {
                Ok(()) => summary.added.push(wanted.name.clone()),
                Err(e) => {
                    warn!("Board sync: {}", e);
                    summary.rejected.push(e);
                }
            }
        }

        summary
    }

    /// Status of every registered board, sorted by name
    pub async fn boards(&self) -> Vec<BoardStatus> {
        let boards = self.boards.read().await;
        let mut status: Vec<BoardStatus> = boards
            .values()
            .map(|slot| BoardStatus {
                name: slot.config.name.clone(),
                address: slot.config.address.clone(),
                baud_rate: slot.baud_rate,
                state: *slot.state.borrow(),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Current state of one board, `None` if unknown
    pub async fn state(&self, name: &str) -> Option<LinkState> {
        let slot = self.slot(name).await?;
        let state = *slot.state.borrow();
        Some(state)
    }

    /// Watch one board's state transitions
    pub async fn watch_state(&self, name: &str) -> Option<watch::Receiver<LinkState>> {
        self.slot(name).await.map(|slot| slot.state.clone())
    }

    /// Close and remove every board
    pub async fn shutdown(&self) {
        for name in self.names().await {
            self.deregister(&name).await;
        }
    }

    /// Flash new firmware onto a board
    ///
    /// The board's link is closed for the duration of the upload so the
    /// uploader can own the serial port. If the board was connected before,
    /// it is reconnected afterwards, whether or not the upload succeeded.
    ///
    /// # Errors
    ///
    /// - `UnknownBoard`: no board with this name
    /// - `Upload`: the uploader failed
    /// - `Link`: the upload succeeded but the board could not be reconnected
    pub async fn upload_firmware(
        &self,
        name: &str,
        artifact: &Path,
        uploader: &dyn FirmwareUploader,
    ) -> Result<UploadOutcome, RegistryError> {
        let slot = self
            .slot(name)
            .await
            .ok_or_else(|| RegistryError::UnknownBoard(name.to_string()))?;

        slot.closer.request_close();
        let mut link = slot.link.lock().await;
        let was_connected = link.state() == LinkState::Connected;
        link.close().await;

        info!("Uploading {} to board {}", artifact.display(), name);
        let outcome = uploader.upload(&slot.config.address, artifact).await;

        let reconnect = if was_connected {
            link.connect(self.opener.as_ref(), self.settings.settle).await
        } else {
            Ok(())
        };

        let outcome = outcome.map_err(|source| RegistryError::Upload {
            board: name.to_string(),
            source,
        })?;
        reconnect.map_err(|source| RegistryError::Link {
            board: name.to_string(),
            source,
        })?;

        info!("Firmware upload to {} finished", name);
        Ok(outcome)
    }

    async fn slot(&self, name: &str) -> Option<Arc<BoardSlot>> {
        self.boards.read().await.get(name).cloned()
    }

    async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.boards.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::super::port_trait::mocks::{MockOpener, MockSerialPort};
    use super::*;
    use crate::error::UploadError;
    use crate::firmware::MockFirmwareUploader;
    use crate::wire::PinId;
    use std::io;

    fn pin(name: &str) -> PinId {
        PinId::new(name).unwrap()
    }

    fn board(name: &str, address: &str) -> BoardConfig {
        BoardConfig {
            name: name.to_string(),
            address: address.to_string(),
            baud_rate: None,
        }
    }

    fn fast_settings() -> LinkSettings {
        LinkSettings {
            settle: Duration::ZERO,
            ..LinkSettings::default()
        }
    }

    fn registry_with(opener: &MockOpener, settings: LinkSettings) -> LinkRegistry {
        LinkRegistry::new(Arc::new(opener.clone()), settings)
    }

    async fn connected_board(
        registry: &LinkRegistry,
        opener: &MockOpener,
        name: &str,
        address: &str,
        port: MockSerialPort,
    ) -> MockSerialPort {
        let port = opener.add_port(address, port);
        registry.register(board(name, address)).await.unwrap();
        registry.connect(name).await.unwrap();
        port
    }

    // ==================== Registration Tests ====================

    #[tokio::test]
    async fn test_register_duplicate_name() {
        let registry = registry_with(&MockOpener::new(), fast_settings());
        registry.register(board("rig1", "/dev/ttyA")).await.unwrap();

        let result = registry.register(board("rig1", "/dev/ttyB")).await;
        assert!(matches!(result, Err(RegistryError::DuplicateName(name)) if name == "rig1"));
    }

    #[tokio::test]
    async fn test_register_address_in_use() {
        let registry = registry_with(&MockOpener::new(), fast_settings());
        registry.register(board("rig1", "/dev/ttyA")).await.unwrap();

        match registry.register(board("rig2", "/dev/ttyA")).await {
            Err(RegistryError::AddressInUse { address, owner }) => {
                assert_eq!(address, "/dev/ttyA");
                assert_eq!(owner, "rig1");
            }
            other => panic!("Expected AddressInUse, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registered_board_starts_disconnected() {
        let registry = registry_with(&MockOpener::new(), fast_settings());
        registry
            .register(BoardConfig {
                baud_rate: Some(9600),
                ..board("rig1", "/dev/ttyA")
            })
            .await
            .unwrap();

        let status = registry.boards().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, LinkState::Disconnected);
        assert_eq!(status[0].baud_rate, 9600);
    }

    // ==================== Dispatch Tests ====================

    #[tokio::test]
    async fn test_dispatch_unknown_board() {
        let registry = registry_with(&MockOpener::new(), fast_settings());
        let result = registry.dispatch("nonexistent", &Command::test(pin("13"))).await;
        assert!(matches!(result, Err(DispatchError::UnknownBoard(name)) if name == "nonexistent"));
    }

    #[tokio::test]
    async fn test_dispatch_not_connected() {
        let registry = registry_with(&MockOpener::new(), fast_settings());
        registry.register(board("rig1", "/dev/ttyA")).await.unwrap();

        let result = registry.dispatch("rig1", &Command::test(pin("13"))).await;
        assert!(matches!(result, Err(DispatchError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order() {
        let opener = MockOpener::new();
        let registry = registry_with(&opener, fast_settings());
        let port = connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;

        registry.dispatch("rig1", &Command::digital(pin("8"), true)).await.unwrap();
        registry.dispatch("rig1", &Command::stepper(vec![pin("2"), pin("3")], 200, 60)).await.unwrap();

        assert_eq!(port.written_frames(), vec!["DIGITAL:8:1", "STEPPER:2,3:200:60"]);
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_do_not_interleave() {
        let opener = MockOpener::new();
        let registry = Arc::new(registry_with(&opener, fast_settings()));
        let port = connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let cmd = Command::Pwm { pin: pin("9"), duty: i };
                registry.dispatch("rig1", &cmd).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let frames = port.get_written_data();
        assert_eq!(frames.len(), 20);
        for frame in frames {
            assert!(frame.starts_with(b"PWM:9:"));
            assert_eq!(frame.last(), Some(&b'\n'));
        }
    }

    #[tokio::test]
    async fn test_slow_board_does_not_block_other_board() {
        let opener = MockOpener::new();
        let registry = Arc::new(registry_with(&opener, fast_settings()));
        // rig1 never acknowledges
        connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;
        let fast = connected_board(&registry, &opener, "rig2", "/dev/ttyB", MockSerialPort::acking()).await;

        let slow = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .dispatch_with_timeout("rig1", &Command::test(pin("1")), Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let quick = tokio::time::timeout(
            Duration::from_secs(1),
            registry.dispatch_with_timeout("rig2", &Command::test(pin("2")), Some(Duration::from_secs(1))),
        )
        .await
        .expect("rig2 must not wait for rig1");

        tokio_test::assert_ok!(quick);
        assert_eq!(fast.written_frames(), vec!["TEST:2"]);
        slow.abort();
    }

    #[tokio::test]
    async fn test_dispatch_timeout_keeps_board_connected() {
        let opener = MockOpener::new();
        let settings = LinkSettings {
            ack_timeout: Some(Duration::from_millis(20)),
            ..fast_settings()
        };
        let registry = registry_with(&opener, settings);
        connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;

        let result = registry.dispatch("rig1", &Command::test(pin("13"))).await;

        assert!(matches!(
            result,
            Err(DispatchError::Link { source: LinkError::Timeout(_), .. })
        ));
        assert_eq!(registry.state("rig1").await, Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn test_io_failure_then_explicit_reconnect() {
        let opener = MockOpener::new();
        let registry = registry_with(&opener, fast_settings());
        let port = connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;

        port.set_write_error(io::ErrorKind::BrokenPipe);
        let result = registry.dispatch("rig1", &Command::test(pin("13"))).await;
        assert!(matches!(
            result,
            Err(DispatchError::Link { source: LinkError::IoFailure { .. }, .. })
        ));
        assert_eq!(registry.state("rig1").await, Some(LinkState::Faulted));

        let again = registry.dispatch("rig1", &Command::test(pin("13"))).await;
        assert!(matches!(again, Err(DispatchError::NotConnected(_))));

        *port.write_error.lock().unwrap() = None;
        registry.reconnect("rig1").await.unwrap();
        registry.dispatch("rig1", &Command::test(pin("13"))).await.unwrap();
        assert_eq!(port.written_frames(), vec!["TEST:13"]);
    }

    #[tokio::test]
    async fn test_connect_all_reports_failures() {
        let opener = MockOpener::new();
        opener.add_port("/dev/ttyA", MockSerialPort::new());
        let registry = registry_with(&opener, fast_settings());
        registry.register(board("rig1", "/dev/ttyA")).await.unwrap();
        registry.register(board("ghost", "/dev/ttyGONE")).await.unwrap();

        let failures = registry.connect_all().await;

        assert_eq!(failures.len(), 1);
        assert_eq!(registry.state("rig1").await, Some(LinkState::Connected));
        assert_eq!(registry.state("ghost").await, Some(LinkState::Faulted));
    }

    #[tokio::test]
    async fn test_connect_all_overlaps_settle_delays() {
        let opener = MockOpener::new();
        let settings = LinkSettings {
            settle: Duration::from_millis(100),
            ..LinkSettings::default()
        };
        let registry = registry_with(&opener, settings);
        for (name, address) in [("rig1", "/dev/ttyA"), ("rig2", "/dev/ttyB"), ("rig3", "/dev/ttyC")] {
            opener.add_port(address, MockSerialPort::new());
            registry.register(board(name, address)).await.unwrap();
        }

        let started = tokio::time::Instant::now();
        let failures = registry.connect_all().await;
        let elapsed = started.elapsed();

        assert!(failures.is_empty());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(250), "took {:?}", elapsed);
        for status in registry.boards().await {
            assert_eq!(status.state, LinkState::Connected);
        }
    }

    #[tokio::test]
    async fn test_connect_all_skips_connected_boards() {
        let opener = MockOpener::new();
        let registry = registry_with(&opener, fast_settings());
        connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;
        opener.add_port("/dev/ttyB", MockSerialPort::new());
        registry.register(board("rig2", "/dev/ttyB")).await.unwrap();

        assert!(registry.connect_all().await.is_empty());

        assert_eq!(opener.open_count("/dev/ttyA"), 1);
        assert_eq!(opener.open_count("/dev/ttyB"), 1);
    }

    #[tokio::test]
    async fn test_connect_of_deregistered_slot_does_not_open() {
        let opener = MockOpener::new();
        opener.add_port("/dev/ttyA", MockSerialPort::new());
        let registry = registry_with(&opener, fast_settings());
        registry.register(board("rig1", "/dev/ttyA")).await.unwrap();
        let stale = registry.slot("rig1").await.unwrap();

        registry.deregister("rig1").await;
        let result = stale.connect(&opener, Duration::ZERO).await;

        assert!(matches!(result, Err(RegistryError::UnknownBoard(_))));
        assert_eq!(opener.open_count("/dev/ttyA"), 0);
        assert_eq!(stale.link.lock().await.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_deregister_while_connect_waits_for_link() {
        let opener = MockOpener::new();
        opener.add_port("/dev/ttyA", MockSerialPort::new());
        let registry = Arc::new(registry_with(&opener, fast_settings()));
        registry.register(board("rig1", "/dev/ttyA")).await.unwrap();

        // Keep the link busy so connect and deregister both queue on it
        let slot = registry.slot("rig1").await.unwrap();
        let busy = slot.link.lock().await;

        let connecting = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.connect("rig1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let deregistering = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.deregister("rig1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(busy);

        let result = connecting.await.unwrap();
        deregistering.await.unwrap();

        assert!(matches!(result, Err(RegistryError::UnknownBoard(_))));
        assert_eq!(opener.open_count("/dev/ttyA"), 0);
        assert_eq!(registry.state("rig1").await, None);
    }

    // ==================== Deregister Tests ====================

    #[tokio::test]
    async fn test_deregister_unknown_is_noop() {
        let registry = registry_with(&MockOpener::new(), fast_settings());
        registry.deregister("nobody").await;
        assert!(registry.boards().await.is_empty());
    }

    #[tokio::test]
    async fn test_deregister_removes_board() {
        let opener = MockOpener::new();
        let registry = registry_with(&opener, fast_settings());
        connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;

        registry.deregister("rig1").await;

        assert_eq!(registry.state("rig1").await, None);
        let result = registry.dispatch("rig1", &Command::test(pin("13"))).await;
        assert!(matches!(result, Err(DispatchError::UnknownBoard(_))));

        // Address is free again
        registry.register(board("rig2", "/dev/ttyA")).await.unwrap();
    }

    #[tokio::test]
    async fn test_deregister_cancels_inflight_ack_wait() {
        let opener = MockOpener::new();
        let registry = Arc::new(registry_with(&opener, fast_settings()));
        connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;

        let waiting = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .dispatch_with_timeout("rig1", &Command::test(pin("13")), Some(Duration::from_secs(30)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), registry.deregister("rig1"))
            .await
            .expect("deregister must not wait for the ack timeout");

        let result = waiting.await.unwrap();
        assert!(matches!(
            result,
            Err(DispatchError::Link { source: LinkError::Closed, .. })
        ));
    }

    // ==================== Sync Tests ====================

    #[tokio::test]
    async fn test_sync_adds_and_removes() {
        let opener = MockOpener::new();
        let registry = registry_with(&opener, fast_settings());
        registry.register(board("old", "/dev/ttyA")).await.unwrap();
        registry.register(board("kept", "/dev/ttyB")).await.unwrap();

        let summary = registry
            .sync(&[board("kept", "/dev/ttyB"), board("new", "/dev/ttyC")])
            .await;

        assert_eq!(summary.added, vec!["new"]);
        assert_eq!(summary.removed, vec!["old"]);
        assert!(summary.rejected.is_empty());

        let names: Vec<String> = registry.boards().await.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["kept", "new"]);
    }

    #[tokio::test]
    async fn test_sync_replaces_moved_board() {
        let registry = registry_with(&MockOpener::new(), fast_settings());
        registry.register(board("rig1", "/dev/ttyA")).await.unwrap();

        let summary = registry.sync(&[board("rig1", "/dev/ttyB")]).await;

        assert_eq!(summary.removed, vec!["rig1"]);
        assert_eq!(summary.added, vec!["rig1"]);
        assert_eq!(registry.boards().await[0].address, "/dev/ttyB");
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let opener = MockOpener::new();
        let registry = registry_with(&opener, fast_settings());
        connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;
        connected_board(&registry, &opener, "rig2", "/dev/ttyB", MockSerialPort::new()).await;

        registry.shutdown().await;

        assert!(registry.boards().await.is_empty());
    }

    // ==================== Firmware Tests ====================

    #[tokio::test]
    async fn test_upload_firmware_closes_and_reconnects() {
        let opener = MockOpener::new();
        let registry = registry_with(&opener, fast_settings());
        connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;

        let mut uploader = MockFirmwareUploader::new();
        uploader
            .expect_upload()
            .withf(|address, artifact| address.to_string() == "/dev/ttyA" && artifact.ends_with("blink.hex"))
            .times(1)
            .returning(|_, _| {
                Ok(UploadOutcome {
                    compiled: false,
                    output: "done".to_string(),
                })
            });

        let outcome = registry
            .upload_firmware("rig1", Path::new("/tmp/blink.hex"), &uploader)
            .await
            .unwrap();

        assert_eq!(outcome.output, "done");
        assert_eq!(opener.open_count("/dev/ttyA"), 2);
        assert_eq!(registry.state("rig1").await, Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn test_upload_failure_still_reconnects() {
        let opener = MockOpener::new();
        let registry = registry_with(&opener, fast_settings());
        connected_board(&registry, &opener, "rig1", "/dev/ttyA", MockSerialPort::new()).await;

        let mut uploader = MockFirmwareUploader::new();
        uploader.expect_upload().returning(|_, _| {
            Err(UploadError::Failed {
                stage: "upload",
                stderr: "programmer is not responding".to_string(),
            })
        });

        let result = registry
            .upload_firmware("rig1", Path::new("/tmp/blink.hex"), &uploader)
            .await;

        assert!(matches!(result, Err(RegistryError::Upload { .. })));
        assert_eq!(registry.state("rig1").await, Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn test_upload_to_unknown_board() {
        let registry = registry_with(&MockOpener::new(), fast_settings());
        let uploader = MockFirmwareUploader::new();

        let result = registry
            .upload_firmware("ghost", Path::new("/tmp/blink.hex"), &uploader)
            .await;
        assert!(matches!(result, Err(RegistryError::UnknownBoard(_))));
    }

    #[test]
    fn test_link_settings_from_serial_config() {
        let config = SerialConfig {
            baud_rate: 57600,
            settle_ms: 1500,
            ack_timeout_ms: 0,
            connect_on_start: true,
        };
        let settings = LinkSettings::from(&config);
        assert_eq!(settings.baud_rate, 57600);
        assert_eq!(settings.settle, Duration::from_millis(1500));
        assert_eq!(settings.ack_timeout, None);

        let acked = LinkSettings::from(&SerialConfig {
            ack_timeout_ms: 250,
            ..config
        });
        assert_eq!(acked.ack_timeout, Some(Duration::from_millis(250)));
    }
}
