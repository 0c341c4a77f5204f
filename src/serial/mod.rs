//! # Serial Communication Module
//!
//! Handles serial communication with BlueLink boards.
//!
//! This module handles:
//! - Opening a board's serial port and waiting out the reset-on-open settle time
//! - Writing whole command frames without interleaving
//! - Optionally waiting for an acknowledgement line
//! - Tracking each link's connection state
//!
//! ## Link states
//!
//! ```text
//! Disconnected --connect--> Connecting --settled--> Connected
//!      ^                        |                      |
//!      |                     open err              I/O error
//!      |                        v                      v
//!      +--------close------- Faulted <-----------------+
//! ```
//!
//! A faulted link stays faulted until someone calls [`Link::connect`] again;
//! reconnection policy belongs to [`registry::LinkRegistry`].

pub mod port_trait;
pub mod registry;

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::wire::{decode_reply, encode, Command, Reply};
use port_trait::{PortOpener, SerialPortIO};

pub use registry::{BoardStatus, LinkRegistry, LinkSettings};

/// Default baud rate of the BlueLink firmware
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default time to wait after opening a port before the board is ready.
/// Most Arduino boards reset when the port opens.
pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_secs(2);

/// Longest reply line kept while waiting for a terminator
const MAX_REPLY_LINE: usize = 256;

/// Connection state of a [`Link`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Cancels in-flight waits on a [`Link`] without taking its lock.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    closing: watch::Sender<bool>,
}

impl CloseHandle {
    /// Abort any settle delay or acknowledgement wait currently running.
    pub fn request_close(&self) {
        self.closing.send_replace(true);
    }
}

/// One serial connection to one board.
///
/// All writes go through `&mut self`, so wrapping the link in a mutex is
/// enough to keep frames from concurrent senders from interleaving.
pub struct Link {
    address: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPortIO>>,
    rx_buffer: BytesMut,
    /// Frames written since the last reply that could be matched to one
    unacked: usize,
    state: watch::Sender<LinkState>,
    closing: watch::Sender<bool>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("address", &self.address)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Create a disconnected link for a port address
    ///
    /// # Arguments
    ///
    /// * `address` - Device path (e.g., "/dev/ttyACM0" or "COM3")
    /// * `baud_rate` - Serial speed the firmware was built for
    pub fn new(address: impl Into<String>, baud_rate: u32) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (closing, _) = watch::channel(false);

        Self {
            address: address.into(),
            baud_rate,
            port: None,
            rx_buffer: BytesMut::with_capacity(MAX_REPLY_LINE),
            unacked: 0,
            state,
            closing,
        }
    }

    /// Open the transport and wait for the board to settle
    ///
    /// Any existing port is closed first, so this is also the reconnect
    /// operation for a faulted link.
    ///
    /// # Arguments
    ///
    /// * `opener` - Transport factory
    /// * `settle` - Delay after opening before the link counts as connected
    ///
    /// # Errors
    ///
    /// - `IoFailure`: the port could not be opened (link becomes `Faulted`)
    /// - `Closed`: [`CloseHandle::request_close`] was called during the settle delay
    pub async fn connect(
        &mut self,
        opener: &dyn PortOpener,
        settle: Duration,
    ) -> Result<(), LinkError> {
        if self.port.is_some() {
            self.drop_port();
        }

        self.closing.send_replace(false);
        let mut closing = self.closing.subscribe();
        self.set_state(LinkState::Connecting);

        let port = match opener.open(&self.address, self.baud_rate) {
            Ok(port) => port,
            Err(source) => {
                warn!("Failed to open {}: {}", self.address, source);
                self.set_state(LinkState::Faulted);
                return Err(LinkError::IoFailure {
                    address: self.address.clone(),
                    source,
                });
            }
        };
        self.port = Some(port);

        if !settle.is_zero() {
            debug!("Waiting {:?} for {} to settle", settle, self.address);
            tokio::select! {
                biased;
                _ = wait_closed(&mut closing) => {
                    self.close().await;
                    return Err(LinkError::Closed);
                }
                _ = tokio::time::sleep(settle) => {}
            }
        }

        // Discard boot banners printed during reset
        self.rx_buffer.clear();
        self.unacked = 0;
        self.set_state(LinkState::Connected);
        info!("Link to {} connected at {} baud", self.address, self.baud_rate);
        Ok(())
    }

    /// Attach an already-open transport and mark the link connected
    pub fn attach(&mut self, port: Box<dyn SerialPortIO>) {
        self.closing.send_replace(false);
        self.drop_port();
        self.port = Some(port);
        self.set_state(LinkState::Connected);
    }

    /// Send a command to the board
    ///
    /// The frame is written with a single `write_all` followed by a flush.
    ///
    /// # Arguments
    ///
    /// * `command` - Command to encode and send
    /// * `ack_timeout` - `Some(d)` waits up to `d` for an `OK` reply, `None` returns after the write
    ///
    /// # Errors
    ///
    /// - `Encode`: the command violates a wire precondition (nothing is written)
    /// - `NotConnected`: the link is not `Connected`
    /// - `IoFailure`: write or read failed (link becomes `Faulted`)
    /// - `Timeout`: no acknowledgement in time (link stays `Connected`)
    /// - `Rejected`: the board answered `ERR`
    /// - `Closed`: the link was closed while waiting
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::time::Duration;
    /// use bluelink_bridge::serial::{Link, port_trait::TokioSerialOpener, DEFAULT_SETTLE_TIME};
    /// use bluelink_bridge::wire::{Command, PinId};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let mut link = Link::new("/dev/ttyACM0", 115_200);
    ///     link.connect(&TokioSerialOpener, DEFAULT_SETTLE_TIME).await?;
    ///
    ///     let blink = Command::test(PinId::new("13")?);
    ///     link.send(&blink, Some(Duration::from_millis(200))).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn send(
        &mut self,
        command: &Command,
        ack_timeout: Option<Duration>,
    ) -> Result<(), LinkError> {
        let frame = encode(command)?;

        if self.state() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        let mut closing = self.closing.subscribe();
        if *closing.borrow() {
            return Err(LinkError::Closed);
        }

        self.write_frame(&frame).await?;
        self.unacked += 1;
        debug!("TX {} -> {}", command, self.address);

        let Some(ack_timeout) = ack_timeout else {
            return Ok(());
        };

        tokio::select! {
            biased;
            _ = wait_closed(&mut closing) => Err(LinkError::Closed),
            result = tokio::time::timeout(ack_timeout, self.await_ack(command)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!("No acknowledgement from {} within {:?}", self.address, ack_timeout);
                        Err(LinkError::Timeout(ack_timeout))
                    }
                }
            }
        }
    }

    /// Release the transport. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.closing.send_replace(true);
        if self.port.is_some() {
            info!("Closing link to {}", self.address);
            self.drop_port();
        }
        self.set_state(LinkState::Disconnected);
    }

    /// Current connection state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state transitions without locking the link
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Handle that can cancel in-flight waits from another task
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            closing: self.closing.clone(),
        }
    }

    /// Device path of this link
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let Some(port) = self.port.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        let result = match port.write_all(frame).await {
            Ok(()) => port.flush().await,
            Err(e) => Err(e),
        };

        result.map_err(|source| self.fault(source))
    }

    /// Read reply lines until one acknowledges `command`.
    ///
    /// The board answers frames in order, so while older frames are still
    /// owed a reply a bare `OK` or `ERR` belongs to the oldest of them.
    /// Echoed acknowledgements are matched by content instead.
    async fn await_ack(&mut self, command: &Command) -> Result<(), LinkError> {
        loop {
            let line = self.read_line().await?;
            let older_owed = self.unacked > 1;
            match decode_reply(&line) {
                Ok(Reply::Ack(Some(echo))) if echo == *command => {
                    self.unacked = self.unacked.saturating_sub(1);
                    return Ok(());
                }
                Ok(Reply::Ack(None)) if !older_owed => {
                    self.unacked = 0;
                    return Ok(());
                }
                Ok(Reply::Error(message)) if !older_owed => {
                    self.unacked = 0;
                    warn!("{} rejected {}: {}", self.address, command, message);
                    return Err(LinkError::Rejected(message));
                }
                Ok(reply) => {
                    if older_owed {
                        self.unacked -= 1;
                    }
                    debug!("Skipping stale reply {:?} from {}", reply, self.address);
                }
                Err(e) => {
                    warn!("Ignoring reply from {}: {}", self.address, e);
                }
            }
        }
    }

    /// Read one `\n`-terminated line, buffering partial reads.
    async fn read_line(&mut self) -> Result<BytesMut, LinkError> {
        let mut chunk = [0u8; 64];

        loop {
            if let Some(pos) = self.rx_buffer.iter().position(|&b| b == b'\n') {
                return Ok(self.rx_buffer.split_to(pos + 1));
            }

            if self.rx_buffer.len() > MAX_REPLY_LINE {
                warn!(
                    "Discarding {} bytes of unterminated reply from {}",
                    self.rx_buffer.len(),
                    self.address
                );
                self.rx_buffer.advance(self.rx_buffer.len());
            }

            let Some(port) = self.port.as_mut() else {
                return Err(LinkError::NotConnected);
            };

            let read = port.read(&mut chunk).await;
            match read {
                Ok(0) => {
                    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "port closed by board");
                    return Err(self.fault(eof));
                }
                Ok(n) => self.rx_buffer.extend_from_slice(&chunk[..n]),
                Err(source) => return Err(self.fault(source)),
            }
        }
    }

    fn fault(&mut self, source: io::Error) -> LinkError {
        warn!("Link to {} faulted: {}", self.address, source);
        self.drop_port();
        self.set_state(LinkState::Faulted);
        LinkError::IoFailure {
            address: self.address.clone(),
            source,
        }
    }

    fn drop_port(&mut self) {
        self.port = None;
        self.rx_buffer.clear();
        self.unacked = 0;
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Link {} state {} -> {}", self.address, previous, state);
        }
    }
}

/// Resolves once a close has been requested.
async fn wait_closed(closing: &mut watch::Receiver<bool>) {
    // Err only if the sender is gone, which means the link itself was dropped
    let _ = closing.wait_for(|closing| *closing).await;
}

/// List serial ports present on this machine
///
/// # Errors
///
/// Returns error if the operating system refuses port enumeration
pub fn list_ports() -> io::Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
