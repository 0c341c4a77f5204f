//! # Controller Module
//!
//! Controller event sources.
//!
//! This module handles:
//! - The [`ControllerEvent`] value passed from sources to the router
//! - The [`EventSource`] trait every input device implements
//! - [`ChannelSource`], for events pushed in by another task (e.g. a websocket bridge)
//! - DualSense / evdev input in [`dualsense`]

pub mod dualsense;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::SourceError;

/// One input change from a controller.
///
/// The meaning of `raw_value` depends on the input: buttons are 0/1, axes
/// use whatever range the source reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerEvent {
    pub input_id: String,
    pub raw_value: f32,
    pub timestamp: DateTime<Utc>,
}

impl ControllerEvent {
    /// Create an event stamped with the current time
    pub fn now(input_id: impl Into<String>, raw_value: f32) -> Self {
        Self {
            input_id: input_id.into(),
            raw_value,
            timestamp: Utc::now(),
        }
    }
}

/// A lazy, non-restartable stream of controller events.
#[async_trait]
pub trait EventSource: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Wait for the next event.
    ///
    /// `Ok(None)` means the source has ended and will not produce more events.
    /// Must be cancel safe: dropping the future loses no events.
    async fn next_event(&mut self) -> Result<Option<ControllerEvent>, SourceError>;
}

/// Source fed through an mpsc channel.
///
/// The source ends once every sender is dropped.
///
/// # Examples
///
/// ```
/// use bluelink_bridge::controller::{ChannelSource, ControllerEvent, EventSource};
///
/// # tokio_test::block_on(async {
/// let (tx, mut source) = ChannelSource::new("web", 16);
/// tx.send(ControllerEvent::now("btn_cross", 1.0)).await.unwrap();
/// drop(tx);
///
/// assert_eq!(source.next_event().await.unwrap().unwrap().input_id, "btn_cross");
/// assert!(source.next_event().await.unwrap().is_none());
/// # });
/// ```
pub struct ChannelSource {
    name: String,
    events: mpsc::Receiver<ControllerEvent>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it
    pub fn new(name: impl Into<String>, capacity: usize) -> (mpsc::Sender<ControllerEvent>, Self) {
        let (tx, events) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                name: name.into(),
                events,
            },
        )
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self) -> Result<Option<ControllerEvent>, SourceError> {
        Ok(self.events.recv().await)
    }
}
