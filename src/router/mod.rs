//! # Event Router
//!
//! Turns controller events into board dispatches.
//!
//! Each call to [`EventRouter::run`] is one processing path for one event
//! source:
//!
//! ```text
//! EventSource ──▶ resolve() ──▶ HoldTracker ──▶ per-board lane ──▶ LinkRegistry
//!                  (snapshot)                   (PendingQueue +
//!                                                 worker task)
//! ```
//!
//! Every board touched by a path gets its own lane: a [`PendingQueue`] plus
//! one worker task that dispatches in FIFO order. Commands for the same board
//! keep their order, different boards proceed concurrently, and a slow board
//! only backs up its own lane. Continuous actuations waiting in a lane are
//! coalesced so the board always catches up to the latest value.
//!
//! Dispatch failures never stop a path. They are logged and, if a report
//! channel is attached, published as [`DispatchReport`]s.

pub mod hold;
pub mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::RouterConfig;
use crate::controller::{ControllerEvent, EventSource};
use crate::error::{DispatchError, SourceError};
use crate::mapping::{resolve, Actuation, MappingTable};
use crate::serial::LinkRegistry;
use crate::wire::Command;

pub use hold::{HoldTracker, StepperHold};
pub use queue::PendingQueue;

/// Router behaviour shared by every path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterSettings {
    pub stepper_hold: StepperHold,
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            stepper_hold: StepperHold::from(config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Sent,
    Failed,
}

/// Outcome of one dispatch, as published on the report channel.
///
/// Serializes as:
///
/// ```json
/// {"board":"rig1","frame":"DIGITAL:13:1","status":"sent","error":null,"mapping_id":1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub board: String,
    /// Frame text without the terminator
    pub frame: String,
    pub status: DispatchStatus,
    pub error: Option<String>,
    /// `None` for manual requests
    pub mapping_id: Option<u32>,
}

impl DispatchReport {
    fn new(
        board: &str,
        command: &Command,
        mapping_id: Option<u32>,
        result: &Result<(), DispatchError>,
    ) -> Self {
        let (status, error) = match result {
            Ok(()) => (DispatchStatus::Sent, None),
            Err(e) => (DispatchStatus::Failed, Some(e.to_string())),
        };
        Self {
            board: board.to_string(),
            frame: command.to_string(),
            status,
            error,
            mapping_id,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == DispatchStatus::Sent
    }
}

/// Counters for one processing path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PathStats {
    /// Events pulled from the source
    pub events: u64,
    /// Actuations handed to lanes (after the hold policy)
    pub actuations: u64,
    pub sent: u64,
    pub failed: u64,
    /// Queued actuations superseded by a newer value
    pub coalesced: u64,
    /// Queued actuations dropped at shutdown
    pub discarded: u64,
}

/// Routes controller events to boards through the link registry.
///
/// Cheap to clone; clones share the registry, mapping snapshot and report
/// channel, so one router can serve several sources concurrently.
#[derive(Clone)]
pub struct EventRouter {
    registry: Arc<LinkRegistry>,
    mappings: watch::Receiver<Arc<MappingTable>>,
    settings: RouterSettings,
    reports: Option<mpsc::UnboundedSender<DispatchReport>>,
}

impl EventRouter {
    /// Create a router
    ///
    /// # Arguments
    ///
    /// * `registry` - Board links commands are dispatched through
    /// * `mappings` - Receiver from a [`MappingStore`](crate::mapping::MappingStore);
    ///   the latest table is read for every event
    /// * `settings` - Stepper hold policy
    pub fn new(
        registry: Arc<LinkRegistry>,
        mappings: watch::Receiver<Arc<MappingTable>>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            mappings,
            settings,
            reports: None,
        }
    }

    /// Publish a [`DispatchReport`] for every dispatch
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<DispatchReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> RouterSettings {
        self.settings
    }

    /// Send one command to a board outside of any mapping.
    ///
    /// Used for manual requests such as pin tests. Goes through the same
    /// registry path as mapped actuations, so it queues behind any dispatch
    /// already holding the board.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use bluelink_bridge::router::EventRouter;
    /// # use bluelink_bridge::wire::{Command, PinId};
    /// # async fn demo(router: EventRouter) -> Result<(), Box<dyn std::error::Error>> {
    /// let report = router.dispatch_direct("rig1", Command::test(PinId::new("13")?)).await;
    /// println!("{}", report.frame); // TEST:13
    /// # Ok(())
    /// # }
    /// ```
    pub async fn dispatch_direct(&self, board: &str, command: Command) -> DispatchReport {
        let result = self.registry.dispatch(board, &command).await;
        if let Err(e) = &result {
            warn!("Manual {} to {} failed: {}", command, board, e);
        }

        let report = DispatchReport::new(board, &command, None, &result);
        publish(&self.reports, &report);
        report
    }

    /// Run one processing path until the source ends, fails, or shutdown
    /// is signalled.
    ///
    /// - Source end: queued actuations are dispatched, then `Ok`
    /// - Source error: queued actuations are dispatched, then `Err`
    /// - Shutdown (`true` on `shutdown`): stop pulling, drop queued
    ///   actuations, wait for in-flight dispatches, then `Ok`
    ///
    /// Dropping the shutdown sender does not stop the path.
    pub async fn run<S>(
        &self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PathStats, SourceError>
    where
        S: EventSource,
    {
        let name = source.name().to_string();
        info!("Router path for {} started ({:?})", name, self.settings.stepper_hold);

        let mut stats = PathStats::default();
        let mut hold = HoldTracker::new(self.settings.stepper_hold);
        let mut lanes = Lanes::new(self.registry.clone(), self.reports.clone());
        let mut ticker = hold.repeat_interval().map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let exit = loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => break PathExit::Shutdown,

                _ = tick(&mut ticker) => {
                    let table = self.snapshot();
                    let repeated = hold.repeat(table.mappings());
                    lanes.enqueue(repeated, &mut stats);
                }

                next = source.next_event() => match next {
                    Ok(Some(event)) => self.process(&event, &mut hold, &mut lanes, &mut stats),
                    Ok(None) => break PathExit::Ended,
                    Err(e) => break PathExit::Failed(e),
                },
            }
        };

        let discard = matches!(exit, PathExit::Shutdown);
        lanes.finish(discard, &mut stats).await;

        match exit {
            PathExit::Failed(e) => {
                error!("Router path for {} stopped: {} ({:?})", name, e, stats);
                Err(e)
            }
            PathExit::Ended => {
                info!("Router path for {} ended ({:?})", name, stats);
                Ok(stats)
            }
            PathExit::Shutdown => {
                info!("Router path for {} shut down ({:?})", name, stats);
                Ok(stats)
            }
        }
    }

    fn snapshot(&self) -> Arc<MappingTable> {
        self.mappings.borrow().clone()
    }

    fn process(
        &self,
        event: &ControllerEvent,
        hold: &mut HoldTracker,
        lanes: &mut Lanes,
        stats: &mut PathStats,
    ) {
        stats.events += 1;

        let table = self.snapshot();
        let resolved = resolve(event, table.mappings());
        let actuations = hold.filter(event, table.mappings(), resolved);

        trace!(
            "{} = {} -> {} actuation(s)",
            event.input_id,
            event.raw_value,
            actuations.len()
        );
        lanes.enqueue(actuations, stats);
    }
}

enum PathExit {
    Ended,
    Failed(SourceError),
    Shutdown,
}

/// Resolves once shutdown is `true`; pends forever if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn publish(reports: &Option<mpsc::UnboundedSender<DispatchReport>>, report: &DispatchReport) {
    if let Some(tx) = reports {
        // Receiver gone just means nobody is listening any more
        let _ = tx.send(report.clone());
    }
}

// ==================== Lanes ====================

#[derive(Debug, Default, Clone, Copy)]
struct LaneStats {
    sent: u64,
    failed: u64,
}

struct LaneShared {
    queue: Mutex<PendingQueue>,
    notify: Notify,
    finished: AtomicBool,
}

impl LaneShared {
    fn queue(&self) -> std::sync::MutexGuard<'_, PendingQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Lane {
    shared: Arc<LaneShared>,
    worker: JoinHandle<LaneStats>,
}

/// The lanes of one processing path, keyed by board name
struct Lanes {
    registry: Arc<LinkRegistry>,
    reports: Option<mpsc::UnboundedSender<DispatchReport>>,
    lanes: HashMap<String, Lane>,
}

impl Lanes {
    fn new(
        registry: Arc<LinkRegistry>,
        reports: Option<mpsc::UnboundedSender<DispatchReport>>,
    ) -> Self {
        Self {
            registry,
            reports,
            lanes: HashMap::new(),
        }
    }

    fn enqueue(&mut self, actuations: Vec<Actuation>, stats: &mut PathStats) {
        for actuation in actuations {
            stats.actuations += 1;

            let lane = self.lane(&actuation.board);
            let superseded = lane.shared.queue().push(actuation);
            lane.shared.notify.notify_one();

            if let Some(old) = superseded {
                stats.coalesced += 1;
                debug!("Coalesced {} for {} (mapping {})", old.command, old.board, old.mapping_id);
            }
        }
    }

    fn lane(&mut self, board: &str) -> &Lane {
        let registry = &self.registry;
        let reports = &self.reports;
        self.lanes.entry(board.to_string()).or_insert_with(|| {
            let shared = Arc::new(LaneShared {
                queue: Mutex::new(PendingQueue::new()),
                notify: Notify::new(),
                finished: AtomicBool::new(false),
            });
            let worker = tokio::spawn(lane_worker(
                board.to_string(),
                shared.clone(),
                registry.clone(),
                reports.clone(),
            ));
            Lane { shared, worker }
        })
    }

    /// Stop every lane and wait for its worker.
    ///
    /// With `discard`, queued actuations are dropped and only the dispatch
    /// already in flight completes; otherwise the queues are drained first.
    async fn finish(self, discard: bool, stats: &mut PathStats) {
        for (board, lane) in self.lanes {
            if discard {
                let dropped = lane.shared.queue().clear();
                if dropped > 0 {
                    debug!("Discarded {} queued actuation(s) for {}", dropped, board);
                }
                stats.discarded += dropped as u64;
            }

            lane.shared.finished.store(true, Ordering::Release);
            lane.shared.notify.notify_one();

            match lane.worker.await {
                Ok(lane_stats) => {
                    stats.sent += lane_stats.sent;
                    stats.failed += lane_stats.failed;
                }
                Err(e) => error!("Lane worker for {} panicked: {}", board, e),
            }
        }
    }
}

async fn lane_worker(
    board: String,
    shared: Arc<LaneShared>,
    registry: Arc<LinkRegistry>,
    reports: Option<mpsc::UnboundedSender<DispatchReport>>,
) -> LaneStats {
    let mut stats = LaneStats::default();

    loop {
        let next = shared.queue().pop();
        let Some(actuation) = next else {
            if shared.finished.load(Ordering::Acquire) {
                break;
            }
            shared.notify.notified().await;
            continue;
        };

        let result = registry.dispatch(&board, &actuation.command).await;
        match &result {
            Ok(()) => stats.sent += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(
                    "Dispatch of {} (mapping {}) failed: {}",
                    actuation.command, actuation.mapping_id, e
                );
            }
        }

        let report = DispatchReport::new(&board, &actuation.command, Some(actuation.mapping_id), &result);
        publish(&reports, &report);
    }

    debug!("Lane for {} finished ({} sent, {} failed)", board, stats.sent, stats.failed);
    stats
}
