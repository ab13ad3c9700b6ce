//! Refresh orchestrator.
//!
//! One task owns all state of a route screen and multiplexes its inputs:
//! decoded stream frames, finished refresh cycles, the one-second local
//! ticker, the poll interval, and commands from the HTTP surface. Nothing is
//! shared mutably, so no locks are needed; readers observe published state
//! through `watch` channels.
//!
//! # Cycle ordering
//!
//! Each refresh cycle runs as its own task and carries a token. Cycles may
//! overlap and finish in any order. A result is applied only if its token is
//! newer than the bracket currently shown; a cycle without a bracket leaves
//! the previous one untouched.
//!
//! # Publishing
//!
//! A recomputed stop list is compared structurally with the current one and
//! is only published when it differs. Every state write checks the liveness
//! flag first; after teardown, late cycle results are dropped.
//!
//! # Failures
//!
//! Route loads and stream subscriptions run as their own tasks and report
//! back, so a slow or unreachable backend never stalls the countdown or
//! shutdown. Failed loads, failed subscriptions and closed streams are
//! retried on the next poll tick. There is deliberately no backoff.
//!
//! A cycle answered entirely from the ETA cache carries no new information;
//! it may lower the displayed countdown but never raises it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bracket::{BracketLocator, CycleOutcome, annotate_stops};
use crate::config::TrackerConfig;
use crate::directory::{DirectoryClient, RouteDirectory};
use crate::error::Result;
use crate::eta::EtaOracle;
use crate::models::{Bracket, BracketView, RouteView, Stop, VehiclePosition};
use crate::progress::LocalTicker;
use crate::stream::{PositionSource, PositionSubscription};

/// Local countdown period.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

const COMMAND_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerCommand {
    /// Start a refresh cycle now.
    Refresh,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub route_id: String,
    /// Stream vehicle id whose positions drive the route.
    pub tracked_vehicle: String,
    pub poll_interval: Duration,
}

impl TrackerSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            route_id: config.route_id.clone(),
            tracked_vehicle: config.tracked_vehicle().to_string(),
            poll_interval: config.poll_interval,
        }
    }
}

#[derive(Debug)]
pub struct CycleResult {
    pub token: u64,
    pub outcome: CycleOutcome,
}

/// Completion of a background setup step.
enum SetupEvent {
    RouteLoaded(Result<Vec<Stop>>),
    Subscribed(Result<PositionSubscription>),
}

pub struct RefreshOrchestrator<D, O, S> {
    settings: TrackerSettings,
    directory: Arc<RouteDirectory<D>>,
    locator: Arc<BracketLocator<O>>,
    source: Arc<S>,
    subscription: Option<PositionSubscription>,
    route_load: Option<JoinHandle<()>>,
    subscribing: Option<JoinHandle<()>>,
    setup_tx: mpsc::UnboundedSender<SetupEvent>,
    setup_rx: mpsc::UnboundedReceiver<SetupEvent>,

    stops: Vec<Stop>,
    latest_position: Option<VehiclePosition>,
    ticker: LocalTicker,

    next_token: u64,
    applied_token: u64,
    cycle_tx: mpsc::UnboundedSender<CycleResult>,
    cycle_rx: mpsc::UnboundedReceiver<CycleResult>,

    alive: Arc<AtomicBool>,
    stop_writes: Arc<AtomicU64>,
    stops_tx: watch::Sender<Vec<Stop>>,
    bracket_tx: watch::Sender<Option<Bracket>>,
    vehicle_tx: watch::Sender<Option<VehiclePosition>>,
}

impl<D, O, S> RefreshOrchestrator<D, O, S>
where
    D: DirectoryClient + 'static,
    O: EtaOracle + 'static,
    S: PositionSource + 'static,
{
    pub fn new(
        settings: TrackerSettings,
        directory: RouteDirectory<D>,
        locator: Arc<BracketLocator<O>>,
        source: S,
    ) -> Self {
        let (cycle_tx, cycle_rx) = mpsc::unbounded_channel();
        let (setup_tx, setup_rx) = mpsc::unbounded_channel();

        Self {
            settings,
            directory: Arc::new(directory),
            locator,
            source: Arc::new(source),
            subscription: None,
            route_load: None,
            subscribing: None,
            setup_tx,
            setup_rx,
            stops: Vec::new(),
            latest_position: None,
            ticker: LocalTicker::new(),
            next_token: 0,
            applied_token: 0,
            cycle_tx,
            cycle_rx,
            alive: Arc::new(AtomicBool::new(true)),
            stop_writes: Arc::new(AtomicU64::new(0)),
            stops_tx: watch::Sender::new(Vec::new()),
            bracket_tx: watch::Sender::new(None),
            vehicle_tx: watch::Sender::new(None),
        }
    }

    /// Start the orchestrator task and return the screen's handle to it.
    pub fn spawn(self) -> RouteHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let route_id = self.settings.route_id.clone();
        let stops = self.stops_tx.subscribe();
        let bracket = self.bracket_tx.subscribe();
        let vehicle = self.vehicle_tx.subscribe();
        let stop_writes = Arc::clone(&self.stop_writes);
        let alive = Arc::clone(&self.alive);

        let task = tokio::spawn(self.run(command_rx));

        RouteHandle {
            route_id,
            stops,
            bracket,
            vehicle,
            stop_writes,
            alive,
            commands: command_tx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<TrackerCommand>) {
        tracing::info!(
            route_id = %self.settings.route_id,
            vehicle = %self.settings.tracked_vehicle,
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            "Route tracker started"
        );

        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // No branch body awaits: every input is serviced within one pass.
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(TrackerCommand::Refresh) => {
                        self.start_cycle();
                    }
                    Some(TrackerCommand::Shutdown) | None => break,
                },
                Some(event) = self.setup_rx.recv() => self.on_setup(event),
                Some(result) = self.cycle_rx.recv() => self.apply_cycle(result),
                frame = next_frame(&mut self.subscription) => match frame {
                    Some(positions) => self.on_frame(positions),
                    None => {
                        tracing::warn!("Position stream ended, resubscribing on next poll");
                        self.subscription = None;
                    }
                },
                _ = tick.tick() => self.on_tick(),
                _ = poll.tick() => self.on_poll(),
            }
        }

        self.alive.store(false, Ordering::Release);
        for task in [self.route_load.take(), self.subscribing.take()].into_iter().flatten() {
            task.abort();
        }
        self.subscription = None;
        tracing::info!(route_id = %self.settings.route_id, "Route tracker stopped");
    }

    fn on_poll(&mut self) {
        if self.stops.is_empty() && !in_flight(&self.route_load) {
            let directory = Arc::clone(&self.directory);
            let route_id = self.settings.route_id.clone();
            let setup_tx = self.setup_tx.clone();
            self.route_load = Some(tokio::spawn(async move {
                let result = directory.load_route(&route_id).await;
                let _ = setup_tx.send(SetupEvent::RouteLoaded(result));
            }));
        }

        if self.subscription.is_none() && !in_flight(&self.subscribing) {
            let source = Arc::clone(&self.source);
            let setup_tx = self.setup_tx.clone();
            self.subscribing = Some(tokio::spawn(async move {
                let result = source.subscribe().await;
                let _ = setup_tx.send(SetupEvent::Subscribed(result));
            }));
        }

        self.start_cycle();
    }

    fn on_setup(&mut self, event: SetupEvent) {
        match event {
            SetupEvent::RouteLoaded(Ok(stops)) => {
                if self.stops.is_empty() && self.commit_stops(stops) {
                    self.start_cycle();
                }
            }
            SetupEvent::RouteLoaded(Err(e)) => {
                tracing::warn!(route_id = %self.settings.route_id, error = %e, "Failed to load route");
            }
            SetupEvent::Subscribed(Ok(subscription)) => {
                if self.is_alive() && self.subscription.is_none() {
                    self.subscription = Some(subscription);
                }
            }
            SetupEvent::Subscribed(Err(e)) => {
                tracing::warn!(error = %e, "Failed to subscribe to position stream");
            }
        }
    }

    /// Take the tracked vehicle's position from a frame.
    pub fn on_frame(&mut self, positions: Vec<VehiclePosition>) {
        let Some(position) = positions
            .into_iter()
            .find(|p| p.vehicle_id == self.settings.tracked_vehicle)
        else {
            return;
        };

        if self.latest_position.as_ref() == Some(&position) {
            return;
        }

        tracing::trace!(position = %position, "Tracked vehicle moved");
        self.latest_position = Some(position.clone());
        if self.is_alive() {
            self.vehicle_tx.send_replace(Some(position));
        }
        self.start_cycle();
    }

    /// Spawn a refresh cycle if a stop list and a position are available.
    pub fn start_cycle(&mut self) -> Option<u64> {
        let vehicle = self.latest_position.clone()?;
        if self.stops.is_empty() {
            return None;
        }

        self.next_token += 1;
        let token = self.next_token;
        let locator = Arc::clone(&self.locator);
        let stops = self.stops.clone();
        let cycle_tx = self.cycle_tx.clone();
        let alive = Arc::clone(&self.alive);

        tokio::spawn(async move {
            let outcome = locator.locate(&vehicle, &stops).await;
            if !alive.load(Ordering::Acquire) {
                tracing::debug!(token, "Route screen gone, discarding cycle");
                return;
            }
            let _ = cycle_tx.send(CycleResult { token, outcome });
        });

        Some(token)
    }

    pub fn apply_cycle(&mut self, result: CycleResult) {
        if !self.is_alive() {
            return;
        }

        if result.token <= self.applied_token {
            tracing::debug!(
                token = result.token,
                applied = self.applied_token,
                "Discarding stale cycle"
            );
            return;
        }

        match result.outcome.bracket {
            Ok(bracket) => {
                self.applied_token = result.token;
                let annotated = annotate_stops(&self.stops, &result.outcome.etas, &bracket);
                self.commit_stops(annotated);

                if result.outcome.from_cache && self.would_rewind(&bracket) {
                    tracing::debug!(token = result.token, "Cached cycle, keeping countdown");
                    return;
                }

                self.ticker.publish(bracket);
                self.bracket_tx.send_replace(self.ticker.displayed());
                tracing::debug!(
                    token = result.token,
                    current = bracket.current_index,
                    next = bracket.next_index,
                    remaining_secs = bracket.remaining_seconds,
                    progress = bracket.visual_progress,
                    "Bracket published"
                );
            }
            Err(e) => {
                tracing::debug!(token = result.token, error = %e, "Keeping previous bracket");
            }
        }
    }

    /// Whether publishing `bracket` would move the displayed countdown back up.
    fn would_rewind(&self, bracket: &Bracket) -> bool {
        self.ticker.displayed().is_some_and(|shown| {
            shown.current_index == bracket.current_index
                && shown.next_index == bracket.next_index
                && bracket.remaining_seconds > shown.remaining_seconds
        })
    }

    fn on_tick(&mut self) {
        if self.ticker.tick() && self.is_alive() {
            self.bracket_tx.send_replace(self.ticker.displayed());
        }
    }

    /// Publish `stops` unless it equals the current list. Returns whether it was written.
    fn commit_stops(&mut self, stops: Vec<Stop>) -> bool {
        if !self.is_alive() || stops == self.stops {
            return false;
        }

        self.stops = stops;
        self.stops_tx.send_replace(self.stops.clone());
        self.stop_writes.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

fn in_flight(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().is_some_and(|task| !task.is_finished())
}

async fn next_frame(subscription: &mut Option<PositionSubscription>) -> Option<Vec<VehiclePosition>> {
    match subscription {
        Some(subscription) => subscription.next_frame().await,
        None => std::future::pending().await,
    }
}

/// A route screen's view of its orchestrator.
pub struct RouteHandle {
    route_id: String,
    stops: watch::Receiver<Vec<Stop>>,
    bracket: watch::Receiver<Option<Bracket>>,
    vehicle: watch::Receiver<Option<VehiclePosition>>,
    stop_writes: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    commands: mpsc::Sender<TrackerCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RouteHandle {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn stops(&self) -> Vec<Stop> {
        self.stops.borrow().clone()
    }

    pub fn bracket(&self) -> Option<Bracket> {
        *self.bracket.borrow()
    }

    pub fn vehicle(&self) -> Option<VehiclePosition> {
        self.vehicle.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn stop_writes(&self) -> u64 {
        self.stop_writes.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn subscribe_bracket(&self) -> watch::Receiver<Option<Bracket>> {
        self.bracket.clone()
    }

    pub fn view(&self) -> RouteView {
        RouteView {
            route_id: self.route_id.clone(),
            stops: self.stops(),
            bracket: self.bracket().map(BracketView::from),
            vehicle: self.vehicle(),
            stop_writes: self.stop_writes(),
        }
    }

    pub async fn refresh(&self) -> bool {
        self.commands.send(TrackerCommand::Refresh).await.is_ok()
    }

    /// Stop the orchestrator: state writes cease, the stream closes and timers drop.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.commands.send(TrackerCommand::Shutdown).await;

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Route tracker task failed");
            }
        }
    }
}
