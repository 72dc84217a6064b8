//! Change-detection poller
//!
//! One task per subscription owns a [`PollMachine`] and drives it:
//! - each tick probes the provider for a new version token and only fetches
//!   the full day when the token moved
//! - every provider call runs in a spawned task tagged with a sequence
//!   number; results whose sequence is no longer current are dropped
//! - failures back off and, at the configured ceiling, raise a single
//!   degraded signal until the next success
//! - a watchdog clears the loading indicator if a fetch never resolves
//!
//! Zone configurations are resolved only when they change, either because
//! the day payload carried a different set or through an explicit reload.
//! The explicitly loaded set is the base: following a different tenant
//! drops any zones the previous tenant's payloads brought in.

mod machine;
#[cfg(test)]
mod tests;

pub use machine::{
    needs_refresh, FailureOutcome, PollMachine, PollPhase, PollSettings, PollState, PollStatus,
    SuccessOutcome,
};

use crate::domain::error::FetchError;
use crate::domain::raw::ZoneConfig;
use crate::domain::snapshot::Snapshot;
use crate::domain::types::{SubscriptionKey, VersionToken};
use crate::infra::metrics::Metrics;
use crate::io::provider::PresenceProvider;
use crate::io::update_channel::UpdateSender;
use crate::services::overlay::{self, OverlayResolution};
use crate::services::snapshot::{compose, DayView, SnapshotBuilder};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Commands accepted by a running poller
#[derive(Debug)]
pub enum PollCommand {
    Start(SubscriptionKey),
    Stop,
    RefreshNow,
    ReloadZones(Vec<ZoneConfig>),
}

/// Results reported back by tick tasks, tagged with their sequence number
#[derive(Debug)]
enum TaskMessage {
    Refreshing { seq: u64, probed: bool },
    Unchanged { seq: u64 },
    Refreshed {
        seq: u64,
        version: Option<VersionToken>,
        day: DayView,
        zones: Option<Vec<ZoneConfig>>,
        started: Instant,
    },
    Failed { seq: u64, error: FetchError },
}

impl TaskMessage {
    fn seq(&self) -> u64 {
        match self {
            TaskMessage::Refreshing { seq, .. }
            | TaskMessage::Unchanged { seq }
            | TaskMessage::Refreshed { seq, .. }
            | TaskMessage::Failed { seq, .. } => *seq,
        }
    }
}

/// Whether the run loop keeps going after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Control surface for a running poller
#[derive(Clone)]
pub struct PollerHandle {
    cmd_tx: mpsc::Sender<PollCommand>,
    status_rx: watch::Receiver<PollStatus>,
}

impl PollerHandle {
    /// Follow `key`, resetting poll state; the first tick runs immediately
    pub async fn start(&self, key: SubscriptionKey) -> bool {
        self.send(PollCommand::Start(key)).await
    }

    /// Stop polling; the poller task exits
    pub async fn stop(&self) -> bool {
        self.send(PollCommand::Stop).await
    }

    /// Fetch now without probing, superseding any in-flight tick
    pub async fn refresh_now(&self) -> bool {
        self.send(PollCommand::RefreshNow).await
    }

    /// Replace the zone configuration out of band
    pub async fn reload_zones(&self, zones: Vec<ZoneConfig>) -> bool {
        self.send(PollCommand::ReloadZones(zones)).await
    }

    /// Current phase and poll state
    pub fn status(&self) -> PollStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel for status changes
    pub fn subscribe(&self) -> watch::Receiver<PollStatus> {
        self.status_rx.clone()
    }

    async fn send(&self, cmd: PollCommand) -> bool {
        self.cmd_tx.send(cmd).await.is_ok()
    }
}

pub struct Poller<P: PresenceProvider> {
    provider: Arc<P>,
    settings: PollSettings,
    builder: Arc<SnapshotBuilder>,
    machine: PollMachine,
    updates: UpdateSender,
    metrics: Arc<Metrics>,
    cmd_rx: mpsc::Receiver<PollCommand>,
    status_tx: watch::Sender<PollStatus>,
    result_tx: mpsc::Sender<TaskMessage>,
    result_rx: mpsc::Receiver<TaskMessage>,
    task: Option<JoinHandle<()>>,
    next_tick: Option<Instant>,
    watchdog: Option<Instant>,
    /// Last built day view and the version it was built from
    day: Option<(Option<VersionToken>, DayView)>,
    /// Zones from the last explicit reload
    base_zones: Vec<ZoneConfig>,
    /// Zones currently resolved into `overlay`
    zone_configs: Vec<ZoneConfig>,
    overlay: OverlayResolution,
}

/// Create a poller and its handle
///
/// Returns the handle (cloneable) and the poller (to be spawned with `run`)
pub fn create_poller<P: PresenceProvider>(
    provider: Arc<P>,
    settings: PollSettings,
    builder: SnapshotBuilder,
    updates: UpdateSender,
    metrics: Arc<Metrics>,
) -> (PollerHandle, Poller<P>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(PollStatus::default());
    let (result_tx, result_rx) = mpsc::channel(16);

    let poller = Poller {
        provider,
        settings,
        builder: Arc::new(builder),
        machine: PollMachine::new(settings.failure_ceiling),
        updates,
        metrics,
        cmd_rx,
        status_tx,
        result_tx,
        result_rx,
        task: None,
        next_tick: None,
        watchdog: None,
        day: None,
        base_zones: Vec::new(),
        zone_configs: Vec::new(),
        overlay: OverlayResolution::default(),
    };
    (PollerHandle { cmd_tx, status_rx }, poller)
}

/// Deadline for a disabled select branch; never reached in practice
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

impl<P: PresenceProvider> Poller<P> {
    /// Run until stopped, all handles dropped, or shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = %self.settings.interval.as_millis(),
            failure_ceiling = %self.settings.failure_ceiling,
            watchdog_ms = %self.settings.watchdog.as_millis(),
            "poller_started"
        );

        loop {
            let tick_at = self.next_tick.unwrap_or_else(far_future);
            let watchdog_at = self.watchdog.unwrap_or_else(far_future);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("poller_shutdown");
                        break;
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    let flow = match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => Flow::Exit,
                    };
                    if flow == Flow::Exit {
                        break;
                    }
                }
                Some(msg) = self.result_rx.recv() => {
                    self.handle_task_message(msg).await;
                }
                _ = sleep_until(tick_at), if self.next_tick.is_some() => {
                    self.next_tick = None;
                    self.spawn_tick(false);
                }
                _ = sleep_until(watchdog_at), if self.watchdog.is_some() => {
                    self.on_watchdog().await;
                }
            }

            self.publish_status();
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.publish_status();
        info!(phase = self.machine.phase().as_str(), "poller_stopped");
    }

    async fn handle_command(&mut self, cmd: PollCommand) -> Flow {
        match cmd {
            PollCommand::Start(key) => {
                self.abort_task();
                info!(key = %key, "poll_started");
                let previous = self.machine.key().cloned();
                let tenant_changed = previous.as_ref().map(|k| &k.tenant) != Some(&key.tenant);
                if self.machine.start(key) {
                    if let Some(previous) = &previous {
                        self.updates.send_loading(previous, false).await;
                    }
                }
                if tenant_changed {
                    self.apply_zones(self.base_zones.clone());
                }
                self.watchdog = None;
                self.day = None;
                self.metrics.set_degraded(false);
                self.next_tick = Some(Instant::now());
                Flow::Continue
            }
            PollCommand::Stop => {
                self.abort_task();
                let key = self.machine.key().cloned();
                if self.machine.stop() {
                    if let Some(key) = &key {
                        self.updates.send_loading(key, false).await;
                    }
                }
                self.next_tick = None;
                self.watchdog = None;
                info!("poll_stop_requested");
                Flow::Exit
            }
            PollCommand::RefreshNow => {
                if self.machine.key().is_none() {
                    warn!("refresh_now_without_subscription");
                    return Flow::Continue;
                }
                self.next_tick = None;
                self.spawn_tick(true);
                Flow::Continue
            }
            PollCommand::ReloadZones(zones) => {
                self.base_zones = zones.clone();
                if self.apply_zones(zones) && self.machine.key().is_some() {
                    self.publish_snapshot();
                }
                Flow::Continue
            }
        }
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Start a probe (or forced fetch) for the current key
    fn spawn_tick(&mut self, force: bool) {
        let Some(key) = self.machine.key().cloned() else {
            return;
        };
        let Some(seq) = self.machine.begin_request() else {
            return;
        };
        self.abort_task();

        let last = self.machine.state().last_known_version.clone();
        debug!(key = %key, seq = seq, force = force, "poll_tick");

        let provider = Arc::clone(&self.provider);
        let builder = Arc::clone(&self.builder);
        let tx = self.result_tx.clone();
        let limit = self.settings.fetch_timeout;

        self.task = Some(tokio::spawn(async move {
            let msg = run_tick(provider.as_ref(), &builder, &key, seq, last, force, limit, &tx).await;
            let _ = tx.send(msg).await;
        }));
    }

    async fn handle_task_message(&mut self, msg: TaskMessage) {
        let seq = msg.seq();
        if !self.machine.accepts(seq) {
            self.metrics.record_stale_dropped();
            debug!(seq = seq, current = self.machine.seq(), "stale_result_dropped");
            return;
        }
        // Accepted results always belong to the current key
        let Some(key) = self.machine.key().cloned() else {
            return;
        };

        match msg {
            TaskMessage::Refreshing { probed, .. } => {
                if probed {
                    self.metrics.record_probe(true);
                }
                self.machine.on_refreshing();
                self.watchdog = Some(Instant::now() + self.settings.watchdog);
                self.updates.send_loading(&key, true).await;
            }
            TaskMessage::Unchanged { .. } => {
                self.metrics.record_probe(false);
                let outcome = self.machine.on_unchanged(Utc::now());
                self.task = None;
                debug!(
                    version = ?self.machine.state().last_known_version,
                    "poll_tick_unchanged"
                );
                self.metrics.set_degraded(false);
                if outcome.recovered {
                    self.on_recovered();
                }
                self.next_tick = Some(Instant::now() + self.settings.interval);
            }
            TaskMessage::Refreshed { version, day, zones, started, .. } => {
                let outcome = self.machine.on_refreshed(version.clone(), Utc::now());
                self.task = None;
                self.watchdog = None;
                self.metrics.record_refresh(started.elapsed().as_millis() as u64);
                self.metrics.set_degraded(false);
                if outcome.recovered {
                    info!("poll_recovered");
                }

                if let Some(zones) = zones {
                    self.apply_zones(zones);
                }
                let version = version.or_else(|| self.machine.state().last_known_version.clone());
                self.day = Some((version, day));
                self.publish_snapshot();
                if outcome.loading_cleared {
                    self.updates.send_loading(&key, false).await;
                }
                self.next_tick = Some(Instant::now() + self.settings.interval);
            }
            TaskMessage::Failed { error, .. } => {
                let outcome = self.machine.on_failure();
                self.task = None;
                if outcome.loading_cleared {
                    self.watchdog = None;
                    self.updates.send_loading(&key, false).await;
                }
                self.metrics.record_failure(outcome.consecutive_failures);

                let delay = self.settings.delay_after(outcome.consecutive_failures);
                warn!(
                    error = %error,
                    consecutive_failures = %outcome.consecutive_failures,
                    retry_in_ms = %delay.as_millis(),
                    "poll_failed"
                );

                if outcome.entered_degraded {
                    self.metrics.set_degraded(true);
                    warn!(
                        consecutive_failures = %outcome.consecutive_failures,
                        "poll_degraded"
                    );
                    self.updates.send_degraded(&key, self.machine.staleness()).await;
                }
                self.next_tick = Some(Instant::now() + delay);
            }
        }
    }

    /// Recovery without new data still publishes the cleared status
    fn on_recovered(&self) {
        info!("poll_recovered");
        if self.day.is_some() {
            self.publish_snapshot();
        }
    }

    async fn on_watchdog(&mut self) {
        self.watchdog = None;
        let Some(key) = self.machine.key().cloned() else {
            return;
        };
        if self.machine.clear_loading() {
            self.metrics.record_watchdog_fired();
            warn!(
                watchdog_ms = %self.settings.watchdog.as_millis(),
                seq = self.machine.seq(),
                "refresh_watchdog_fired"
            );
            self.updates.send_loading(&key, false).await;
        }
    }

    /// Re-resolve zones when the configuration differs from the last seen set
    fn apply_zones(&mut self, zones: Vec<ZoneConfig>) -> bool {
        if zones == self.zone_configs {
            debug!(zones = zones.len(), "zones_unchanged");
            return false;
        }
        self.overlay = overlay::resolve(&zones);
        self.zone_configs = zones;
        info!(
            configs = self.zone_configs.len(),
            resolved = self.overlay.zones.len(),
            rejected = self.overlay.rejected.len(),
            "zones_reloaded"
        );
        true
    }

    fn publish_snapshot(&self) {
        let Some(key) = self.machine.key() else {
            return;
        };
        let empty = DayView::default();
        let (version, day) = match &self.day {
            Some((version, day)) => (version.as_ref(), day),
            None => (None, &empty),
        };

        let snapshot: Snapshot = compose(key, version, day, &self.overlay, self.machine.staleness());
        info!(
            key = %key,
            id = %snapshot.id,
            version = ?snapshot.version,
            markers = snapshot.markers.len(),
            zones = snapshot.zones.len(),
            total = snapshot.summary.total,
            active = snapshot.summary.active,
            completed = snapshot.summary.completed,
            issues = snapshot.issues.len(),
            "snapshot_published"
        );
        self.updates.send_snapshot(Arc::new(snapshot));
    }

    fn publish_status(&self) {
        let status = self.machine.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Bound a provider call by the fetch timeout
async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, FetchError>>,
) -> Result<T, FetchError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(limit)),
    }
}

/// Body of one tick task: probe (unless forced), then fetch and build
#[allow(clippy::too_many_arguments)]
async fn run_tick<P: PresenceProvider>(
    provider: &P,
    builder: &SnapshotBuilder,
    key: &SubscriptionKey,
    seq: u64,
    last: Option<VersionToken>,
    force: bool,
    limit: Duration,
    tx: &mpsc::Sender<TaskMessage>,
) -> TaskMessage {
    let started = Instant::now();

    let probed_version = if force {
        None
    } else {
        let probe = match with_timeout(limit, provider.changed_since(key, last.as_ref())).await {
            Ok(probe) => probe,
            Err(error) => return TaskMessage::Failed { seq, error },
        };
        if !needs_refresh(last.as_ref(), &probe) {
            return TaskMessage::Unchanged { seq };
        }
        debug!(
            key = %key,
            known = ?last,
            version = %probe.version,
            changed_flag = probe.changed,
            "poll_tick_changed"
        );
        Some(probe.version)
    };

    let _ = tx.send(TaskMessage::Refreshing { seq, probed: !force }).await;

    let payload = match with_timeout(limit, provider.fetch_day(key)).await {
        Ok(payload) => payload,
        Err(error) => return TaskMessage::Failed { seq, error },
    };

    // The probed token wins; a forced fetch can only learn it from the payload
    let version = probed_version.or(payload.version);
    let day = builder.build_day_view(key, &payload.records);

    TaskMessage::Refreshed { seq, version, day, zones: payload.zones, started }
}
