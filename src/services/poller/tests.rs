use super::*;
use crate::domain::raw::{ChangeProbe, DayPayload};
use crate::infra::config::BackoffMode;
use crate::io::update_channel::{create_update_channel, PresenceUpdate};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::timeout_at;

#[derive(Default)]
struct FakeProvider {
    version: Mutex<String>,
    records: Mutex<Vec<Value>>,
    zones: Mutex<Option<Vec<ZoneConfig>>>,
    failing: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
    probes: AtomicUsize,
    fetches: AtomicUsize,
    keys_fetched: Mutex<Vec<SubscriptionKey>>,
}

impl FakeProvider {
    fn new(version: &str) -> Arc<Self> {
        let provider = Self::default();
        *provider.version.lock() = version.to_string();
        *provider.records.lock() = vec![json!({
            "user_id": "A",
            "punchin_location": "23.8103,90.4125",
            "punchin_time": "09:00"
        })];
        Arc::new(provider)
    }

    fn set_version(&self, version: &str) {
        *self.version.lock() = version.to_string();
    }

    fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceProvider for FakeProvider {
    async fn changed_since(
        &self,
        _key: &SubscriptionKey,
        last: Option<&VersionToken>,
    ) -> Result<ChangeProbe, FetchError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Other("provider down".to_string()));
        }
        let version = VersionToken(self.version.lock().clone());
        Ok(ChangeProbe { changed: last != Some(&version), version })
    }

    async fn fetch_day(&self, key: &SubscriptionKey) -> Result<DayPayload, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.keys_fetched.lock().push(key.clone());
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Other("provider down".to_string()));
        }
        Ok(DayPayload {
            version: Some(VersionToken(self.version.lock().clone())),
            records: self.records.lock().clone(),
            zones: self.zones.lock().clone(),
        })
    }
}

struct Harness {
    provider: Arc<FakeProvider>,
    handle: PollerHandle,
    updates: mpsc::Receiver<PresenceUpdate>,
    metrics: Arc<Metrics>,
    task: JoinHandle<()>,
    _shutdown: watch::Sender<bool>,
}

fn spawn(provider: Arc<FakeProvider>, settings: PollSettings) -> Harness {
    spawn_with_buffer(provider, settings, 256)
}

fn spawn_with_buffer(provider: Arc<FakeProvider>, settings: PollSettings, buffer: usize) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let (sender, updates) = create_update_channel(buffer, metrics.clone());
    let (handle, poller) = create_poller(
        provider.clone(),
        settings,
        SnapshotBuilder::default(),
        sender,
        metrics.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(poller.run(shutdown_rx));
    Harness { provider, handle, updates, metrics, task, _shutdown: shutdown_tx }
}

fn key(tenant: &str) -> SubscriptionKey {
    SubscriptionKey::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), tenant)
}

fn yard() -> ZoneConfig {
    serde_json::from_value(json!({
        "name": "Yard",
        "type": "polygon",
        "points": ["1,1", "1,2", "2,2"]
    }))
    .unwrap()
}

fn depot() -> ZoneConfig {
    serde_json::from_value(json!({
        "name": "Depot",
        "type": "polygon",
        "points": ["5,5", "5,6", "6,6"]
    }))
    .unwrap()
}

/// Next snapshot, skipping status updates
async fn next_snapshot(rx: &mut mpsc::Receiver<PresenceUpdate>) -> Arc<Snapshot> {
    let deadline = Instant::now() + Duration::from_secs(600);
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(PresenceUpdate::Snapshot(snapshot))) => return snapshot,
            Ok(Some(_)) => continue,
            other => panic!("no snapshot: {:?}", other.map(|u| u.map(|u| u.kind()))),
        }
    }
}

/// Next snapshot from a refresh, also consuming the loading-off that closes it
async fn next_refresh(rx: &mut mpsc::Receiver<PresenceUpdate>) -> Arc<Snapshot> {
    let snapshot = next_snapshot(rx).await;
    let deadline = Instant::now() + Duration::from_secs(600);
    match timeout_at(deadline, rx.recv()).await {
        Ok(Some(PresenceUpdate::Loading { loading: false, .. })) => snapshot,
        other => panic!("refresh not closed: {:?}", other.map(|u| u.map(|u| u.kind()))),
    }
}

fn loading_signals(updates: &[PresenceUpdate]) -> Vec<(SubscriptionKey, bool)> {
    updates
        .iter()
        .filter_map(|u| match u {
            PresenceUpdate::Loading { key, loading } => Some((key.clone(), *loading)),
            _ => None,
        })
        .collect()
}

/// Everything received within `window`
async fn collect_for(
    rx: &mut mpsc::Receiver<PresenceUpdate>,
    window: Duration,
) -> Vec<PresenceUpdate> {
    let deadline = Instant::now() + window;
    let mut out = Vec::new();
    while let Ok(Some(update)) = timeout_at(deadline, rx.recv()).await {
        out.push(update);
    }
    out
}

fn snapshots(updates: &[PresenceUpdate]) -> Vec<Arc<Snapshot>> {
    updates
        .iter()
        .filter_map(|u| match u {
            PresenceUpdate::Snapshot(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_probe_does_not_fetch() {
    let mut h = spawn(FakeProvider::new("v1"), PollSettings::default());
    assert!(h.handle.start(key("acme")).await);

    let first = next_refresh(&mut h.updates).await;
    assert_eq!(first.version, Some(VersionToken::from("v1")));
    assert_eq!(first.markers.len(), 1);

    let later = collect_for(&mut h.updates, Duration::from_secs(30)).await;
    assert!(later.is_empty(), "unexpected updates: {}", later.len());
    assert_eq!(h.provider.fetches(), 1);
    assert!(h.provider.probes() >= 6);
    assert_eq!(h.handle.status().state.last_known_version, Some(VersionToken::from("v1")));
}

#[tokio::test(start_paused = true)]
async fn test_version_change_publishes_exactly_one_snapshot() {
    let mut h = spawn(FakeProvider::new("v1"), PollSettings::default());
    h.handle.start(key("acme")).await;
    next_refresh(&mut h.updates).await;

    h.provider.set_version("v2");
    h.provider.records.lock().push(json!({
        "user_id": "B",
        "punchin_location": "23.9,90.5",
        "punchout_location": "23.91,90.51",
        "punchout_time": "17:00"
    }));

    let updates = collect_for(&mut h.updates, Duration::from_secs(12)).await;
    let published = snapshots(&updates);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].version, Some(VersionToken::from("v2")));
    assert_eq!(published[0].summary.total, 2);
    assert_eq!(published[0].summary.completed, 1);
    assert_eq!(h.provider.fetches(), 2);

    // Loading brackets the refresh
    let kinds: Vec<_> = updates.iter().map(|u| u.kind()).collect();
    assert_eq!(kinds, vec!["loading", "snapshot", "loading"]);
}

#[tokio::test(start_paused = true)]
async fn test_failures_degrade_once_then_recover() {
    let settings = PollSettings { backoff: BackoffMode::Fixed, ..PollSettings::default() };
    let provider = FakeProvider::new("v1");
    provider.failing.store(true, Ordering::SeqCst);
    let mut h = spawn(provider, settings);
    h.handle.start(key("acme")).await;

    let updates = collect_for(&mut h.updates, Duration::from_secs(60)).await;
    let degraded: Vec<_> = updates
        .iter()
        .filter_map(|u| match u {
            PresenceUpdate::Degraded { key, staleness } => Some((key.clone(), staleness.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(degraded.len(), 1);
    let (degraded_key, staleness) = &degraded[0];
    assert_eq!(degraded_key, &key("acme"));
    assert!(staleness.degraded);
    assert_eq!(staleness.consecutive_failures, 3);
    assert!(staleness.last_success_at.is_none());
    assert!(h.handle.status().degraded);
    assert!(h.metrics.failures_total() >= 10);

    h.provider.failing.store(false, Ordering::SeqCst);
    let recovered = next_snapshot(&mut h.updates).await;
    assert!(!recovered.staleness.degraded);
    assert_eq!(recovered.staleness.consecutive_failures, 0);
    assert!(recovered.staleness.last_success_at.is_some());
    assert!(!h.handle.status().degraded);
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_spaces_out_probes() {
    let provider = FakeProvider::new("v1");
    provider.failing.store(true, Ordering::SeqCst);
    let mut h = spawn(provider, PollSettings::default());
    h.handle.start(key("acme")).await;

    // t=0, +10s, +20s, +40s => 4 probes inside 75s
    collect_for(&mut h.updates, Duration::from_secs(75)).await;
    assert_eq!(h.provider.probes(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_key_change_discards_old_subscription() {
    let provider = FakeProvider::new("v1");
    *provider.fetch_delay.lock() = Some(Duration::from_secs(3));
    let mut h = spawn(provider, PollSettings::default());

    h.handle.start(key("old")).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.handle.start(key("new")).await;

    let updates = collect_for(&mut h.updates, Duration::from_secs(20)).await;
    let published = snapshots(&updates);
    assert!(!published.is_empty());
    assert!(published.iter().all(|s| s.key == key("new")));
    assert!(h.provider.keys_fetched.lock().contains(&key("old")));
    assert_eq!(h.handle.status().key, Some(key("new")));

    // The interrupted refresh is closed under the key it was opened for
    assert_eq!(
        loading_signals(&updates),
        vec![(key("old"), true), (key("old"), false), (key("new"), true), (key("new"), false)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_clears_loading_while_fetch_hangs() {
    let settings = PollSettings {
        watchdog: Duration::from_secs(2),
        fetch_timeout: Duration::from_secs(30),
        ..PollSettings::default()
    };
    let provider = FakeProvider::new("v1");
    *provider.fetch_delay.lock() = Some(Duration::from_secs(10));
    let mut h = spawn(provider, settings);
    h.handle.start(key("acme")).await;

    let first = collect_for(&mut h.updates, Duration::from_secs(5)).await;
    let kinds: Vec<_> = first.iter().map(|u| u.kind()).collect();
    assert_eq!(kinds, vec!["loading", "loading"]);
    assert!(matches!(first[1], PresenceUpdate::Loading { loading: false, .. }));
    assert_eq!(h.metrics.watchdog_fired_total(), 1);

    let status = h.handle.status();
    assert_eq!(status.phase, PollPhase::Refreshing);
    assert!(!status.loading);

    // The late result still lands, without a second loading-off
    let rest = collect_for(&mut h.updates, Duration::from_secs(8)).await;
    let kinds: Vec<_> = rest.iter().map(|u| u.kind()).collect();
    assert_eq!(kinds, vec!["snapshot"]);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_loading_off_survives_full_channel() {
    let settings = PollSettings {
        watchdog: Duration::from_secs(2),
        fetch_timeout: Duration::from_secs(30),
        ..PollSettings::default()
    };
    let provider = FakeProvider::new("v1");
    *provider.fetch_delay.lock() = Some(Duration::from_secs(10));
    let mut h = spawn_with_buffer(provider, settings, 1);
    h.handle.start(key("acme")).await;

    // Consumer stalls past the watchdog while loading-on fills the channel
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.metrics.watchdog_fired_total(), 1);

    let updates = collect_for(&mut h.updates, Duration::from_secs(15)).await;
    let kinds: Vec<_> = updates.iter().map(|u| u.kind()).collect();
    assert_eq!(kinds, vec!["loading", "loading", "snapshot"]);
    assert_eq!(loading_signals(&updates), vec![(key("acme"), true), (key("acme"), false)]);
    assert_eq!(h.metrics.updates_dropped_total(), 0);
    assert!(!h.handle.status().loading);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_timeout_counts_as_failure() {
    let settings = PollSettings { fetch_timeout: Duration::from_secs(1), ..PollSettings::default() };
    let provider = FakeProvider::new("v1");
    *provider.fetch_delay.lock() = Some(Duration::from_secs(5));
    let mut h = spawn(provider, settings);
    h.handle.start(key("acme")).await;

    collect_for(&mut h.updates, Duration::from_secs(2)).await;
    let status = h.handle.status();
    assert_eq!(status.state.consecutive_failures, 1);
    assert!(!status.loading);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_now_bypasses_probe() {
    let mut h = spawn(FakeProvider::new("v1"), PollSettings::default());
    h.handle.start(key("acme")).await;
    next_refresh(&mut h.updates).await;
    let probes = h.provider.probes();

    assert!(h.handle.refresh_now().await);
    let snapshot = next_refresh(&mut h.updates).await;
    assert_eq!(snapshot.version, Some(VersionToken::from("v1")));
    assert_eq!(h.provider.probes(), probes);
    assert_eq!(h.provider.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zone_reload_publishes_only_on_change() {
    let mut h = spawn(FakeProvider::new("v1"), PollSettings::default());
    h.handle.start(key("acme")).await;
    let first = next_refresh(&mut h.updates).await;
    assert!(first.zones.is_empty());
    assert!(first.bounds.is_none());

    h.handle.reload_zones(vec![yard()]).await;
    let with_zone = next_snapshot(&mut h.updates).await;
    assert_eq!(with_zone.zones.len(), 1);
    assert!(with_zone.bounds.is_some());
    assert_eq!(with_zone.version, first.version);

    h.handle.reload_zones(vec![yard()]).await;
    let later = collect_for(&mut h.updates, Duration::from_secs(1)).await;
    assert!(snapshots(&later).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_payload_zones_are_resolved() {
    let provider = FakeProvider::new("v1");
    *provider.zones.lock() = Some(vec![yard()]);
    let mut h = spawn(provider, PollSettings::default());
    h.handle.start(key("acme")).await;

    let snapshot = next_refresh(&mut h.updates).await;
    assert_eq!(snapshot.zones.len(), 1);
    assert_eq!(snapshot.zones[0].name, "Yard");
}

#[tokio::test(start_paused = true)]
async fn test_tenant_switch_drops_previous_tenant_zones() {
    let provider = FakeProvider::new("v1");
    *provider.zones.lock() = Some(vec![yard()]);
    let mut h = spawn(provider, PollSettings::default());
    h.handle.reload_zones(vec![depot()]).await;
    h.handle.start(key("tenant-a")).await;

    let first = next_refresh(&mut h.updates).await;
    let names: Vec<_> = first.zones.iter().map(|z| z.name.as_str()).collect();
    assert_eq!(names, vec!["Yard"]);

    // Tenant B's payloads carry no zone list, so only the loaded set applies
    *h.provider.zones.lock() = None;
    h.handle.start(key("tenant-b")).await;
    let switched = next_refresh(&mut h.updates).await;
    assert_eq!(switched.key, key("tenant-b"));
    let names: Vec<_> = switched.zones.iter().map(|z| z.name.as_str()).collect();
    assert_eq!(names, vec!["Depot"]);

    // An explicit empty list clears everything
    *h.provider.zones.lock() = Some(Vec::new());
    h.provider.set_version("v2");
    let cleared = next_refresh(&mut h.updates).await;
    assert!(cleared.zones.is_empty());
    assert!(cleared.bounds.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_date_change_keeps_tenant_zones() {
    let provider = FakeProvider::new("v1");
    *provider.zones.lock() = Some(vec![yard()]);
    let mut h = spawn(provider, PollSettings::default());
    h.handle.start(key("acme")).await;
    next_refresh(&mut h.updates).await;

    *h.provider.zones.lock() = None;
    let next_day = SubscriptionKey::new(NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(), "acme");
    h.handle.start(next_day.clone()).await;
    let snapshot = next_refresh(&mut h.updates).await;
    assert_eq!(snapshot.key, next_day);
    assert_eq!(snapshot.zones.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_exits_loop() {
    let mut h = spawn(FakeProvider::new("v1"), PollSettings::default());
    h.handle.start(key("acme")).await;
    next_refresh(&mut h.updates).await;

    assert!(h.handle.stop().await);
    h.task.await.unwrap();
    assert_eq!(h.handle.status().phase, PollPhase::Stopped);
    assert!(!h.handle.refresh_now().await);
}

#[tokio::test(start_paused = true)]
async fn test_idle_poller_does_not_probe() {
    let mut h = spawn(FakeProvider::new("v1"), PollSettings::default());
    h.handle.refresh_now().await;
    let updates = collect_for(&mut h.updates, Duration::from_secs(30)).await;
    assert!(updates.is_empty());
    assert_eq!(h.provider.probes(), 0);
    assert_eq!(h.handle.status().phase, PollPhase::Idle);
}
