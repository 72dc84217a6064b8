//! Typed channel for presence updates
//!
//! Hands snapshots and status signals from the poller to consumers. Bounded
//! so a stalled consumer cannot grow memory: a snapshot that finds the
//! channel full is dropped and counted (the next one supersedes it), while
//! loading and degraded signals wait for capacity and are never dropped.

use crate::domain::snapshot::Snapshot;
use crate::domain::types::{Staleness, SubscriptionKey};
use crate::infra::metrics::Metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages delivered to snapshot consumers
#[derive(Debug, Clone)]
pub enum PresenceUpdate {
    /// A freshly built snapshot; also carries cleared staleness after recovery
    Snapshot(Arc<Snapshot>),
    /// Loading indicator on/off around a refresh of `key`
    Loading { key: SubscriptionKey, loading: bool },
    /// Failure ceiling reached for `key`; sent once per degraded episode
    Degraded { key: SubscriptionKey, staleness: Staleness },
}

impl PresenceUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            PresenceUpdate::Snapshot(_) => "snapshot",
            PresenceUpdate::Loading { .. } => "loading",
            PresenceUpdate::Degraded { .. } => "degraded",
        }
    }

    /// Status signals must reach consumers; snapshots may be superseded
    pub fn is_control(&self) -> bool {
        !matches!(self, PresenceUpdate::Snapshot(_))
    }
}

/// Status message for the status topic
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub key: String,
    /// Timestamp (epoch ms)
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loading: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
}

impl StatusPayload {
    pub fn loading(key: &SubscriptionKey, loading: bool) -> Self {
        Self {
            key: key.to_string(),
            ts: Utc::now().timestamp_millis(),
            loading: Some(loading),
            degraded: None,
            consecutive_failures: None,
            last_success_at: None,
        }
    }

    pub fn staleness(key: &SubscriptionKey, staleness: &Staleness) -> Self {
        Self {
            key: key.to_string(),
            ts: Utc::now().timestamp_millis(),
            loading: None,
            degraded: Some(staleness.degraded),
            consecutive_failures: Some(staleness.consecutive_failures),
            last_success_at: staleness.last_success_at,
        }
    }
}

/// Sender handle for presence updates
///
/// Clone this to share across producers.
/// Snapshots never block; status signals wait until the consumer makes room.
#[derive(Clone)]
pub struct UpdateSender {
    tx: mpsc::Sender<PresenceUpdate>,
    metrics: Arc<Metrics>,
}

impl UpdateSender {
    pub fn new(tx: mpsc::Sender<PresenceUpdate>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    /// Try to enqueue a snapshot; returns false if it was dropped
    pub fn send_snapshot(&self, snapshot: Arc<Snapshot>) -> bool {
        let markers = snapshot.markers.len();
        let issues = snapshot.issues.len();
        match self.tx.try_send(PresenceUpdate::Snapshot(snapshot)) {
            Ok(()) => {
                self.metrics.record_snapshot_published(markers, issues);
                true
            }
            Err(e) => {
                self.metrics.record_update_dropped();
                debug!(kind = "snapshot", error = %e, "presence_update_dropped");
                false
            }
        }
    }

    pub async fn send_loading(&self, key: &SubscriptionKey, loading: bool) -> bool {
        self.deliver(PresenceUpdate::Loading { key: key.clone(), loading }).await
    }

    pub async fn send_degraded(&self, key: &SubscriptionKey, staleness: Staleness) -> bool {
        self.deliver(PresenceUpdate::Degraded { key: key.clone(), staleness }).await
    }

    /// Wait for capacity; fails only once the receiver is gone
    async fn deliver(&self, update: PresenceUpdate) -> bool {
        let kind = update.kind();
        match self.tx.send(update).await {
            Ok(()) => true,
            Err(_) => {
                debug!(kind = kind, "presence_update_receiver_closed");
                false
            }
        }
    }
}

/// Create a new update channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_update_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (UpdateSender, mpsc::Receiver<PresenceUpdate>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (UpdateSender::new(tx, metrics), rx)
}
