//! Snapshot building
//!
//! The pure pipeline over one fetched day: decode each record, rebuild cycles
//! per user, place every located punch through the deduplicator and count
//! presence. Zones are resolved separately and joined in [`compose`].

use crate::domain::raw::RawDailyRecord;
use crate::domain::snapshot::{new_snapshot_id, DataIssue, Marker, Snapshot};
use crate::domain::types::{
    AttendanceCycle, PresenceSummary, PunchEvent, Staleness, SubscriptionKey, UserId,
    VersionToken,
};
use crate::services::cycles;
use crate::services::dedup::{Deduplicator, PlacementRequest};
use crate::services::overlay::OverlayResolution;
use crate::services::presence;
use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, warn};

/// User-derived part of a snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayView {
    pub markers: Vec<Marker>,
    pub summary: PresenceSummary,
    pub issues: Vec<DataIssue>,
}

/// Everything collected for one user across the payload
#[derive(Debug, Default)]
struct UserDay {
    name: Option<String>,
    cycles: Vec<AttendanceCycle>,
}

/// Builds day views with a fixed deduplication policy
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    dedup: Deduplicator,
}

impl SnapshotBuilder {
    pub fn new(dedup: Deduplicator) -> Self {
        Self { dedup }
    }

    /// Run records for `key` through reconstruction, placement and aggregation
    pub fn build_day_view(&self, key: &SubscriptionKey, records: &[Value]) -> DayView {
        let mut issues = Vec::new();
        // First-seen order drives placement, so the output is deterministic
        let mut order: Vec<UserId> = Vec::new();
        let mut days: FxHashMap<UserId, UserDay> = FxHashMap::default();

        for (idx, value) in records.iter().enumerate() {
            let record = match serde_json::from_value::<RawDailyRecord>(value.clone()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(key = %key, record = idx, error = %e, "record_undecodable");
                    issues.push(DataIssue {
                        user_id: None,
                        message: format!("record {idx} could not be decoded: {e}"),
                    });
                    continue;
                }
            };

            let user_id = record.user_id().clone();
            let rebuilt = cycles::reconstruct(&user_id, &record, key.date);
            for err in rebuilt.rejected {
                issues.push(DataIssue { user_id: Some(user_id.clone()), message: err.to_string() });
            }

            let day = days.entry(user_id.clone()).or_insert_with(|| {
                order.push(user_id.clone());
                UserDay::default()
            });
            if day.name.is_none() {
                day.name = record.name().map(str::to_string);
            }
            day.cycles.extend(rebuilt.cycles);
        }

        let mut requests = Vec::new();
        let mut sources: Vec<(&PunchEvent, usize, bool, Option<&String>)> = Vec::new();
        for user_id in &order {
            let Some(day) = days.get(user_id) else { continue };
            for (cycle_index, cycle) in day.cycles.iter().enumerate() {
                for (event, location) in cycle.located_sides() {
                    requests.push(PlacementRequest { owner_id: user_id.clone(), location });
                    sources.push((event, cycle_index, cycle.complete, day.name.as_ref()));
                }
            }
        }

        let placed = self.dedup.place(&requests);
        let markers: Vec<Marker> = placed
            .into_iter()
            .zip(sources)
            .map(|(placed, (event, cycle_index, cycle_complete, name))| Marker {
                placed,
                event: event.clone(),
                cycle_index,
                cycle_complete,
                display_name: name.cloned(),
            })
            .collect();

        let cycles_by_user: FxHashMap<UserId, Vec<AttendanceCycle>> =
            days.into_iter().map(|(id, day)| (id, day.cycles)).collect();
        let summary = presence::summarize(&cycles_by_user);

        debug!(
            key = %key,
            records = records.len(),
            users = order.len(),
            markers = markers.len(),
            issues = issues.len(),
            "day_view_built"
        );

        DayView { markers, summary, issues }
    }
}

/// Join a day view with the current zones into a renderer-facing snapshot
pub fn compose(
    key: &SubscriptionKey,
    version: Option<&VersionToken>,
    day: &DayView,
    overlay: &OverlayResolution,
    staleness: Staleness,
) -> Snapshot {
    let mut issues = day.issues.clone();
    issues.extend(
        overlay.rejected.iter().map(|e| DataIssue { user_id: None, message: e.to_string() }),
    );

    Snapshot {
        id: new_snapshot_id(),
        key: key.clone(),
        version: version.cloned(),
        generated_at: Utc::now(),
        markers: day.markers.clone(),
        zones: overlay.zones.clone(),
        bounds: overlay.bounds,
        summary: day.summary,
        staleness,
        issues,
    }
}
