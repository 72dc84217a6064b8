//! Renderer-facing snapshot of one subscription

use crate::domain::types::{
    BoundingBox, OverlayZone, PlacedPoint, PresenceSummary, PunchEvent, Staleness,
    SubscriptionKey, UserId, VersionToken,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Generate a time-ordered snapshot identifier
pub fn new_snapshot_id() -> String {
    Uuid::now_v7().to_string()
}

/// A placed marker together with the punch it represents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub placed: PlacedPoint,
    pub event: PunchEvent,
    /// Position of the owning cycle in the user's day
    pub cycle_index: usize,
    /// Whether the owning cycle is complete
    pub cycle_complete: bool,
    /// Display name from the source record, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A data-quality problem found while building a snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub message: String,
}

/// Everything a renderer needs for one refresh
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// UUIDv7, so ids sort by generation time
    pub id: String,
    pub key: SubscriptionKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionToken>,
    pub generated_at: DateTime<Utc>,
    pub markers: Vec<Marker>,
    pub zones: Vec<OverlayZone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BoundingBox>,
    pub summary: PresenceSummary,
    pub staleness: Staleness,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<DataIssue>,
}

impl Snapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_ids_are_unique_and_ordered() {
        let a = new_snapshot_id();
        let b = new_snapshot_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
        assert!(a < b);
    }
}
