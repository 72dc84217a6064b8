//! Shared types for the presence engine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Newtype wrapper for user IDs; upstream sends them as strings or integers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_opaque_string(deserializer, "a string or integer user id").map(UserId)
    }
}

/// Newtype wrapper for tenant IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token used to detect that upstream data changed.
///
/// Only equality is meaningful; the provider may encode it as a JSON string
/// or number and both normalize to the same textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct VersionToken(pub String);

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_opaque_string(deserializer, "a string or integer version token")
            .map(VersionToken)
    }
}

/// Deserialize an identifier that may arrive as a string or an integer
pub(crate) fn deserialize_opaque<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_opaque_string(deserializer, "a string or integer identifier")
}

/// Accept a JSON string or integer and keep its textual form
fn deserialize_opaque_string<'de, D>(deserializer: D, expecting: &'static str) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct OpaqueVisitor(&'static str);

    impl<'de> Visitor<'de> for OpaqueVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str(self.0)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_string<E: de::Error>(self, value: String) -> Result<String, E> {
            Ok(value)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<String, E> {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(OpaqueVisitor(expecting))
}

/// Identifies one polling subscription: a calendar day for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionKey {
    pub date: NaiveDate,
    pub tenant: TenantId,
}

impl SubscriptionKey {
    pub fn new(date: NaiveDate, tenant: impl Into<String>) -> Self {
        Self { date, tenant: TenantId(tenant.into()) }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tenant, self.date)
    }
}

/// A validated WGS84 coordinate pair.
///
/// Construction goes through [`LocationSample::new`], which rejects NaN and
/// out-of-range values, so every instance satisfies
/// `-90 <= latitude <= 90` and `-180 <= longitude <= 180`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocationSample {
    latitude: f64,
    longitude: f64,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let lat_ok = (-90.0..=90.0).contains(&latitude);
        let lng_ok = (-180.0..=180.0).contains(&longitude);
        (lat_ok && lng_ok).then_some(Self { latitude, longitude })
    }

    #[inline]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[inline]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Shift by a display offset, clamping into the valid range
    pub fn offset(&self, d_lat: f64, d_lng: f64) -> Self {
        Self {
            latitude: (self.latitude + d_lat).clamp(-90.0, 90.0),
            longitude: (self.longitude + d_lng).clamp(-180.0, 180.0),
        }
    }
}

/// Which end of an attendance cycle a punch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchKind {
    In,
    Out,
}

impl PunchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PunchKind::In => "in",
            PunchKind::Out => "out",
        }
    }
}

/// One side of an attendance action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PunchEvent {
    pub user_id: UserId,
    pub kind: PunchKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
}

/// One punch-in/punch-out pairing for a user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceCycle {
    pub user_id: UserId,
    #[serde(rename = "in", skip_serializing_if = "Option::is_none")]
    pub punch_in: Option<PunchEvent>,
    #[serde(rename = "out", skip_serializing_if = "Option::is_none")]
    pub punch_out: Option<PunchEvent>,
    pub complete: bool,
}

impl AttendanceCycle {
    /// The side an open cycle is anchored on.
    ///
    /// Returns the only side with a resolved location, or `None` when both
    /// (or neither) sides resolved.
    pub fn anchor(&self) -> Option<PunchKind> {
        let in_resolved = self.punch_in.as_ref().is_some_and(|p| p.location.is_some());
        let out_resolved = self.punch_out.as_ref().is_some_and(|p| p.location.is_some());
        match (in_resolved, out_resolved) {
            (true, false) => Some(PunchKind::In),
            (false, true) => Some(PunchKind::Out),
            _ => None,
        }
    }

    /// Sides with a resolved location, in-side first
    pub fn located_sides(&self) -> impl Iterator<Item = (&PunchEvent, LocationSample)> {
        [self.punch_in.as_ref(), self.punch_out.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|p| p.location.map(|loc| (p, loc)))
    }
}

/// Output of one deduplication step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedPoint {
    pub owner_id: UserId,
    pub original: LocationSample,
    pub adjusted: LocationSample,
    /// Nudges applied (0 when the original position was free)
    pub attempts: u32,
    /// False when the attempt budget ran out before the point cleared
    pub settled: bool,
}

/// Axis-aligned lat/lng box
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Smallest box containing every point, `None` for an empty input
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a LocationSample>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bounds = Self {
            min_lat: first.latitude(),
            max_lat: first.latitude(),
            min_lng: first.longitude(),
            max_lng: first.longitude(),
        };
        for p in iter {
            bounds.extend(p);
        }
        Some(bounds)
    }

    pub fn extend(&mut self, p: &LocationSample) {
        self.min_lat = self.min_lat.min(p.latitude());
        self.max_lat = self.max_lat.max(p.latitude());
        self.min_lng = self.min_lng.min(p.longitude());
        self.max_lng = self.max_lng.max(p.longitude());
    }
}

/// Geometry of a static overlay zone
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ZoneGeometry {
    /// Closed geofence ring, at least 3 points
    Polygon { points: Vec<LocationSample> },
    /// Permitted path, at least 2 waypoints
    Route { waypoints: Vec<LocationSample> },
}

impl ZoneGeometry {
    pub fn points(&self) -> &[LocationSample] {
        match self {
            ZoneGeometry::Polygon { points } => points,
            ZoneGeometry::Route { waypoints } => waypoints,
        }
    }
}

/// A static overlay zone owned by an attendance type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayZone {
    pub attendance_type: String,
    pub name: String,
    pub geometry: ZoneGeometry,
}

/// Presence counts for one day
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PresenceSummary {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
}

/// Freshness of the data behind a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Staleness {
    pub last_success_at: Option<DateTime<Utc>>,
    pub degraded: bool,
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_sample_range() {
        assert!(LocationSample::new(90.0, 180.0).is_some());
        assert!(LocationSample::new(-90.0, -180.0).is_some());
        assert!(LocationSample::new(90.0001, 0.0).is_none());
        assert!(LocationSample::new(0.0, -180.5).is_none());
        assert!(LocationSample::new(f64::NAN, 0.0).is_none());
    }

    #[test]
    fn test_offset_clamps() {
        let p = LocationSample::new(89.99995, 179.9999).unwrap();
        let moved = p.offset(0.001, 0.001);
        assert_eq!(moved.latitude(), 90.0);
        assert_eq!(moved.longitude(), 180.0);
    }

    #[test]
    fn test_version_token_from_number_or_string() {
        let a: VersionToken = serde_json::from_str("42").unwrap();
        let b: VersionToken = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bounds_from_points() {
        let pts = [
            LocationSample::new(23.80, 90.40).unwrap(),
            LocationSample::new(23.82, 90.38).unwrap(),
        ];
        let b = BoundingBox::from_points(&pts).unwrap();
        assert_eq!(b.min_lat, 23.80);
        assert_eq!(b.max_lat, 23.82);
        assert_eq!(b.min_lng, 90.38);
        assert_eq!(b.max_lng, 90.40);
        assert!(BoundingBox::from_points(std::iter::empty()).is_none());
    }

    #[test]
    fn test_anchor() {
        let user = UserId::from("7");
        let here = LocationSample::new(1.0, 2.0);
        let side = |kind, location| PunchEvent {
            user_id: user.clone(),
            kind,
            timestamp: None,
            location,
            photo_ref: None,
        };
        let open = AttendanceCycle {
            user_id: user.clone(),
            punch_in: Some(side(PunchKind::In, here)),
            punch_out: Some(side(PunchKind::Out, None)),
            complete: false,
        };
        assert_eq!(open.anchor(), Some(PunchKind::In));

        let both = AttendanceCycle {
            user_id: user.clone(),
            punch_in: Some(side(PunchKind::In, here)),
            punch_out: Some(side(PunchKind::Out, here)),
            complete: true,
        };
        assert_eq!(both.anchor(), None);
        assert_eq!(both.located_sides().count(), 2);
    }
}
