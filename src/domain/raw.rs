//! Wire shapes received from the data provider
//!
//! Records are decoded into [`RawDailyRecord`] right at the boundary, so the
//! rest of the engine never probes for field presence.

use crate::domain::types::{deserialize_opaque, UserId, VersionToken};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Response to a "changed since" probe
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeProbe {
    #[serde(default)]
    pub changed: bool,
    pub version: VersionToken,
}

/// Full payload for one (date, tenant) key
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DayPayload {
    /// Version of this payload, when the provider includes it
    #[serde(default)]
    pub version: Option<VersionToken>,
    /// Per-user records, kept as raw JSON so one bad row cannot fail the batch
    #[serde(default)]
    pub records: Vec<Value>,
    /// `None` when the provider sent no zone list; `Some(vec![])` clears zones
    #[serde(default)]
    pub zones: Option<Vec<ZoneConfig>>,
}

/// Timestamp that can be a date/time string or epoch milliseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    Text(String),
    EpochMs(i64),
}

impl TimestampValue {
    pub fn is_none(&self) -> bool {
        matches!(self, TimestampValue::None)
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(if value.trim().is_empty() {
                TimestampValue::None
            } else {
                TimestampValue::Text(value.to_string())
            })
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(i64::try_from(value).map(TimestampValue::EpochMs).unwrap_or_default())
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_f64<E>(self, value: f64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            // Epoch millis serialized as floats, e.g. 1.7145504e12
            if value.is_finite() && value.abs() < i64::MAX as f64 {
                Ok(TimestampValue::EpochMs(value.trunc() as i64))
            } else {
                Ok(TimestampValue::None)
            }
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }

        fn visit_none<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// Treat JSON `null` and empty strings as absent
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }))
}

/// Photo URL; anything other than a non-empty string counts as no photo
fn deserialize_photo<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        _ => None,
    })
}

/// Both sides of one punch cycle as the provider sends them
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawCycle {
    #[serde(default, deserialize_with = "deserialize_present")]
    pub punchin_location: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub punchout_location: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub punchin_time: TimestampValue,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub punchout_time: TimestampValue,
    #[serde(default, alias = "punchin_photo", deserialize_with = "deserialize_photo")]
    pub punchin_image: Option<String>,
    #[serde(default, alias = "punchout_photo", deserialize_with = "deserialize_photo")]
    pub punchout_image: Option<String>,
    /// Completion flag from the source; only meaningful in cycle-bearing records
    #[serde(default, alias = "complete")]
    pub is_complete: bool,
}

/// Shape of a user's record for one day
#[derive(Debug, Clone, PartialEq)]
pub enum RawDailyRecord {
    /// Record carries an explicit ordered list of cycles
    Cycles { user_id: UserId, name: Option<String>, cycles: Vec<RawCycle> },
    /// Record carries one pair of top-level punch fields
    Legacy { user_id: UserId, name: Option<String>, punches: RawCycle },
}

#[derive(Deserialize)]
struct RecordWire {
    #[serde(alias = "userId", alias = "employee_id", alias = "id")]
    user_id: UserId,
    #[serde(default, alias = "employee_name")]
    name: Option<String>,
    #[serde(default)]
    cycles: Option<Vec<RawCycle>>,
    #[serde(flatten)]
    punches: RawCycle,
}

impl From<RecordWire> for RawDailyRecord {
    fn from(wire: RecordWire) -> Self {
        match wire.cycles {
            Some(cycles) => RawDailyRecord::Cycles { user_id: wire.user_id, name: wire.name, cycles },
            None => RawDailyRecord::Legacy {
                user_id: wire.user_id,
                name: wire.name,
                punches: wire.punches,
            },
        }
    }
}

impl<'de> Deserialize<'de> for RawDailyRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RecordWire::deserialize(deserializer).map(RawDailyRecord::from)
    }
}

impl RawDailyRecord {
    pub fn user_id(&self) -> &UserId {
        match self {
            RawDailyRecord::Cycles { user_id, .. } | RawDailyRecord::Legacy { user_id, .. } => {
                user_id
            }
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            RawDailyRecord::Cycles { name, .. } | RawDailyRecord::Legacy { name, .. } => {
                name.as_deref()
            }
        }
    }
}

/// A named list of points inside a multi-list zone definition
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NamedPointList {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "waypoints", alias = "coordinates")]
    pub points: Vec<Value>,
}

/// Raw zone definition from configuration.
///
/// `kind` is the type discriminator; the point lists are interpreted by the
/// overlay resolver according to it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ZoneConfig {
    #[serde(
        default,
        alias = "attendance_type_id",
        alias = "attendanceTypeId",
        deserialize_with = "deserialize_opaque"
    )]
    pub attendance_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", alias = "zone_type")]
    pub kind: String,
    #[serde(default, alias = "coordinates")]
    pub points: Option<Vec<Value>>,
    #[serde(default)]
    pub polygons: Option<Vec<NamedPointList>>,
    #[serde(default)]
    pub waypoints: Option<Vec<Value>>,
    #[serde(default)]
    pub routes: Option<Vec<NamedPointList>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_legacy_record() {
        let record: RawDailyRecord = serde_json::from_value(json!({
            "user_id": 17,
            "punchin_location": "23.81,90.41",
            "punchout_location": null,
            "punchin_time": "2024-05-01 09:00:00",
            "punchout_time": null,
            "punchin_image": "https://cdn.example/in.jpg"
        }))
        .unwrap();

        match record {
            RawDailyRecord::Legacy { user_id, punches, .. } => {
                assert_eq!(user_id, UserId::from("17"));
                assert_eq!(punches.punchin_location, Some(json!("23.81,90.41")));
                assert_eq!(punches.punchout_location, None);
                assert!(punches.punchout_time.is_none());
                assert_eq!(punches.punchin_image.as_deref(), Some("https://cdn.example/in.jpg"));
            }
            other => panic!("expected legacy record, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_cycle_record() {
        let record: RawDailyRecord = serde_json::from_value(json!({
            "userId": "u-1",
            "cycles": [
                { "punchin_location": {"lat": 1.0, "lng": 2.0}, "is_complete": false },
                { "punchin_location": "1,2", "punchout_location": "1,3", "complete": true,
                  "punchout_time": 1714550400000i64 }
            ]
        }))
        .unwrap();

        let RawDailyRecord::Cycles { cycles, .. } = record else {
            panic!("expected cycle-bearing record");
        };
        assert_eq!(cycles.len(), 2);
        assert!(!cycles[0].is_complete);
        assert!(cycles[1].is_complete);
        assert_eq!(cycles[1].punchout_time, TimestampValue::EpochMs(1714550400000));
    }

    #[test]
    fn test_odd_photo_and_float_timestamp_degrade_per_field() {
        let record: RawDailyRecord = serde_json::from_value(json!({
            "user_id": "a",
            "punchin_location": "1,2",
            "punchin_time": 1.7145504e12,
            "punchin_photo": {"url": "https://cdn.example/in.jpg"},
            "punchout_photo": 42
        }))
        .unwrap();
        let RawDailyRecord::Legacy { punches, .. } = record else {
            panic!("expected legacy record");
        };
        assert_eq!(punches.punchin_time, TimestampValue::EpochMs(1714550400000));
        assert_eq!(punches.punchin_image, None);
        assert_eq!(punches.punchout_image, None);
        assert_eq!(punches.punchin_location, Some(json!("1,2")));
    }

    #[test]
    fn test_day_payload_tells_absent_zones_from_empty() {
        let absent: DayPayload = serde_json::from_value(json!({ "records": [] })).unwrap();
        assert_eq!(absent.zones, None);
        let empty: DayPayload = serde_json::from_value(json!({ "zones": [] })).unwrap();
        assert_eq!(empty.zones, Some(Vec::new()));
    }

    #[test]
    fn test_empty_location_string_is_absent() {
        let record: RawDailyRecord =
            serde_json::from_value(json!({ "user_id": "a", "punchin_location": "  " })).unwrap();
        let RawDailyRecord::Legacy { punches, .. } = record else {
            panic!("expected legacy record");
        };
        assert_eq!(punches.punchin_location, None);
    }

    #[test]
    fn test_decode_change_probe() {
        let probe: ChangeProbe =
            serde_json::from_value(json!({ "changed": true, "version": 1714550400 })).unwrap();
        assert!(probe.changed);
        assert_eq!(probe.version, VersionToken::from("1714550400"));
    }

    #[test]
    fn test_decode_zone_config() {
        let zone: ZoneConfig = serde_json::from_value(json!({
            "attendance_type_id": 3,
            "name": "Depot",
            "type": "polygon",
            "points": ["1,1", "1,2", "2,2"]
        }))
        .unwrap();
        assert_eq!(zone.attendance_type, "3");
        assert_eq!(zone.kind, "polygon");
        assert_eq!(zone.points.map(|p| p.len()), Some(3));
    }
}
