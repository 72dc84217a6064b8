//! Attendance cycle reconstruction
//!
//! Turns one user's raw daily record into an ordered list of
//! [`AttendanceCycle`]s. Both record shapes are supported:
//! - cycle-bearing records: one cycle per source entry, in source order
//! - legacy records: exactly one synthetic cycle from the top-level fields
//!
//! A cycle with no resolvable location on either side is dropped since there
//! is nothing to place on a map. A cycle with one resolvable side is kept as
//! an open cycle anchored on that side.

use crate::domain::error::ParseError;
use crate::domain::raw::{RawCycle, RawDailyRecord, TimestampValue};
use crate::domain::types::{AttendanceCycle, PunchEvent, PunchKind, UserId};
use crate::services::coords;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::debug;

const DATETIME_FORMATS: [&str; 4] =
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"];
const TIME_FORMATS: [&str; 4] = ["%H:%M:%S", "%H:%M", "%I:%M:%S %p", "%I:%M %p"];

/// Cycles for one user plus the coordinate values that failed to parse
#[derive(Debug, Default)]
pub struct Reconstruction {
    pub cycles: SmallVec<[AttendanceCycle; 2]>,
    pub rejected: Vec<ParseError>,
}

/// Rebuild a user's cycles for `day` from their raw record
pub fn reconstruct(user_id: &UserId, record: &RawDailyRecord, day: NaiveDate) -> Reconstruction {
    let mut out = Reconstruction::default();

    match record {
        RawDailyRecord::Cycles { cycles, .. } => {
            for (idx, raw) in cycles.iter().enumerate() {
                let (punch_in, punch_out) = build_sides(user_id, raw, day, &mut out.rejected);
                let complete = raw.is_complete && has_location(&punch_in) && has_location(&punch_out);
                push_cycle(&mut out, user_id, idx, punch_in, punch_out, complete);
            }
        }
        RawDailyRecord::Legacy { punches, .. } => {
            let (punch_in, punch_out) = build_sides(user_id, punches, day, &mut out.rejected);
            let complete = has_location(&punch_in)
                && has_location(&punch_out)
                && punch_out.as_ref().is_some_and(|p| p.timestamp.is_some());
            push_cycle(&mut out, user_id, 0, punch_in, punch_out, complete);
        }
    }

    out
}

fn push_cycle(
    out: &mut Reconstruction,
    user_id: &UserId,
    idx: usize,
    punch_in: Option<PunchEvent>,
    punch_out: Option<PunchEvent>,
    complete: bool,
) {
    if !has_location(&punch_in) && !has_location(&punch_out) {
        debug!(user_id = %user_id, cycle = idx, "cycle_dropped_no_location");
        return;
    }

    out.cycles.push(AttendanceCycle { user_id: user_id.clone(), punch_in, punch_out, complete });
}

#[inline]
fn has_location(side: &Option<PunchEvent>) -> bool {
    side.as_ref().is_some_and(|p| p.location.is_some())
}

fn build_sides(
    user_id: &UserId,
    raw: &RawCycle,
    day: NaiveDate,
    rejected: &mut Vec<ParseError>,
) -> (Option<PunchEvent>, Option<PunchEvent>) {
    let punch_in = build_side(
        user_id,
        PunchKind::In,
        raw.punchin_location.as_ref(),
        &raw.punchin_time,
        raw.punchin_image.as_deref(),
        day,
        rejected,
    );
    let punch_out = build_side(
        user_id,
        PunchKind::Out,
        raw.punchout_location.as_ref(),
        &raw.punchout_time,
        raw.punchout_image.as_deref(),
        day,
        rejected,
    );
    (punch_in, punch_out)
}

/// Build one side; `None` when the record has no evidence for it at all
fn build_side(
    user_id: &UserId,
    kind: PunchKind,
    location: Option<&Value>,
    time: &TimestampValue,
    photo: Option<&str>,
    day: NaiveDate,
    rejected: &mut Vec<ParseError>,
) -> Option<PunchEvent> {
    if location.is_none() && time.is_none() && photo.is_none() {
        return None;
    }

    let location = location.and_then(|raw| match coords::parse(raw) {
        Ok(sample) => Some(sample),
        Err(e) => {
            debug!(user_id = %user_id, side = kind.as_str(), error = %e, "punch_location_rejected");
            rejected.push(e);
            None
        }
    });

    Some(PunchEvent {
        user_id: user_id.clone(),
        kind,
        timestamp: parse_timestamp(time, day),
        location,
        photo_ref: photo.map(str::to_string),
    })
}

/// Resolve a raw punch time.
///
/// Accepts RFC 3339, naive date-times (taken as UTC), bare times of day
/// (combined with `day`) and epoch milliseconds.
pub fn parse_timestamp(value: &TimestampValue, day: NaiveDate) -> Option<DateTime<Utc>> {
    match value {
        TimestampValue::None => None,
        TimestampValue::EpochMs(ms) => DateTime::from_timestamp_millis(*ms),
        TimestampValue::Text(text) => {
            let text = text.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Some(naive) =
                DATETIME_FORMATS.iter().find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
            {
                return Some(naive.and_utc());
            }
            if let Some(time) =
                TIME_FORMATS.iter().find_map(|f| NaiveTime::parse_from_str(text, f).ok())
            {
                return Some(day.and_time(time).and_utc());
            }
            debug!(raw = %text, "punch_time_unparseable");
            None
        }
    }
}
