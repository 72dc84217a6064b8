//! Presence aggregation
//!
//! Counts users present for the day and splits them into still-active and
//! completed by the state of their most recent cycle.

use crate::domain::types::{AttendanceCycle, PresenceSummary, UserId};
use rustc_hash::FxHashMap;

/// Summarize reconstructed cycles per user.
///
/// A user counts towards `total` once any of their cycles has an in side.
/// The last cycle in source order decides between `active` and `completed`.
pub fn summarize<C>(cycles_by_user: &FxHashMap<UserId, C>) -> PresenceSummary
where
    C: AsRef<[AttendanceCycle]>,
{
    let mut summary = PresenceSummary::default();

    for cycles in cycles_by_user.values() {
        let cycles = cycles.as_ref();
        if !cycles.iter().any(|c| c.punch_in.is_some()) {
            continue;
        }
        summary.total += 1;

        match cycles.last() {
            Some(last) if last.complete => summary.completed += 1,
            Some(_) => summary.active += 1,
            None => {}
        }
    }

    summary
}
