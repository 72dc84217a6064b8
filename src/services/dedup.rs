//! Spatial deduplication of map markers
//!
//! Markers from different users often share (or nearly share) coordinates,
//! e.g. everyone punching in at the same office. Stacked markers cannot be
//! selected individually, so each point is nudged along a fixed diagonal
//! until it clears every point already placed in the same pass.
//!
//! Placement is strictly sequential in input order, so the output is
//! deterministic for a given input. Worst case is O(n²·attempts), fine for the
//! few hundred markers a single view shows.

use crate::domain::types::{LocationSample, PlacedPoint, UserId};
use crate::infra::config::Config;
use tracing::debug;

/// Points closer than this in both axes are considered colliding (degrees)
pub const DEFAULT_EPSILON_DEG: f64 = 0.0001;
/// One nudge step along the diagonal (degrees)
pub const DEFAULT_OFFSET_DEG: f64 = 0.00015;
/// Nudges tried before accepting a residual collision
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Tunables for the deduplicator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupParams {
    pub epsilon_deg: f64,
    pub offset_deg: f64,
    pub max_attempts: u32,
}

impl Default for DedupParams {
    fn default() -> Self {
        Self {
            epsilon_deg: DEFAULT_EPSILON_DEG,
            offset_deg: DEFAULT_OFFSET_DEG,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl From<&Config> for DedupParams {
    fn from(config: &Config) -> Self {
        Self {
            epsilon_deg: config.dedup_epsilon_deg(),
            offset_deg: config.dedup_offset_deg(),
            max_attempts: config.dedup_max_attempts(),
        }
    }
}

/// A point waiting to be placed
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub owner_id: UserId,
    pub location: LocationSample,
}

/// Places points so they stay individually selectable
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    params: DedupParams,
}

impl Deduplicator {
    pub fn new(params: DedupParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DedupParams {
        &self.params
    }

    /// Place a batch of points, in order
    pub fn place(&self, requests: &[PlacementRequest]) -> Vec<PlacedPoint> {
        let mut placed: Vec<PlacedPoint> = Vec::with_capacity(requests.len());

        for req in requests {
            let mut candidate = req.location;
            let mut attempts = 0u32;

            while attempts < self.params.max_attempts && self.collides(&placed, &candidate) {
                attempts += 1;
                let step = self.params.offset_deg * f64::from(attempts);
                candidate = req.location.offset(step, step);
            }

            let settled = !self.collides(&placed, &candidate);
            if !settled {
                debug!(
                    owner_id = %req.owner_id,
                    attempts = attempts,
                    lat = candidate.latitude(),
                    lng = candidate.longitude(),
                    "placement_budget_exhausted"
                );
            }

            placed.push(PlacedPoint {
                owner_id: req.owner_id.clone(),
                original: req.location,
                adjusted: candidate,
                attempts,
                settled,
            });
        }

        placed
    }

    #[inline]
    fn collides(&self, placed: &[PlacedPoint], candidate: &LocationSample) -> bool {
        placed.iter().any(|p| is_close(&p.adjusted, candidate, self.params.epsilon_deg))
    }
}

/// Closeness check: within `epsilon` degrees in both latitude and longitude
#[inline]
pub fn is_close(a: &LocationSample, b: &LocationSample, epsilon: f64) -> bool {
    (a.latitude() - b.latitude()).abs() < epsilon
        && (a.longitude() - b.longitude()).abs() < epsilon
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(owner: &str, lat: f64, lng: f64) -> PlacementRequest {
        PlacementRequest {
            owner_id: UserId::from(owner),
            location: LocationSample::new(lat, lng).unwrap(),
        }
    }

    #[test]
    fn test_two_users_same_spot_are_separated() {
        let dedup = Deduplicator::default();
        let placed = dedup.place(&[req("a", 23.8103, 90.4125), req("b", 23.8103, 90.4125)]);

        assert_eq!(placed.len(), 2);
        assert_ne!(placed[0].adjusted, placed[1].adjusted);
        for p in &placed {
            assert!((p.adjusted.latitude() - 23.8103).abs() < 0.001);
            assert!((p.adjusted.longitude() - 90.4125).abs() < 0.001);
            assert!(p.settled);
        }
        assert_eq!(placed[0].attempts, 0);
        assert_eq!(placed[1].attempts, 1);
    }

    #[test]
    fn test_distant_points_untouched() {
        let dedup = Deduplicator::default();
        let placed = dedup.place(&[req("a", 10.0, 10.0), req("b", 10.01, 10.0)]);
        for p in &placed {
            assert_eq!(p.original, p.adjusted);
            assert_eq!(p.attempts, 0);
        }
    }

    #[test]
    fn test_input_order_decides_who_moves() {
        let dedup = Deduplicator::default();
        let placed = dedup.place(&[req("second", 1.0, 1.0), req("first", 1.0, 1.0)]);
        assert_eq!(placed[0].owner_id, UserId::from("second"));
        assert_eq!(placed[0].attempts, 0);
        assert_eq!(placed[1].owner_id, UserId::from("first"));
        assert_eq!(placed[1].attempts, 1);
    }

    #[test]
    fn test_deterministic() {
        let dedup = Deduplicator::default();
        let batch: Vec<_> = (0..20).map(|i| req(&i.to_string(), 5.0, 5.0)).collect();
        assert_eq!(dedup.place(&batch), dedup.place(&batch));
    }

    #[test]
    fn test_dense_cluster_exhausts_budget() {
        let params = DedupParams { max_attempts: 3, ..DedupParams::default() };
        let dedup = Deduplicator::new(params);
        let batch: Vec<_> = (0..50).map(|i| req(&i.to_string(), 23.8103, 90.4125)).collect();
        let placed = dedup.place(&batch);

        let unsettled = placed.iter().filter(|p| !p.settled).count();
        assert!(unsettled > 0);
        let max_shift = params.offset_deg * f64::from(params.max_attempts) + 1e-12;
        for p in &placed {
            assert!(p.attempts <= params.max_attempts);
            assert!((p.adjusted.latitude() - p.original.latitude()).abs() <= max_shift);
        }
    }

    #[test]
    fn test_separation_or_exhaustion_for_scattered_batches() {
        // Small LCG so the batch is reproducible without an RNG dependency
        let mut seed: u64 = 0x5eed;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as f64 / (1u64 << 31) as f64
        };

        let dedup = Deduplicator::default();
        for _ in 0..20 {
            let batch: Vec<_> = (0..60)
                .map(|i| req(&i.to_string(), 23.81 + next() * 0.001, 90.41 + next() * 0.001))
                .collect();
            let placed = dedup.place(&batch);
            let eps = dedup.params().epsilon_deg;

            for j in 0..placed.len() {
                for i in 0..j {
                    let close = is_close(&placed[i].adjusted, &placed[j].adjusted, eps);
                    assert!(!close || !placed[j].settled, "pair ({i}, {j}) collides");
                }
            }
        }
    }
}
