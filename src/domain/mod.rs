//! Domain models - core presence types and provider wire shapes
//!
//! This module contains the canonical data types used throughout the engine:
//! - `types` - Locations, punches, cycles, placed points, zones, summaries
//! - `raw` - Provider payloads decoded at the boundary
//! - `snapshot` - The renderer-facing snapshot
//! - `error` - Error taxonomy (parse, fetch, configuration)

pub mod error;
pub mod raw;
pub mod snapshot;
pub mod types;

// Re-export commonly used types at module level
pub use error::{ConfigurationError, FetchError, ParseError};
pub use snapshot::{DataIssue, Marker, Snapshot};
pub use types::{
    AttendanceCycle, BoundingBox, LocationSample, OverlayZone, PlacedPoint, PresenceSummary,
    PunchEvent, PunchKind, Staleness, SubscriptionKey, TenantId, UserId, VersionToken,
    ZoneGeometry,
};
