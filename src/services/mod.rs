//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `coords` - Coordinate parsing for every accepted wire shape
//! - `cycles` - Attendance cycle reconstruction from raw records
//! - `dedup` - Collision-free marker placement
//! - `overlay` - Zone geometry resolution
//! - `presence` - Daily presence counts
//! - `snapshot` - Day view building and snapshot composition
//! - `poller` - Change-detection poll loop

pub mod coords;
pub mod cycles;
pub mod dedup;
pub mod overlay;
pub mod poller;
pub mod presence;
pub mod snapshot;

// Re-export commonly used types
pub use dedup::{DedupParams, Deduplicator};
pub use overlay::OverlayResolution;
pub use poller::{create_poller, PollCommand, PollPhase, PollSettings, PollStatus, Poller, PollerHandle};
pub use snapshot::{DayView, SnapshotBuilder};
