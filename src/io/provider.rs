//! Data provider interface
//!
//! The poller only ever talks to the provider through this trait, so tests
//! can drive it with an in-process fake.

use crate::domain::error::FetchError;
use crate::domain::raw::{ChangeProbe, DayPayload};
use crate::domain::types::{SubscriptionKey, VersionToken};
use async_trait::async_trait;

#[async_trait]
pub trait PresenceProvider: Send + Sync + 'static {
    /// Cheap probe: has anything changed for `key` since `last`?
    async fn changed_since(
        &self,
        key: &SubscriptionKey,
        last: Option<&VersionToken>,
    ) -> Result<ChangeProbe, FetchError>;

    /// Full payload for `key`
    async fn fetch_day(&self, key: &SubscriptionKey) -> Result<DayPayload, FetchError>;
}
