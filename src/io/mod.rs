//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `provider` - Data provider trait the poller talks through
//! - `http_provider` - reqwest-backed provider for the attendance service
//! - `update_channel` - Typed channel for presence updates
//! - `egress` - Snapshot output to file (JSONL format)
//! - `mqtt_egress` - MQTT publisher for snapshots and status signals
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod http_provider;
pub mod mqtt_egress;
pub mod prometheus;
pub mod provider;
pub mod update_channel;

// Re-export commonly used types
pub use egress::Egress;
pub use http_provider::HttpProvider;
pub use mqtt_egress::MqttPublisher;
pub use provider::PresenceProvider;
pub use update_channel::{create_update_channel, PresenceUpdate, StatusPayload, UpdateSender};
