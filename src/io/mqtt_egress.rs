//! MQTT publisher for presence updates
//!
//! Publishes poller output to MQTT topics for downstream renderers:
//! - presence/snapshots - Full snapshot JSONs (QoS 0, retained)
//! - presence/status - Loading (QoS 0) and degraded (QoS 1) signals

use crate::infra::config::Config;
use crate::io::update_channel::{PresenceUpdate, StatusPayload};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives updates forwarded by the dispatcher and publishes them.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<PresenceUpdate>,
    snapshots_topic: String,
    status_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<PresenceUpdate>) -> Self {
        let client_id = format!("presence-engine-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);
        // Snapshots of busy days easily exceed the default 10 KiB limit
        mqttoptions.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            snapshots_topic: config.mqtt_snapshots_topic().to_string(),
            status_topic: config.mqtt_status_topic().to_string(),
        }
    }

    /// Run the publisher loop until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            snapshots = %self.snapshots_topic,
            status = %self.status_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(update) = self.rx.try_recv() {
                            self.publish_update(update).await;
                        }
                        return;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(update) => self.publish_update(update).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn publish_update(&self, update: PresenceUpdate) {
        match update {
            PresenceUpdate::Snapshot(snapshot) => {
                // Retained so a late subscriber gets the current picture
                let json = snapshot.to_json();
                if let Err(e) = self
                    .client
                    .publish(&self.snapshots_topic, QoS::AtMostOnce, true, json.into_bytes())
                    .await
                {
                    error!(error = %e, "mqtt_egress_snapshot_failed");
                }
            }
            PresenceUpdate::Loading { key, loading } => {
                self.publish_status(&StatusPayload::loading(&key, loading), QoS::AtMostOnce).await;
            }
            PresenceUpdate::Degraded { key, staleness } => {
                self.publish_status(&StatusPayload::staleness(&key, &staleness), QoS::AtLeastOnce)
                    .await;
            }
        }
    }

    async fn publish_status(&self, payload: &StatusPayload, qos: QoS) {
        match serde_json::to_vec(payload) {
            Ok(json) => {
                if let Err(e) = self.client.publish(&self.status_topic, qos, false, json).await {
                    debug!(error = %e, "mqtt_egress_status_failed");
                }
            }
            Err(e) => error!(error = %e, "mqtt_egress_status_encode_failed"),
        }
    }
}
