//! Tracking toggle and heartbeat for the central broker session
//!
//! The backend only streams realtime values to clients that re-arm tracking
//! now and then. Both timers run in their own task, independent of inbound
//! traffic, and fire for the first time right after subscribing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};

use crate::settings::Settings;
use crate::telemetry::TelemetryClient;
use crate::LocationId;

#[derive(Debug, Clone, PartialEq)]
pub struct KeepAlive {
    prefix: String,
    client_id: String,
    serial_number: Option<String>,
    location_id: LocationId,
    tracking_interval: Duration,
    heartbeat_interval: Duration,
    toggle_delay: Duration,
}

impl KeepAlive {
    pub fn new(
        settings: &Settings,
        prefix: impl Into<String>,
        client_id: impl Into<String>,
        serial_number: Option<String>,
        location_id: LocationId,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            client_id: client_id.into(),
            serial_number,
            location_id,
            tracking_interval: settings.tracking_interval,
            heartbeat_interval: settings.heartbeat_interval,
            toggle_delay: settings.tracking_toggle_delay,
        }
    }

    pub fn tracking_topic(&self) -> String {
        format!("{}/tracking", self.prefix)
    }

    pub fn heartbeat_topic(&self) -> String {
        format!("{}/homeassistant/heartbeat", self.prefix)
    }

    pub fn tracking_payload(&self, on: bool) -> Vec<u8> {
        json!({
            "value": if on { "ON" } else { "OFF" },
            "clientId": self.client_id,
            "serialNumber": self.serial_number,
            "type": "RT_VALUES",
        })
        .to_string()
        .into_bytes()
    }

    pub fn heartbeat_payload(&self) -> Vec<u8> {
        json!({ "serviceLocationId": self.location_id })
            .to_string()
            .into_bytes()
    }

    pub fn spawn(self, client: Arc<dyn TelemetryClient>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(client.as_ref()).await;
        })
    }

    async fn run(&self, client: &dyn TelemetryClient) {
        let mut tracking = interval(self.tracking_interval);
        let mut heartbeat = interval(self.heartbeat_interval);
        tracking.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tracking.tick() => self.publish_tracking(client).await,
                _ = heartbeat.tick() => self.publish_heartbeat(client).await,
            }
        }
    }

    /// Turns tracking off and back on to restart the realtime stream
    async fn publish_tracking(&self, client: &dyn TelemetryClient) {
        let topic = self.tracking_topic();
        if let Err(e) = client.publish(&topic, self.tracking_payload(false)).await {
            warn!(location_id = self.location_id, error = %e, "Failed to publish tracking OFF");
        }
        sleep(self.toggle_delay).await;
        if let Err(e) = client.publish(&topic, self.tracking_payload(true)).await {
            warn!(location_id = self.location_id, error = %e, "Failed to publish tracking ON");
            return;
        }
        debug!(location_id = self.location_id, "Tracking re-armed");
    }

    async fn publish_heartbeat(&self, client: &dyn TelemetryClient) {
        if let Err(e) = client
            .publish(&self.heartbeat_topic(), self.heartbeat_payload())
            .await
        {
            warn!(location_id = self.location_id, error = %e, "Failed to publish heartbeat");
        }
    }
}
