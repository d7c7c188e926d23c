//! Client for the gateway API served by the monitor inside the home network
//!
//! The device may be switched off or on another network, so every call is
//! bounded by a short timeout and a failed call yields `None` instead of an
//! error.

use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::actuator::{STATE_OFF, STATE_ON};
use crate::trend_cache::TrendCache;
use crate::EntityId;

const NOT_AUTHENTICATED: &str = "Error not authenticated. Use Logon first!";
const DEFAULT_PASSWORD: &str = "admin";
const INSTANTANEOUS_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerKind {
    Load,
    Solar,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputChannel {
    pub input_channel_type: String,
    pub input_channel_connection: String,
    pub ct_input: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub input_channels: Vec<InputChannel>,
}

impl ChannelsConfig {
    pub fn has_grid_production(&self) -> bool {
        self.input_channels
            .iter()
            .any(|c| c.input_channel_type == "PRODUCTION" && c.input_channel_connection == "GRID")
    }
}

/// One controllable node from the command-control configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandControlEntry {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub relay_status: Option<bool>,
    #[serde(default)]
    pub connection_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: Value,
}

impl KeyValue {
    fn number(&self) -> Option<f64> {
        match &self.value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn text(&self) -> Option<String> {
        match &self.value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn phase_keys(phases: &[u32]) -> Vec<String> {
    phases
        .iter()
        .map(|p| format!("phase{p}ActivePower"))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
struct PowerIndices {
    consumption: Vec<String>,
    production: Vec<String>,
}

impl Default for PowerIndices {
    /// Three-phase grid plus three-phase solar
    fn default() -> Self {
        Self {
            consumption: phase_keys(&[0, 1, 2]),
            production: phase_keys(&[3, 4, 5]),
        }
    }
}

impl PowerIndices {
    fn for_emeter_configuration(configuration: &str) -> Option<Self> {
        let (consumption, production): (&[u32], &[u32]) = match configuration {
            "11" => return Some(Self::default()),
            "17" => (&[0], &[1]),
            "4" => (&[0, 1, 2], &[]),
            "0" => (&[0], &[]),
            "16" => (&[0, 1], &[2, 3]),
            _ => return None,
        };
        Some(Self {
            consumption: phase_keys(consumption),
            production: phase_keys(production),
        })
    }
}

pub struct LocalApi {
    host: String,
    timeout: Duration,
    client: reqwest::Client,
    indices: RwLock<PowerIndices>,
    instantaneous: Mutex<TrendCache<PowerKind, f64>>,
}

impl LocalApi {
    /// `address` is the device IP or host name, optionally with a port
    pub fn new(address: &str, timeout: Duration) -> Self {
        Self {
            host: format!("http://{address}/gateway/apipublic"),
            timeout,
            client: reqwest::Client::new(),
            indices: RwLock::new(PowerIndices::default()),
            instantaneous: Mutex::new(TrendCache::with_capacity(INSTANTANEOUS_TTL, 2)),
        }
    }

    async fn try_post(&self, path: &str, body: &str) -> Result<Value, reqwest::Error> {
        self.client
            .post(format!("{}/{}", self.host, path))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn post_once(&self, path: &str, body: &str) -> Option<Value> {
        match self.try_post(path, body).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!(host = %self.host, path, error = %e, "Local gateway unavailable");
                None
            }
        }
    }

    /// Posts, logging on and retrying once when the session has expired
    async fn post(&self, path: &str, body: &str) -> Option<Value> {
        let reply = self.post_once(path, body).await?;
        if reply.get("error").and_then(Value::as_str) != Some(NOT_AUTHENTICATED) {
            return Some(reply);
        }
        debug!(path, "Local gateway session expired, logging on");
        self.logon().await;
        self.post_once(path, body).await
    }

    async fn post_as<T: DeserializeOwned>(&self, path: &str, body: &str) -> Option<T> {
        let reply = self.post(path, body).await?;
        match serde_json::from_value(reply) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(path, error = %e, "Unexpected local gateway reply");
                None
            }
        }
    }

    pub async fn logon(&self) -> Option<Value> {
        self.post_once("logon", DEFAULT_PASSWORD).await
    }

    /// Only available on the 2-series; GRID input channels become the power indices
    pub async fn load_channels_config(&self) -> Option<ChannelsConfig> {
        let config: ChannelsConfig = self.post_as("channelsConfigPublic", "load").await?;
        let mut indices = PowerIndices {
            consumption: Vec::new(),
            production: Vec::new(),
        };
        for channel in config
            .input_channels
            .iter()
            .filter(|c| c.input_channel_connection == "GRID")
        {
            let key = format!("phase{}ActivePower", channel.ct_input);
            match channel.input_channel_type.as_str() {
                "CONSUMPTION" => indices.consumption.push(key),
                "PRODUCTION" => indices.production.push(key),
                _ => {}
            }
        }
        *self.indices.write() = indices;
        Some(config)
    }

    /// Picks the power indices from `emeterConfiguration` (Solar series)
    pub async fn load_config(&self) -> Option<Value> {
        let reply = self.post("configPublic", "load").await?;
        let emeter = serde_json::from_value::<Vec<KeyValue>>(reply.clone())
            .ok()
            .and_then(|entries| {
                entries
                    .into_iter()
                    .find(|e| e.key == "emeterConfiguration")
                    .and_then(|e| e.text())
            });
        if let Some(indices) = emeter.as_deref().and_then(PowerIndices::for_emeter_configuration) {
            *self.indices.write() = indices;
        }
        Some(reply)
    }

    pub async fn load_command_control_config(&self) -> Option<Vec<CommandControlEntry>> {
        self.post_as("commandControlPublic", "load").await
    }

    pub async fn load_instantaneous(&self) -> Option<Value> {
        self.post("instantaneous", "loadInstantaneous").await
    }

    /// Current consumption or solar production in watts, cached for a few seconds
    pub async fn active_power(&self, solar: bool) -> Option<f64> {
        let kind = if solar { PowerKind::Solar } else { PowerKind::Load };
        if let Some(cached) = self.instantaneous.lock().get(&kind) {
            return Some(*cached);
        }

        let reply = self.load_instantaneous().await?;
        let values: Vec<KeyValue> = match serde_json::from_value(reply) {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "Unexpected instantaneous reply");
                return None;
            }
        };
        let power = {
            let indices = self.indices.read();
            let keys = if solar {
                &indices.production
            } else {
                &indices.consumption
            };
            let milliwatts: f64 = values
                .iter()
                .filter(|v| keys.contains(&v.key))
                .filter_map(KeyValue::number)
                .sum();
            (milliwatts / 1000.0).trunc()
        };

        self.instantaneous.lock().insert(kind, power);
        Some(power)
    }

    pub async fn set_actuator_state(&self, actuator: EntityId, state: &str) -> Option<Value> {
        match state {
            STATE_ON => self.on_command_control(actuator).await,
            STATE_OFF => self.off_command_control(actuator).await,
            _ => None,
        }
    }

    pub async fn on_command_control(&self, actuator: EntityId) -> Option<Value> {
        self.command_control(actuator, "ON").await
    }

    pub async fn off_command_control(&self, actuator: EntityId) -> Option<Value> {
        self.command_control(actuator, "OFF").await
    }

    async fn command_control(&self, actuator: EntityId, action: &str) -> Option<Value> {
        let body = format!(
            "control,{}",
            serde_json::json!({ "controllableNodeId": actuator.to_string(), "action": action })
        );
        self.post("commandControlPublic", &body).await
    }
}
