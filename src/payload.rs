//! Telemetry payloads published by the broker

use serde::de::{self, Deserializer};
use serde_derive::Deserialize;
use serde_json::Value;

use crate::EntityId;

/// Message type of an actuator on/off command echo on the bare location topic
pub const MESSAGE_TYPE_ACTUATOR_COMMAND: i64 = 1283;

/// Central `power` topic. Per-channel arrays are indexed by `powerTopicIndex`,
/// voltages arrive in tenths of a volt.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerPayload {
    #[serde(default)]
    pub consumption_power: Option<f64>,
    #[serde(default)]
    pub solar_power: Option<f64>,
    #[serde(default)]
    pub always_on: Option<f64>,
    #[serde(default)]
    pub phase_voltage_data: Option<Vec<f64>>,
    #[serde(default, rename = "phaseVoltageH3Data")]
    pub phase_voltage_h3_data: Option<Vec<f64>>,
    #[serde(default, rename = "phaseVoltageH5Data")]
    pub phase_voltage_h5_data: Option<Vec<f64>>,
    #[serde(default)]
    pub line_voltage_data: Option<Vec<f64>>,
    #[serde(default, rename = "lineVoltageH3Data")]
    pub line_voltage_h3_data: Option<Vec<f64>>,
    #[serde(default, rename = "lineVoltageH5Data")]
    pub line_voltage_h5_data: Option<Vec<f64>>,
    #[serde(default)]
    pub active_power_data: Option<Vec<f64>>,
    #[serde(default)]
    pub reactive_power_data: Option<Vec<f64>>,
    #[serde(default)]
    pub current_data: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VoltageReading {
    #[serde(default)]
    pub voltage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPower {
    pub publish_index: usize,
    #[serde(default)]
    pub power: f64,
    /// Tenths of an ampere
    #[serde(default)]
    pub current: f64,
}

/// Local `realtime` topic
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimePayload {
    #[serde(default)]
    pub total_power: Option<f64>,
    #[serde(default)]
    pub total_reactive_power: Option<f64>,
    #[serde(default)]
    pub voltages: Option<Vec<VoltageReading>>,
    #[serde(default)]
    pub channel_powers: Vec<ChannelPower>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPayload {
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub service_location_id: Option<i64>,
    #[serde(default)]
    pub service_location_uuid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PresencePayload {
    #[serde(default)]
    pub value: Option<bool>,
}

/// `plug/{id}/state` and `plug/{id}/connectionState`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlugValuePayload {
    pub value: String,
    #[serde(default)]
    pub since: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetCurrentPayload {
    pub phase: usize,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartDeviceStatePayload {
    #[serde(rename = "deviceUUID")]
    pub device_uuid: String,
    pub connection_status: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorCommand {
    #[serde(deserialize_with = "entity_id")]
    pub controllable_node_id: EntityId,
    pub action: String,
    /// Milliseconds since epoch
    pub timestamp: f64,
}

impl ActuatorCommand {
    pub fn since_seconds(&self) -> i64 {
        (self.timestamp / 1000.0) as i64
    }
}

/// Message on the bare location topic
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(default)]
    pub message_type: Option<i64>,
    #[serde(default)]
    pub content: Value,
}

/// Node ids show up both as numbers and as numeric strings
fn entity_id<'de, D>(deserializer: D) -> Result<EntityId, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Value = serde::Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| de::Error::custom(format!("invalid node id {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid node id {s}"))),
        other => Err(de::Error::custom(format!("invalid node id {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_payload_field_names() {
        let payload: PowerPayload = serde_json::from_str(
            r#"{
                "consumptionPower": 1500, "solarPower": 0, "alwaysOn": 80,
                "phaseVoltageData": [2301, 2299, 2310],
                "phaseVoltageH3Data": [1, 2, 3],
                "activePowerData": [500, 500, 500]
            }"#,
        )
        .unwrap();
        assert_eq!(payload.consumption_power, Some(1500.0));
        assert_eq!(payload.phase_voltage_h3_data, Some(vec![1.0, 2.0, 3.0]));
        assert_eq!(payload.line_voltage_data, None);
        assert_eq!(payload.active_power_data.map(|v| v.len()), Some(3));
    }

    #[test]
    fn test_actuator_command_accepts_string_node_id() {
        let command: ActuatorCommand = serde_json::from_str(
            r#"{"controllableNodeId": "7", "action": "ON", "timestamp": 1700000000123}"#,
        )
        .unwrap();
        assert_eq!(command.controllable_node_id, 7);
        assert_eq!(command.since_seconds(), 1_700_000_000);

        let numeric: ActuatorCommand = serde_json::from_str(
            r#"{"controllableNodeId": 12, "action": "OFF", "timestamp": 5000}"#,
        )
        .unwrap();
        assert_eq!(numeric.controllable_node_id, 12);
        assert_eq!(numeric.since_seconds(), 5);
    }
}
