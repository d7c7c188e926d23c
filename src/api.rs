//! REST collaborator seam: response types and the `MeteringApi` trait

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::actuator::StateValue;
use crate::appliance::ApplianceEvent;
use crate::error::Result;
use crate::measurement::MeasurementChannel;
use crate::sensor::SensorChannel;
use crate::{EntityId, LocationId};

/// Granularity of a consumption query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Only available for the last 14 days
    FiveMinutes,
    Hourly,
    Daily,
    Monthly,
    Quarterly,
}

impl Aggregation {
    pub fn as_param(self) -> u8 {
        match self {
            Aggregation::FiveMinutes => 1,
            Aggregation::Hourly => 2,
            Aggregation::Daily => 3,
            Aggregation::Monthly => 4,
            Aggregation::Quarterly => 5,
        }
    }
}

/// Query window, sent as epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The `minutes` leading up to now
    pub fn last_minutes(minutes: i64) -> Self {
        let to = Utc::now();
        Self {
            from: to - Duration::minutes(minutes),
            to,
        }
    }

    pub fn from_ms(&self) -> i64 {
        self.from.timestamp_millis()
    }

    pub fn to_ms(&self) -> i64 {
        self.to.timestamp_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLocationSummary {
    pub service_location_id: LocationId,
    #[serde(default)]
    pub service_location_uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_serial_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLocations {
    #[serde(default)]
    pub app_name: Option<String>,
    pub service_locations: Vec<ServiceLocationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceConfig {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub source_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorConfig {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub states: Vec<StateValue>,
    #[serde(default)]
    pub connection_state: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorConfig {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    pub channels: Vec<SensorChannel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementConfig {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subcircuit_type: Option<String>,
    pub channels: Vec<MeasurementChannel>,
}

/// Topology of one service location. Appliances, actuators and sensors are
/// always part of the document; a load without them is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringConfiguration {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub service_location_uuid: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub phase_type: Option<String>,
    pub appliances: Vec<ApplianceConfig>,
    pub actuators: Vec<ActuatorConfig>,
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub measurements: Vec<MeasurementConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLocationInfo {
    pub service_location_id: LocationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub electricity_cost: Option<f64>,
    #[serde(default)]
    pub electricity_currency: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionBlock {
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub consumption: Option<f64>,
    #[serde(default)]
    pub solar: Option<f64>,
    #[serde(default)]
    pub always_on: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionResult {
    #[serde(default)]
    pub consumptions: Vec<ConsumptionBlock>,
}

/// Sensor and switch consumption; record keys depend on the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordsResult {
    #[serde(default)]
    pub records: Vec<Map<String, Value>>,
}

/// Bearer token provider. Token exchange itself lives outside this crate.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;

    /// Called once after the API rejected the current token
    async fn refresh(&self) -> Result<String>;
}

/// A fixed token that is never refreshed
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Cloud REST operations used to mirror a location
#[async_trait]
pub trait MeteringApi: Send + Sync {
    async fn get_service_locations(&self) -> Result<ServiceLocations>;

    async fn get_metering_configuration(&self, location: LocationId) -> Result<MeteringConfiguration>;

    async fn get_service_location_info(&self, location: LocationId) -> Result<ServiceLocationInfo>;

    async fn get_actuator_state(&self, location: LocationId, actuator: EntityId) -> Result<String>;

    /// Connection state with surrounding quotes removed
    async fn get_actuator_connection_state(
        &self,
        location: LocationId,
        actuator: EntityId,
    ) -> Result<String>;

    async fn set_actuator_state(
        &self,
        location: LocationId,
        actuator: EntityId,
        state: &str,
        duration: Option<u32>,
    ) -> Result<()>;

    async fn get_consumption(
        &self,
        location: LocationId,
        range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<ConsumptionResult>;

    async fn get_sensor_consumption(
        &self,
        location: LocationId,
        sensor: EntityId,
        range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<RecordsResult>;

    async fn get_switch_consumption(
        &self,
        location: LocationId,
        switch: EntityId,
        range: TimeRange,
        aggregation: Aggregation,
    ) -> Result<RecordsResult>;

    async fn get_events(
        &self,
        location: LocationId,
        appliance: EntityId,
        range: TimeRange,
        max_number: Option<u32>,
    ) -> Result<Vec<ApplianceEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_range_in_milliseconds() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let range = TimeRange::new(from, from + Duration::minutes(9));
        assert_eq!(range.from_ms(), 1_704_067_200_000);
        assert_eq!(range.to_ms() - range.from_ms(), 9 * 60 * 1000);
    }

    #[test]
    fn test_metering_configuration_requires_entity_lists() {
        let missing_sensors = r#"{"appliances": [], "actuators": []}"#;
        assert!(serde_json::from_str::<MeteringConfiguration>(missing_sensors).is_err());

        let minimal = r#"{"appliances": [], "actuators": [], "sensors": []}"#;
        let parsed: MeteringConfiguration = serde_json::from_str(minimal).unwrap();
        assert!(parsed.measurements.is_empty());
    }

    #[test]
    fn test_consumption_block_parses_camel_case() {
        let parsed: ConsumptionResult = serde_json::from_str(
            r#"{"consumptions": [{"timestamp": 1, "consumption": 1200.5, "solar": 300, "alwaysOn": 75}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.consumptions[0].always_on, Some(75.0));
        assert_eq!(parsed.consumptions[0].solar, Some(300.0));
    }
}
