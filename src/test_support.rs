//! Canned REST backend and log capture shared by the unit tests

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::api::{
    Aggregation, ConsumptionResult, MeteringApi, MeteringConfiguration, RecordsResult,
    ServiceLocationInfo, ServiceLocationSummary, ServiceLocations, TimeRange,
};
use crate::appliance::ApplianceEvent;
use crate::error::{Error, Result};
use crate::{EntityId, LocationId};

pub const UUID: &str = "abc-123";

/// Serves a fixed configuration for every location and counts calls per endpoint
#[derive(Default)]
pub struct FakeApi {
    calls: Mutex<HashMap<&'static str, usize>>,
    failing: Mutex<Vec<&'static str>>,
    failing_locations: Mutex<Vec<LocationId>>,
    locations: Mutex<Vec<ServiceLocationSummary>>,
}

impl FakeApi {
    fn hit(&self, endpoint: &'static str) -> Result<()> {
        *self.calls.lock().entry(endpoint).or_default() += 1;
        if self.failing.lock().contains(&endpoint) {
            return Err(Error::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(())
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls.lock().get(endpoint).copied().unwrap_or(0)
    }

    pub fn fail(&self, endpoint: &'static str, failing: bool) {
        let mut list = self.failing.lock();
        list.retain(|e| *e != endpoint);
        if failing {
            list.push(endpoint);
        }
    }

    /// Makes the metering configuration of one location unavailable
    pub fn fail_location(&self, id: LocationId) {
        self.failing_locations.lock().push(id);
    }

    pub fn set_locations(&self, locations: &[(LocationId, Option<&str>)]) {
        *self.locations.lock() = locations
            .iter()
            .map(|(id, serial)| ServiceLocationSummary {
                service_location_id: *id,
                service_location_uuid: Some(format!("{UUID}-{id}")),
                name: Some(format!("Location {id}")),
                device_serial_number: serial.map(str::to_string),
            })
            .collect();
    }
}

#[async_trait]
impl MeteringApi for FakeApi {
    async fn get_service_locations(&self) -> Result<ServiceLocations> {
        self.hit("locations")?;
        Ok(ServiceLocations {
            app_name: Some("mirror".into()),
            service_locations: self.locations.lock().clone(),
        })
    }

    async fn get_metering_configuration(&self, id: LocationId) -> Result<MeteringConfiguration> {
        self.hit("config")?;
        if self.failing_locations.lock().contains(&id) {
            return Err(Error::Api {
                status: 500,
                message: format!("no configuration for {id}"),
            });
        }
        Ok(serde_json::from_value(json!({
            "name": "Home",
            "serviceLocationUuid": UUID,
            "timezone": "Europe/Brussels",
            "appliances": [
                {"id": 1, "name": "Fridge", "type": "Refrigerator", "sourceType": "NILM"},
                {"id": 2, "name": "?", "type": "Find me", "sourceType": "NILM"},
                {"id": 3, "name": "Heater", "type": "Heater", "sourceType": "CT"}
            ],
            "actuators": [{"id": 7, "name": "Plug", "type": "COMFORT_PLUG",
                "states": [{"id": "ON_ON", "name": "on"}, {"id": "OFF_OFF", "name": "off"}]}],
            "sensors": [{"id": 5, "name": "Water", "channels": [{"channel": 1, "ppu": 1000}]}],
            "measurements": [
                {"id": 10, "name": "Grid", "type": "GRID", "channels": [{"powerTopicIndex": 0}]},
                {"id": 11, "name": "Solar", "type": "PRODUCTION", "channels": [{"powerTopicIndex": 1}]}
            ]
        }))?)
    }

    async fn get_service_location_info(&self, id: LocationId) -> Result<ServiceLocationInfo> {
        self.hit("info")?;
        Ok(ServiceLocationInfo {
            service_location_id: id,
            name: Some("Home".into()),
            timezone: None,
            electricity_cost: Some(0.25),
            electricity_currency: Some("EUR".into()),
        })
    }

    async fn get_actuator_state(&self, _: LocationId, _: EntityId) -> Result<String> {
        self.hit("actuator_state")?;
        Ok("\"OFF_OFF\"".into())
    }

    async fn get_actuator_connection_state(&self, _: LocationId, _: EntityId) -> Result<String> {
        self.hit("connection_state")?;
        Ok("CONNECTED".into())
    }

    async fn set_actuator_state(
        &self,
        _: LocationId,
        _: EntityId,
        _: &str,
        _: Option<u32>,
    ) -> Result<()> {
        self.hit("set_state")
    }

    async fn get_consumption(
        &self,
        _: LocationId,
        _: TimeRange,
        _: Aggregation,
    ) -> Result<ConsumptionResult> {
        self.hit("consumption")?;
        Ok(serde_json::from_value(
            json!({"consumptions": [{"consumption": 1000, "solar": 200, "alwaysOn": 60}]}),
        )?)
    }

    async fn get_sensor_consumption(
        &self,
        _: LocationId,
        _: EntityId,
        _: TimeRange,
        _: Aggregation,
    ) -> Result<RecordsResult> {
        self.hit("sensor")?;
        Ok(serde_json::from_value(
            json!({"records": [{"value1": 3000, "temperature": 19.5}]}),
        )?)
    }

    async fn get_switch_consumption(
        &self,
        _: LocationId,
        _: EntityId,
        _: TimeRange,
        _: Aggregation,
    ) -> Result<RecordsResult> {
        self.hit("switch")?;
        Ok(serde_json::from_value(json!({"records": [{"active": 0.42}]}))?)
    }

    async fn get_events(
        &self,
        _: LocationId,
        _: EntityId,
        _: TimeRange,
        _: Option<u32>,
    ) -> Result<Vec<ApplianceEvent>> {
        self.hit("events")?;
        Ok(serde_json::from_value(json!([{"activePower": 120}]))?)
    }
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` with a thread-local subscriber and returns what it logged
pub fn capture_logs(f: impl FnOnce()) -> String {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.0.lock().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
