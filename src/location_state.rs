//! Reconciled model of one service location
//!
//! Both the configuration loader and the telemetry dispatchers write into a
//! `LocationState`, always through the location's `RwLock`. Every mutator here
//! is synchronous so the lock is never held across an `.await`.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::actuator::Actuator;
use crate::api::{ConsumptionResult, RecordsResult};
use crate::appliance::{Appliance, ApplianceEvent};
use crate::capabilities::DeviceCapabilities;
use crate::channel::Source;
use crate::error::{Error, Result};
use crate::measurement::{Measurement, Metric};
use crate::payload::{ConfigPayload, PowerPayload, RealtimePayload};
use crate::sensor::Sensor;
use crate::smart_device::{SmartDevice, SmartDeviceInfo};
use crate::trend_cache::Trend;
use crate::{EntityId, LocationId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealtimeValues {
    pub total_power: Option<f64>,
    pub total_reactive_power: Option<f64>,
    pub solar_power: Option<f64>,
    pub always_on: Option<f64>,
    /// Volts
    pub phase_voltages: Option<Vec<f64>>,
    pub phase_voltages_h3: Option<Vec<f64>>,
    pub phase_voltages_h5: Option<Vec<f64>>,
    pub line_voltages: Option<Vec<f64>>,
    pub line_voltages_h3: Option<Vec<f64>>,
    pub line_voltages_h5: Option<Vec<f64>>,
}

/// Consumption figures of one trend window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrendValues {
    pub power: Option<f64>,
    pub solar: Option<f64>,
    pub always_on: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedValues {
    pub today: TrendValues,
    pub current_hour: TrendValues,
    pub last_5_minutes: TrendValues,
}

impl AggregatedValues {
    pub fn get(&self, trend: Trend) -> &TrendValues {
        match trend {
            Trend::Today => &self.today,
            Trend::CurrentHour => &self.current_hour,
            Trend::Last5Minutes => &self.last_5_minutes,
        }
    }

    fn get_mut(&mut self, trend: Trend) -> &mut TrendValues {
        match trend {
            Trend::Today => &mut self.today,
            Trend::CurrentHour => &mut self.current_hour,
            Trend::Last5Minutes => &mut self.last_5_minutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationDetails {
    pub id: LocationId,
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub serial_number: Option<String>,
    pub capabilities: DeviceCapabilities,
    pub phase_type: Option<String>,
    pub has_solar_production: bool,
    pub has_voltage_values: bool,
    pub has_reactive_value: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    pub firmware_version: Option<String>,
    pub presence: Option<bool>,
    pub electricity_cost: Option<f64>,
    pub electricity_currency: Option<String>,
}

impl LocationDetails {
    pub fn new(id: LocationId, serial_number: Option<String>) -> Self {
        let capabilities = DeviceCapabilities::from_serial(serial_number.as_deref());
        Self {
            id,
            uuid: None,
            name: None,
            serial_number,
            capabilities,
            phase_type: None,
            has_solar_production: capabilities.solar_production,
            has_voltage_values: capabilities.voltage_values,
            has_reactive_value: false,
            latitude: None,
            longitude: None,
            timezone: None,
            firmware_version: None,
            presence: None,
            electricity_cost: None,
            electricity_currency: None,
        }
    }

    pub fn model_name(&self) -> &'static str {
        self.capabilities.model_name()
    }
}

/// Entities built by one configuration load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub appliances: BTreeMap<EntityId, Appliance>,
    pub actuators: BTreeMap<EntityId, Actuator>,
    pub sensors: BTreeMap<EntityId, Sensor>,
    pub measurements: BTreeMap<EntityId, Measurement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationState {
    pub details: LocationDetails,
    pub appliances: BTreeMap<EntityId, Appliance>,
    pub actuators: BTreeMap<EntityId, Actuator>,
    pub sensors: BTreeMap<EntityId, Sensor>,
    pub measurements: BTreeMap<EntityId, Measurement>,
    pub smart_devices: BTreeMap<String, SmartDevice>,
    pub realtime: RealtimeValues,
    pub aggregated: AggregatedValues,
}

impl LocationState {
    pub fn new(id: LocationId, serial_number: Option<String>) -> Self {
        Self {
            details: LocationDetails::new(id, serial_number),
            appliances: BTreeMap::new(),
            actuators: BTreeMap::new(),
            sensors: BTreeMap::new(),
            measurements: BTreeMap::new(),
            smart_devices: BTreeMap::new(),
            realtime: RealtimeValues::default(),
            aggregated: AggregatedValues::default(),
        }
    }

    /// Swaps in freshly loaded entities. Entities that were already known keep
    /// their live values; smart devices and realtime values come from
    /// telemetry and survive a reload untouched.
    pub fn install_topology(&mut self, topology: Topology) {
        merge(&mut self.appliances, topology.appliances, Appliance::carry_over);
        merge(&mut self.actuators, topology.actuators, Actuator::carry_over);
        merge(&mut self.sensors, topology.sensors, Sensor::carry_over);
        merge(&mut self.measurements, topology.measurements, Measurement::carry_over);
    }

    pub fn apply_power(&mut self, power: &PowerPayload) {
        self.realtime.total_power = power.consumption_power;
        self.realtime.solar_power = power.solar_power;
        self.realtime.always_on = power.always_on;

        if let Some(voltages) = &power.phase_voltage_data {
            self.realtime.phase_voltages = Some(tenths(voltages));
            self.realtime.phase_voltages_h3 = power.phase_voltage_h3_data.clone();
            self.realtime.phase_voltages_h5 = power.phase_voltage_h5_data.clone();
        }
        if let Some(voltages) = &power.line_voltage_data {
            self.realtime.line_voltages = Some(tenths(voltages));
            self.realtime.line_voltages_h3 = power.line_voltage_h3_data.clone();
            self.realtime.line_voltages_h5 = power.line_voltage_h5_data.clone();
        }

        if let Some(active) = &power.active_power_data {
            for measurement in self.measurements.values_mut() {
                measurement.update_active(active, Source::Central);
            }
        }
        if let Some(reactive) = &power.reactive_power_data {
            for measurement in self.measurements.values_mut() {
                measurement.update_reactive(reactive, Source::Central);
            }
        }
        if let Some(current) = &power.current_data {
            for measurement in self.measurements.values_mut() {
                measurement.update_current(current, Source::Central);
            }
        }
    }

    pub fn apply_realtime(&mut self, realtime: &RealtimePayload) {
        self.realtime.total_power = realtime.total_power;
        self.realtime.total_reactive_power = realtime.total_reactive_power;
        if let Some(voltages) = &realtime.voltages {
            self.realtime.phase_voltages =
                Some(voltages.iter().map(|v| v.voltage.unwrap_or(0.0)).collect());
        }

        let mut active = HashMap::with_capacity(realtime.channel_powers.len());
        let mut current = HashMap::with_capacity(realtime.channel_powers.len());
        for channel in &realtime.channel_powers {
            active.insert(channel.publish_index, channel.power);
            current.insert(channel.publish_index, channel.current / 10.0);
        }

        for measurement in self.measurements.values_mut() {
            measurement.update_active(&active, Source::Local);
            measurement.update_current(&current, Source::Local);
        }
        for device in self.smart_devices.values_mut() {
            device.update(Metric::Active, &active);
            device.update(Metric::Current, &current);
        }
    }

    pub fn apply_config(&mut self, config: &ConfigPayload) {
        if let Some(id) = config.service_location_id {
            if id != self.details.id {
                warn!(
                    location_id = self.details.id,
                    reported_id = id,
                    "Device reports a different service location"
                );
            }
        }
        if let Some(firmware) = &config.firmware_version {
            self.details.firmware_version = Some(firmware.clone());
        }
        if let Some(uuid) = &config.service_location_uuid {
            self.details.uuid = Some(uuid.clone());
        }
    }

    pub fn set_presence(&mut self, presence: Option<bool>) {
        self.details.presence = presence;
    }

    /// Stores a reported actuator state. Returns false for an unknown actuator.
    pub fn set_actuator_state(&mut self, id: EntityId, state: &str, since: Option<i64>) -> bool {
        match self.actuators.get_mut(&id) {
            Some(actuator) => {
                actuator.set_state(state, since);
                true
            }
            None => false,
        }
    }

    pub fn set_actuator_connection_state(&mut self, id: EntityId, connection_state: &str) -> bool {
        match self.actuators.get_mut(&id) {
            Some(actuator) => {
                actuator.set_connection_state(connection_state);
                true
            }
            None => false,
        }
    }

    /// Registers announced smart devices, replacing earlier announcements
    pub fn add_smart_devices(&mut self, devices: Vec<SmartDeviceInfo>) {
        for info in devices {
            debug!(uuid = %info.uuid, name = %info.name, "Smart device announced");
            self.smart_devices
                .insert(info.uuid.clone(), SmartDevice::new(info));
        }
    }

    pub fn set_smart_device_current(&mut self, uuid: &str, phase: usize, current: f64) -> bool {
        self.smart_devices
            .get_mut(uuid)
            .map(|device| device.set_current(phase, current))
            .unwrap_or(false)
    }

    pub fn set_smart_device_connection(&mut self, uuid: &str, status: &str) -> bool {
        match self.smart_devices.get_mut(uuid) {
            Some(device) => {
                device.connection_status = Some(status.to_string());
                true
            }
            None => false,
        }
    }

    /// Uses the first consumption block; an empty result leaves the trend untouched
    pub fn apply_consumption(&mut self, trend: Trend, result: &ConsumptionResult) {
        if let Some(block) = result.consumptions.first() {
            *self.aggregated.get_mut(trend) = TrendValues {
                power: block.consumption,
                solar: block.solar,
                always_on: block.always_on,
            };
        }
    }

    pub fn apply_actuator_consumption(&mut self, id: EntityId, result: &RecordsResult) {
        let Some(record) = result.records.first() else {
            return;
        };
        if let Some(actuator) = self.actuators.get_mut(&id) {
            actuator.consumption_today = record.get("active").and_then(|v| v.as_f64());
        }
    }

    pub fn apply_sensor_consumption(&mut self, id: EntityId, result: &RecordsResult) -> Result<()> {
        let Some(record) = result.records.first() else {
            return Ok(());
        };
        match self.sensors.get_mut(&id) {
            Some(sensor) => sensor.apply_record(record),
            None => Err(Error::MissingField(format!("sensor {id}"))),
        }
    }

    /// Derives the appliance state from its most recent event
    pub fn apply_appliance_events(&mut self, id: EntityId, events: &[ApplianceEvent]) {
        if let (Some(event), Some(appliance)) = (events.first(), self.appliances.get_mut(&id)) {
            appliance.apply_event(event);
        }
    }
}

/// Replaces `current` with `loaded`, carrying over the values of ids present in both
fn merge<T>(
    current: &mut BTreeMap<EntityId, T>,
    mut loaded: BTreeMap<EntityId, T>,
    carry_over: impl Fn(&mut T, &T),
) {
    for (id, entity) in loaded.iter_mut() {
        if let Some(previous) = current.get(id) {
            carry_over(entity, previous);
        }
    }
    *current = loaded;
}

fn tenths(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| v / 10.0).collect()
}
