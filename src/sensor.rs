use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::EntityId;

/// Pulse counter channel of a gas/water sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorChannel {
    pub channel: u32,
    /// Pulses per unit
    pub ppu: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uom: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(skip)]
    pub value_today: f64,
}

impl SensorChannel {
    fn record_key(&self) -> String {
        format!("value{}", self.channel)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    pub id: EntityId,
    pub name: String,
    channels: Vec<SensorChannel>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
}

impl Sensor {
    pub fn new(id: EntityId, name: impl Into<String>, mut channels: Vec<SensorChannel>) -> Self {
        for channel in &mut channels {
            channel.value_today = 0.0;
        }
        Self {
            id,
            name: name.into(),
            channels,
            temperature: None,
            humidity: None,
            battery: None,
        }
    }

    pub fn channels(&self) -> &[SensorChannel] {
        &self.channels
    }

    /// Scales each channel's raw `value{channel}` counter by its unit-per-pulse.
    /// A record missing any expected counter is rejected as a whole.
    pub fn update_today_values(&mut self, record: &Map<String, Value>) -> Result<()> {
        let mut scaled = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let key = channel.record_key();
            let raw = record
                .get(&key)
                .and_then(Value::as_f64)
                .ok_or_else(|| Error::MissingField(key.clone()))?;
            if channel.ppu == 0.0 {
                return Err(Error::Config(format!(
                    "sensor {} channel {} has a zero unit-per-pulse",
                    self.id, channel.channel
                )));
            }
            scaled.push(raw / channel.ppu);
        }

        for (channel, value) in self.channels.iter_mut().zip(scaled) {
            channel.value_today = value;
        }
        Ok(())
    }

    /// Applies a daily consumption record including the optional climate readings
    pub fn apply_record(&mut self, record: &Map<String, Value>) -> Result<()> {
        self.update_today_values(record)?;
        if let Some(temperature) = record.get("temperature").and_then(Value::as_f64) {
            self.temperature = Some(temperature);
        }
        if let Some(humidity) = record.get("humidity").and_then(Value::as_f64) {
            self.humidity = Some(humidity);
        }
        if let Some(battery) = record.get("battery").and_then(Value::as_f64) {
            self.battery = Some(battery);
        }
        Ok(())
    }

    /// Keeps today's values and climate readings from an earlier load
    pub fn carry_over(&mut self, previous: &Sensor) {
        for channel in &mut self.channels {
            if let Some(old) = previous.channels.iter().find(|c| c.channel == channel.channel) {
                channel.value_today = old.value_today;
            }
        }
        self.temperature = self.temperature.or(previous.temperature);
        self.humidity = self.humidity.or(previous.humidity);
        self.battery = self.battery.or(previous.battery);
    }
}
