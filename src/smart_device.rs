use serde_derive::{Deserialize, Serialize};

use crate::channel::{ChannelIndices, ChannelTotal, IndexKey, IndexedValues};
use crate::measurement::{ChannelReading, ChannelSet, Metric};

/// Smart device announcement from the `etc/.../devices` topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartDeviceInfo {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default)]
    pub minimum_current: Option<f64>,
    #[serde(default)]
    pub maximum_current: Option<f64>,
    #[serde(default)]
    pub measurements: Vec<ChannelIndices>,
}

/// Dynamically discovered device such as an EV charger
#[derive(Debug, Clone, PartialEq)]
pub struct SmartDevice {
    pub uuid: String,
    pub name: String,
    pub category: Option<String>,
    pub implementation: Option<String>,
    pub min_current: Option<f64>,
    pub max_current: Option<f64>,
    pub connection_status: Option<String>,
    channels: ChannelSet,
    set_currents: [Option<f64>; 3],
}

impl SmartDevice {
    pub fn new(info: SmartDeviceInfo) -> Self {
        Self {
            channels: ChannelSet::new(&info.measurements),
            uuid: info.uuid,
            name: info.name,
            category: info.category,
            implementation: info.implementation,
            min_current: info.minimum_current,
            max_current: info.maximum_current,
            connection_status: None,
            set_currents: [None; 3],
        }
    }

    /// Records the current set-point of `phase` (1-based). Returns false for an
    /// unknown phase.
    pub fn set_current(&mut self, phase: usize, current: f64) -> bool {
        match phase.checked_sub(1).and_then(|i| self.set_currents.get_mut(i)) {
            Some(slot) => {
                *slot = Some(current);
                true
            }
            None => false,
        }
    }

    pub fn set_currents(&self) -> &[Option<f64>; 3] {
        &self.set_currents
    }

    pub fn readings(&self) -> &[ChannelReading] {
        self.channels.readings()
    }

    pub fn active_total(&self) -> Option<ChannelTotal> {
        self.channels.total(Metric::Active)
    }

    pub fn reactive_total(&self) -> Option<ChannelTotal> {
        self.channels.total(Metric::Reactive)
    }

    pub fn current_total(&self) -> Option<ChannelTotal> {
        self.channels.total(Metric::Current)
    }

    pub fn update<V>(&mut self, metric: Metric, values: &V) -> ChannelTotal
    where
        V: IndexedValues + ?Sized,
    {
        self.channels.update(metric, IndexKey::Publish, values)
    }
}
