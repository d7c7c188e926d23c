use serde_derive::{Deserialize, Serialize};

use crate::channel::{
    ChannelIndices, ChannelRegistry, ChannelTotal, IndexKey, IndexedValues, Source,
};
use crate::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Active,
    Reactive,
    Current,
}

/// Live values of one channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelReading {
    pub active: Option<f64>,
    pub reactive: Option<f64>,
    pub current: Option<f64>,
}

impl ChannelReading {
    fn slot(&mut self, metric: Metric) -> &mut Option<f64> {
        match metric {
            Metric::Active => &mut self.active,
            Metric::Reactive => &mut self.reactive,
            Metric::Current => &mut self.current,
        }
    }
}

/// Fixed channel list plus the live readings and totals derived from it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSet {
    registry: ChannelRegistry,
    readings: Vec<ChannelReading>,
    active_total: Option<ChannelTotal>,
    reactive_total: Option<ChannelTotal>,
    current_total: Option<ChannelTotal>,
}

impl ChannelSet {
    pub fn new<'a>(channels: impl IntoIterator<Item = &'a ChannelIndices>) -> Self {
        let registry = ChannelRegistry::new(channels);
        Self {
            readings: vec![ChannelReading::default(); registry.len()],
            registry,
            ..Default::default()
        }
    }

    pub fn readings(&self) -> &[ChannelReading] {
        &self.readings
    }

    pub fn total(&self, metric: Metric) -> Option<ChannelTotal> {
        match metric {
            Metric::Active => self.active_total,
            Metric::Reactive => self.reactive_total,
            Metric::Current => self.current_total,
        }
    }

    /// Writes the channels present in `values`. Absent channels keep their
    /// previous reading and are left out of the returned total.
    pub fn update<V>(&mut self, metric: Metric, key: IndexKey, values: &V) -> ChannelTotal
    where
        V: IndexedValues + ?Sized,
    {
        let present = self.registry.collect(key, values);
        let mut total = ChannelTotal::default();
        for (position, value) in present {
            *self.readings[position].slot(metric) = Some(value);
            total.total += value;
            total.included += 1;
        }

        match metric {
            Metric::Active => self.active_total = Some(total),
            Metric::Reactive => self.reactive_total = Some(total),
            Metric::Current => self.current_total = Some(total),
        }
        total
    }
}

/// Channel description as delivered by the metering configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementChannel {
    #[serde(flatten)]
    pub indices: ChannelIndices,
    #[serde(default)]
    pub name: Option<String>,
}

/// A named group of CT channels for one circuit
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub id: EntityId,
    pub name: String,
    pub kind: String,
    pub subcircuit_type: Option<String>,
    channels: Vec<MeasurementChannel>,
    live: ChannelSet,
}

impl Measurement {
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        kind: impl Into<String>,
        subcircuit_type: Option<String>,
        channels: Vec<MeasurementChannel>,
    ) -> Self {
        let live = ChannelSet::new(channels.iter().map(|c| &c.indices));
        Self {
            id,
            name: name.into(),
            kind: kind.into(),
            subcircuit_type,
            channels,
            live,
        }
    }

    pub fn channels(&self) -> &[MeasurementChannel] {
        &self.channels
    }

    pub fn readings(&self) -> &[ChannelReading] {
        self.live.readings()
    }

    pub fn active_total(&self) -> Option<ChannelTotal> {
        self.live.total(Metric::Active)
    }

    pub fn reactive_total(&self) -> Option<ChannelTotal> {
        self.live.total(Metric::Reactive)
    }

    pub fn current_total(&self) -> Option<ChannelTotal> {
        self.live.total(Metric::Current)
    }

    pub fn is_production(&self) -> bool {
        self.kind == "PRODUCTION"
    }

    /// Takes over the live readings of the same measurement from an earlier
    /// load. Readings are dropped when the channel layout changed.
    pub fn carry_over(&mut self, previous: &Measurement) {
        if self.channels == previous.channels {
            self.live = previous.live.clone();
        }
    }

    pub fn update_active<V>(&mut self, values: &V, source: Source) -> ChannelTotal
    where
        V: IndexedValues + ?Sized,
    {
        self.live.update(Metric::Active, source.index_key(), values)
    }

    pub fn update_reactive<V>(&mut self, values: &V, source: Source) -> ChannelTotal
    where
        V: IndexedValues + ?Sized,
    {
        self.live.update(Metric::Reactive, source.index_key(), values)
    }

    pub fn update_current<V>(&mut self, values: &V, source: Source) -> ChannelTotal
    where
        V: IndexedValues + ?Sized,
    {
        self.live.update(Metric::Current, source.index_key(), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn channel(power_topic: usize, consumption: Option<usize>) -> MeasurementChannel {
        MeasurementChannel {
            indices: ChannelIndices {
                power_topic_index: Some(power_topic),
                consumption_index: consumption,
                publish_index: None,
            },
            ..Default::default()
        }
    }

    fn three_phase_grid() -> Measurement {
        Measurement::new(
            1,
            "Grid",
            "GRID",
            None,
            vec![channel(0, Some(0)), channel(1, Some(1)), channel(2, None)],
        )
    }

    #[test]
    fn test_update_active_full_payload() {
        let mut grid = three_phase_grid();
        let total = grid.update_active(&vec![100.0, 200.0, 300.0], Source::Central);

        assert_eq!(total, ChannelTotal { total: 600.0, included: 3 });
        assert_eq!(grid.active_total(), Some(total));
        assert_eq!(grid.readings()[2].active, Some(300.0));
        assert_eq!(grid.readings()[2].reactive, None);
    }

    #[test]
    fn test_reapplying_same_payload_is_idempotent() {
        let mut grid = three_phase_grid();
        let values = vec![10.5, 20.25, 30.0];
        let first = grid.update_active(&values, Source::Central);
        let second = grid.update_active(&values, Source::Central);

        assert_eq!(first, second);
        assert_eq!(grid.active_total(), Some(first));
    }

    #[test]
    fn test_short_payload_shrinks_total_and_keeps_previous_reading() {
        let mut grid = three_phase_grid();
        grid.update_active(&vec![100.0, 200.0, 300.0], Source::Central);

        let total = grid.update_active(&vec![110.0, 210.0], Source::Central);

        assert_eq!(total, ChannelTotal { total: 320.0, included: 2 });
        assert!(total.is_partial(grid.channels().len()));
        // channel 2 was not in the payload, it keeps its last known value
        assert_eq!(grid.readings()[2].active, Some(300.0));
    }

    #[test]
    fn test_local_source_uses_consumption_index() {
        let mut grid = three_phase_grid();
        let mut values = HashMap::new();
        values.insert(0, 1.5);
        values.insert(1, 2.5);
        values.insert(2, 99.0);

        let total = grid.update_current(&values, Source::Local);

        // the third channel has no consumption index and never contributes
        assert_eq!(total, ChannelTotal { total: 4.0, included: 2 });
        assert_eq!(grid.readings()[2].current, None);
    }

    #[test]
    fn test_metrics_are_tracked_independently() {
        let mut grid = three_phase_grid();
        grid.update_active(&vec![1.0, 2.0, 3.0], Source::Central);
        grid.update_reactive(&vec![0.5], Source::Central);

        assert_eq!(grid.active_total().map(|t| t.total), Some(6.0));
        assert_eq!(
            grid.reactive_total(),
            Some(ChannelTotal { total: 0.5, included: 1 })
        );
        assert_eq!(grid.current_total(), None);
    }

    #[test]
    fn test_channel_deserializes_from_configuration() {
        let parsed: MeasurementChannel = serde_json::from_str(
            r#"{"powerTopicIndex": 2, "consumptionIndex": 5, "name": "L1", "ctInput": 3}"#,
        )
        .unwrap();
        assert_eq!(parsed.indices.power_topic_index, Some(2));
        assert_eq!(parsed.indices.consumption_index, Some(5));
        assert_eq!(parsed.name.as_deref(), Some("L1"));
    }
}
