//! Channel registry
//!
//! Hardware generations and firmware revisions publish per-channel values under
//! different index keys: the cloud `power` topic uses `powerTopicIndex`, the
//! local `realtime` topic uses `consumptionIndex`, smart devices use
//! `publishIndex`. The registry resolves one logical channel list against any
//! of those keys so entity models never have to care which one they got.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

/// Which telemetry connection produced a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Source {
    #[default]
    Central,
    Local,
}

impl Source {
    pub fn index_key(self) -> IndexKey {
        match self {
            Source::Central => IndexKey::PowerTopic,
            Source::Local => IndexKey::Consumption,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKey {
    PowerTopic,
    Consumption,
    Publish,
}

impl IndexKey {
    const ALL: [IndexKey; 3] = [IndexKey::PowerTopic, IndexKey::Consumption, IndexKey::Publish];

    fn slot(self) -> usize {
        match self {
            IndexKey::PowerTopic => 0,
            IndexKey::Consumption => 1,
            IndexKey::Publish => 2,
        }
    }
}

/// Indices at which one channel appears in each payload kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelIndices {
    #[serde(default)]
    pub power_topic_index: Option<usize>,
    #[serde(default)]
    pub consumption_index: Option<usize>,
    #[serde(default)]
    pub publish_index: Option<usize>,
}

impl ChannelIndices {
    pub fn get(&self, key: IndexKey) -> Option<usize> {
        match key {
            IndexKey::PowerTopic => self.power_topic_index,
            IndexKey::Consumption => self.consumption_index,
            IndexKey::Publish => self.publish_index,
        }
    }
}

/// A payload of per-channel values addressable by numeric index
pub trait IndexedValues {
    fn value_at(&self, index: usize) -> Option<f64>;
}

impl IndexedValues for [f64] {
    fn value_at(&self, index: usize) -> Option<f64> {
        self.get(index).copied()
    }
}

impl IndexedValues for Vec<f64> {
    fn value_at(&self, index: usize) -> Option<f64> {
        self.as_slice().value_at(index)
    }
}

impl IndexedValues for HashMap<usize, f64> {
    fn value_at(&self, index: usize) -> Option<f64> {
        self.get(&index).copied()
    }
}

/// Position of a channel in its owner's list, paired with its payload index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedChannel {
    pub position: usize,
    pub index: usize,
}

/// Sum over the channels a payload actually carried
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelTotal {
    pub total: f64,
    /// Number of channels that contributed to `total`
    pub included: usize,
}

impl ChannelTotal {
    /// True when fewer channels than configured contributed
    pub fn is_partial(&self, configured: usize) -> bool {
        self.included < configured
    }
}

/// Resolved lookup table for a fixed channel list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelRegistry {
    len: usize,
    resolved: [Vec<ResolvedChannel>; 3],
}

impl ChannelRegistry {
    pub fn new<'a>(channels: impl IntoIterator<Item = &'a ChannelIndices>) -> Self {
        let channels: Vec<&ChannelIndices> = channels.into_iter().collect();
        let mut resolved: [Vec<ResolvedChannel>; 3] = Default::default();
        for key in IndexKey::ALL {
            resolved[key.slot()] = channels
                .iter()
                .enumerate()
                .filter_map(|(position, c)| {
                    c.get(key).map(|index| ResolvedChannel { position, index })
                })
                .collect();
        }
        Self {
            len: channels.len(),
            resolved,
        }
    }

    /// Number of configured channels, resolvable or not
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Channels that carry an index for `key`; the rest are silently excluded
    pub fn resolve(&self, key: IndexKey) -> &[ResolvedChannel] {
        &self.resolved[key.slot()]
    }

    /// Picks the values present in `values` as `(position, value)` pairs
    pub fn collect<V>(&self, key: IndexKey, values: &V) -> Vec<(usize, f64)>
    where
        V: IndexedValues + ?Sized,
    {
        self.resolve(key)
            .iter()
            .filter_map(|c| values.value_at(c.index).map(|v| (c.position, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(power_topic: Option<usize>, consumption: Option<usize>) -> ChannelIndices {
        ChannelIndices {
            power_topic_index: power_topic,
            consumption_index: consumption,
            publish_index: None,
        }
    }

    #[test]
    fn test_resolve_by_source() {
        let channels = vec![indices(Some(0), Some(3)), indices(Some(1), None)];
        let registry = ChannelRegistry::new(&channels);

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.resolve(Source::Central.index_key()),
            &[
                ResolvedChannel { position: 0, index: 0 },
                ResolvedChannel { position: 1, index: 1 }
            ]
        );
        assert_eq!(
            registry.resolve(Source::Local.index_key()),
            &[ResolvedChannel { position: 0, index: 3 }]
        );
        assert!(registry.resolve(IndexKey::Publish).is_empty());
    }

    #[test]
    fn test_collect_skips_absent_values() {
        let channels = vec![indices(Some(0), None), indices(Some(5), None), indices(None, None)];
        let registry = ChannelRegistry::new(&channels);

        let values = vec![100.0, 200.0];
        assert_eq!(registry.collect(IndexKey::PowerTopic, &values), vec![(0, 100.0)]);

        let mut mapped = HashMap::new();
        mapped.insert(5, 42.0);
        assert_eq!(registry.collect(IndexKey::PowerTopic, &mapped), vec![(1, 42.0)]);
    }

    #[test]
    fn test_channel_indices_deserialize_with_missing_keys() {
        let parsed: ChannelIndices = serde_json::from_str(r#"{"consumptionIndex": 4}"#).unwrap();
        assert_eq!(parsed, indices(None, Some(4)));
    }

    #[test]
    fn test_partial_total() {
        let total = ChannelTotal { total: 10.0, included: 2 };
        assert!(total.is_partial(3));
        assert!(!total.is_partial(2));
    }
}
