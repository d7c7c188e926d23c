//! Time-bounded cache guarding REST trend queries

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

use crate::api::{Aggregation, ConsumptionResult, RecordsResult};
use crate::appliance::ApplianceEvent;
use crate::EntityId;

pub const DEFAULT_CAPACITY: usize = 100;

/// Consumption window queried for the location totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trend {
    Today,
    CurrentHour,
    Last5Minutes,
}

impl Trend {
    pub const ALL: [Trend; 3] = [Trend::Today, Trend::CurrentHour, Trend::Last5Minutes];

    pub fn name(self) -> &'static str {
        match self {
            Trend::Today => "today",
            Trend::CurrentHour => "current_hour",
            Trend::Last5Minutes => "last_5_minutes",
        }
    }

    pub fn aggregation(self) -> Aggregation {
        match self {
            Trend::Today => Aggregation::Daily,
            Trend::CurrentHour => Aggregation::Hourly,
            Trend::Last5Minutes => Aggregation::FiveMinutes,
        }
    }

    /// Length of the queried window in minutes
    pub fn window_minutes(self) -> i64 {
        match self {
            Trend::Today => 1440,
            Trend::CurrentHour => 60,
            Trend::Last5Minutes => 9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrendKey {
    TotalConsumption(Trend),
    ActuatorConsumptionToday(EntityId),
    SensorConsumptionToday(EntityId),
    Appliance(EntityId),
}

impl fmt::Display for TrendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendKey::TotalConsumption(trend) => write!(f, "total_consumption_{}", trend.name()),
            TrendKey::ActuatorConsumptionToday(id) => write!(f, "actuator_{id}_consumption_today"),
            TrendKey::SensorConsumptionToday(id) => write!(f, "sensor_{id}_consumption_today"),
            TrendKey::Appliance(id) => write!(f, "appliance_{id}"),
        }
    }
}

/// Last fetched REST result for a trend key
#[derive(Debug, Clone, PartialEq)]
pub enum TrendResult {
    Consumption(ConsumptionResult),
    Records(RecordsResult),
    Events(Vec<ApplianceEvent>),
}

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// Fixed-TTL cache. When full, the oldest entry makes room for a new key.
pub struct TrendCache<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
}

impl<K, V> TrendCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    fn is_live(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.duration_since(entry.inserted) < self.ttl
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = Instant::now();
        let live = match self.entries.get(key) {
            Some(entry) => self.is_live(entry, now),
            None => return None,
        };
        if !live {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.purge_expired(now);
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted: now,
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of unexpired entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .values()
            .filter(|e| self.is_live(e, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.inserted) < ttl);
    }
}
