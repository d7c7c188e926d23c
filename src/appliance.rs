use serde_derive::Deserialize;

use crate::EntityId;

/// Appliance event as returned by the events endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceEvent {
    pub active_power: f64,
    /// Only program appliances report a state
    #[serde(default)]
    pub state: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A NILM-detected appliance
#[derive(Debug, Clone, PartialEq)]
pub struct Appliance {
    pub id: EntityId,
    pub name: String,
    pub kind: String,
    pub source_type: Option<String>,
    pub state: bool,
    pub power: Option<f64>,
}

impl Appliance {
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        kind: impl Into<String>,
        source_type: Option<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind: kind.into(),
            source_type,
            state: false,
            power: None,
        }
    }

    /// Program appliances switch on a positive `state`, delta appliances on
    /// positive active power. Power is stored as a magnitude.
    pub fn apply_event(&mut self, event: &ApplianceEvent) {
        self.power = Some(event.active_power.abs());
        self.state = match event.state {
            Some(state) => state > 0.0,
            None => event.active_power > 0.0,
        };
    }

    pub fn carry_over(&mut self, previous: &Appliance) {
        self.state = previous.state;
        self.power = previous.power;
    }
}
