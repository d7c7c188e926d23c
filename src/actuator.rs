use serde_derive::{Deserialize, Serialize};

use crate::EntityId;

pub const STATE_ON: &str = "ON_ON";
pub const STATE_OFF: &str = "OFF_OFF";

/// One selectable actuator state from the metering configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateValue {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub current: bool,
}

impl StateValue {
    pub fn on_off(is_on: bool) -> Vec<StateValue> {
        vec![
            StateValue {
                id: STATE_ON.to_string(),
                name: Some("on".to_string()),
                current: is_on,
            },
            StateValue {
                id: STATE_OFF.to_string(),
                name: Some("off".to_string()),
                current: !is_on,
            },
        ]
    }
}

/// Expands the two-letter codes retained by older firmware
pub fn normalize_state(state: &str) -> String {
    let state = state.trim().trim_matches('"');
    match state {
        "ON" | "OFF" => format!("{state}_{state}"),
        other => other.to_string(),
    }
}

/// Controllable switch, plug or output module
#[derive(Debug, Clone, PartialEq)]
pub struct Actuator {
    pub id: EntityId,
    pub name: String,
    pub serial_number: Option<String>,
    pub kind: String,
    state_options: Vec<String>,
    state: Option<String>,
    state_since: Option<i64>,
    pub connection_state: Option<String>,
    pub consumption_today: Option<f64>,
}

impl Actuator {
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        serial_number: Option<String>,
        state_values: &[StateValue],
        connection_state: Option<String>,
        kind: impl Into<String>,
    ) -> Self {
        let state_options = state_values.iter().map(|s| s.id.clone()).collect();
        let state = state_values
            .iter()
            .rev()
            .find(|s| s.current)
            .map(|s| s.id.clone());
        Self {
            id,
            name: name.into(),
            serial_number,
            kind: kind.into(),
            state_options,
            state,
            state_since: None,
            connection_state,
            consumption_today: None,
        }
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    /// Seconds since epoch of the last state change, when telemetry reported it
    pub fn state_since(&self) -> Option<i64> {
        self.state_since
    }

    pub fn state_options(&self) -> &[String] {
        &self.state_options
    }

    pub fn accepts(&self, state: &str) -> bool {
        let state = normalize_state(state);
        self.state_options.iter().any(|o| *o == state)
    }

    /// Stores a reported state. Device reports are authoritative, so values
    /// outside `state_options` are kept as reported.
    pub fn set_state(&mut self, state: &str, since: Option<i64>) {
        self.state = Some(normalize_state(state));
        if since.is_some() {
            self.state_since = since;
        }
    }

    pub fn set_connection_state(&mut self, connection_state: &str) {
        self.connection_state = Some(connection_state.trim().trim_matches('"').to_string());
    }

    pub fn is_on(&self) -> bool {
        self.state() == Some(STATE_ON)
    }

    /// Fills what a reload did not report from the same actuator's earlier
    /// values. A freshly reported state wins.
    pub fn carry_over(&mut self, previous: &Actuator) {
        if self.state.is_none() {
            self.state = previous.state.clone();
        }
        if self.state == previous.state {
            self.state_since = self.state_since.or(previous.state_since);
        }
        if self.connection_state.is_none() {
            self.connection_state = previous.connection_state.clone();
        }
        self.consumption_today = self.consumption_today.or(previous.consumption_today);
    }
}
