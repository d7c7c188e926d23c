//! Telemetry dispatcher
//!
//! Classifies each inbound topic relative to the location prefix
//! (`servicelocation/{uuid}`) and routes the payload to the matching
//! `LocationState` mutator. A payload that fails to parse is logged and
//! dropped; it never ends the receive loop.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::location_state::LocationState;
use crate::payload::{
    ActuatorCommand, ConfigPayload, ControlMessage, PlugValuePayload, PowerPayload,
    PresencePayload, RealtimePayload, SetCurrentPayload, SmartDeviceStatePayload,
    MESSAGE_TYPE_ACTUATOR_COMMAND,
};
use crate::smart_device::SmartDeviceInfo;
use crate::telemetry::{ConnectionKind, TelemetryMessage};
use crate::{EntityId, LocationId};

/// Suffixes that are known but carry nothing the model tracks
const IGNORED_SUFFIXES: [&str; 15] = [
    "powerquality",
    "tracking",
    "homeassistant/heartbeat",
    "sensorConfig",
    "homeControlConfig",
    "aggregated",
    "trigger",
    "trigger/appliance",
    "triggerpush",
    "triggervalue",
    "h1vector",
    "nilm",
    "homeassistant/event",
    "homeassistant/trigger/etc",
    "scheduler",
];

pub fn topic_prefix(location_uuid: &str) -> String {
    format!("servicelocation/{location_uuid}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Power,
    Realtime,
    Config,
    Presence,
    /// Message on the bare prefix, dispatched further by message type
    Control,
    SmartDevices,
    SetCurrent { device_uuid: &'a str },
    SmartDeviceState,
    PlugState { actuator_id: EntityId },
    PlugConnectionState { actuator_id: EntityId },
    Ignored,
    Unmatched,
}

/// Exact suffixes first, then path families, then the bare prefix
pub fn classify<'a>(prefix: &str, topic: &'a str) -> Route<'a> {
    let Some(rest) = topic.strip_prefix(prefix) else {
        return Route::Unmatched;
    };
    if rest.is_empty() {
        return Route::Control;
    }
    let Some(suffix) = rest.strip_prefix('/') else {
        return Route::Unmatched;
    };

    match suffix {
        "power" => return Route::Power,
        "realtime" => return Route::Realtime,
        "config" => return Route::Config,
        "presence" => return Route::Presence,
        s if IGNORED_SUFFIXES.contains(&s) => return Route::Ignored,
        _ => {}
    }

    if let Some(etc) = suffix.strip_prefix("etc/") {
        return classify_etc(etc);
    }
    if suffix.starts_with("outputmodule/") {
        return Route::Ignored;
    }
    if let Some(plug) = suffix.strip_prefix("plug/") {
        return classify_plug(plug);
    }
    Route::Unmatched
}

fn classify_etc(etc: &str) -> Route<'_> {
    if etc == "measuredvalues" {
        return Route::Ignored;
    }
    if let Some(device_uuid) = etc.strip_suffix("/action/setcurrent") {
        if !device_uuid.is_empty() && !device_uuid.contains('/') {
            return Route::SetCurrent { device_uuid };
        }
    }
    if etc == "devices" || etc.ends_with("/devices") {
        return Route::SmartDevices;
    }
    if etc == "state" || etc.ends_with("/state") {
        return Route::SmartDeviceState;
    }
    Route::Ignored
}

fn classify_plug(plug: &str) -> Route<'static> {
    let mut parts = plug.splitn(2, '/');
    let (Some(id), Some(kind)) = (parts.next(), parts.next()) else {
        return Route::Unmatched;
    };
    let Ok(actuator_id) = id.parse::<EntityId>() else {
        return Route::Unmatched;
    };
    match kind {
        "state" => Route::PlugState { actuator_id },
        "connectionState" => Route::PlugConnectionState { actuator_id },
        _ => Route::Ignored,
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Routes the messages of one broker session into a location's state
#[derive(Clone)]
pub struct Dispatcher {
    location_id: LocationId,
    prefix: String,
    kind: ConnectionKind,
    discovery: bool,
    state: Arc<RwLock<LocationState>>,
}

impl Dispatcher {
    pub fn new(
        location_id: LocationId,
        prefix: impl Into<String>,
        kind: ConnectionKind,
        discovery: bool,
        state: Arc<RwLock<LocationState>>,
    ) -> Self {
        Self {
            location_id,
            prefix: prefix.into(),
            kind,
            discovery,
            state,
        }
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    /// Topic filter to subscribe to. The device broker is subscribed as a whole.
    pub fn subscription(&self) -> String {
        match self.kind {
            ConnectionKind::Central => format!("{}/#", self.prefix),
            ConnectionKind::Local => "#".to_string(),
        }
    }

    pub fn dispatch(&self, message: &TelemetryMessage) {
        let route = classify(&self.prefix, &message.topic);
        if route == Route::Unmatched {
            if self.discovery {
                info!(
                    location_id = self.location_id,
                    topic = %message.topic,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "Unhandled telemetry topic"
                );
            }
            return;
        }
        if let Err(e) = self.apply(route, &message.payload) {
            warn!(
                location_id = self.location_id,
                topic = %message.topic,
                error = %e,
                "Dropping malformed telemetry message"
            );
        }
    }

    fn apply(&self, route: Route<'_>, payload: &[u8]) -> Result<()> {
        match route {
            Route::Power => {
                let power: PowerPayload = parse(payload)?;
                self.state.write().apply_power(&power);
            }
            Route::Realtime => {
                let realtime: RealtimePayload = parse(payload)?;
                self.state.write().apply_realtime(&realtime);
            }
            Route::Config => {
                let config: ConfigPayload = parse(payload)?;
                self.state.write().apply_config(&config);
            }
            Route::Presence => {
                let presence: PresencePayload = parse(payload)?;
                self.state.write().set_presence(presence.value);
            }
            Route::Control => self.apply_control(parse(payload)?)?,
            Route::SmartDevices => {
                let devices: Vec<SmartDeviceInfo> = parse(payload)?;
                self.state.write().add_smart_devices(devices);
            }
            Route::SetCurrent { device_uuid } => {
                let set: SetCurrentPayload = parse(payload)?;
                if !self
                    .state
                    .write()
                    .set_smart_device_current(device_uuid, set.phase, set.value)
                {
                    debug!(device_uuid, phase = set.phase, "Set-current for unknown device or phase");
                }
            }
            Route::SmartDeviceState => {
                let status: SmartDeviceStatePayload = parse(payload)?;
                self.state
                    .write()
                    .set_smart_device_connection(&status.device_uuid, &status.connection_status);
            }
            Route::PlugState { actuator_id } => {
                // the device broker echoes commands before they take effect
                if self.kind != ConnectionKind::Central {
                    return Ok(());
                }
                let plug: PlugValuePayload = parse(payload)?;
                if !self
                    .state
                    .write()
                    .set_actuator_state(actuator_id, &plug.value, plug.since)
                {
                    debug!(actuator_id, "State for unknown actuator");
                }
            }
            Route::PlugConnectionState { actuator_id } => {
                let plug: PlugValuePayload = parse(payload)?;
                if !self
                    .state
                    .write()
                    .set_actuator_connection_state(actuator_id, &plug.value)
                {
                    debug!(actuator_id, "Connection state for unknown actuator");
                }
            }
            Route::Ignored | Route::Unmatched => {}
        }
        Ok(())
    }

    fn apply_control(&self, message: ControlMessage) -> Result<()> {
        if message.message_type != Some(MESSAGE_TYPE_ACTUATOR_COMMAND) {
            return Ok(());
        }
        let command: ActuatorCommand = serde_json::from_value(message.content)?;
        let since = command.since_seconds();
        if !self
            .state
            .write()
            .set_actuator_state(command.controllable_node_id, &command.action, Some(since))
        {
            debug!(actuator_id = command.controllable_node_id, "Command echo for unknown actuator");
        }
        Ok(())
    }
}
