//! Smappee Mirror Library
//!
//! Keeps an in-memory model of Smappee service locations in sync by combining
//! the polled REST API (topology, trends, appliance events) with the pushed
//! MQTT telemetry stream (realtime power, actuator states, smart devices).

pub mod actuator;
pub mod api;
pub mod appliance;
pub mod capabilities;
pub mod channel;
pub mod cloud_api;
pub mod dispatcher;
pub mod error;
pub mod keepalive;
pub mod local_api;
pub mod location;
pub mod location_state;
pub mod measurement;
pub mod memory_transport;
pub mod payload;
pub mod registry;
pub mod sensor;
pub mod settings;
pub mod smart_device;
pub mod telemetry;
pub mod trend_cache;

#[cfg(test)]
mod test_support;

/// Identifier of an appliance, actuator, sensor or measurement
pub type EntityId = i64;
/// Identifier of a service location
pub type LocationId = i64;

// Re-export commonly used types for easier access
pub use api::{MeteringApi, StaticToken, TokenSource};
pub use capabilities::DeviceCapabilities;
pub use channel::{ChannelTotal, Source};
pub use cloud_api::CloudApi;
pub use error::{Error, Result};
pub use local_api::LocalApi;
pub use location::ServiceLocation;
pub use location_state::LocationState;
pub use registry::Smappee;
pub use settings::Settings;
pub use telemetry::{TelemetryClient, TelemetryTransport};
