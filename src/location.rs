//! Location aggregate: loads the topology, owns the telemetry connections and
//! refreshes trends through the trend cache.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::actuator::{normalize_state, Actuator, StateValue, STATE_OFF, STATE_ON};
use crate::api::{Aggregation, MeteringApi, MeteringConfiguration, TimeRange};
use crate::appliance::Appliance;
use crate::capabilities::{DeviceCapabilities, DeviceFamily};
use crate::dispatcher::{topic_prefix, Dispatcher};
use crate::error::{Error, Result};
use crate::keepalive::KeepAlive;
use crate::local_api::LocalApi;
use crate::location_state::{
    AggregatedValues, LocationDetails, LocationState, RealtimeValues, Topology,
};
use crate::measurement::Measurement;
use crate::sensor::Sensor;
use crate::settings::Settings;
use crate::telemetry::{
    ConnectOptions, ConnectionKind, ConnectionState, TelemetryConnection, TelemetryTransport,
};
use crate::trend_cache::{Trend, TrendCache, TrendKey, TrendResult};
use crate::{EntityId, LocationId};

/// Id given to a location polled over the local gateway
pub const LOCAL_LOCATION_ID: LocationId = 0;

/// Appliances of this type are placeholders in the vendor app
const FIND_ME: &str = "Find me";

pub enum Backend {
    Cloud(Arc<dyn MeteringApi>),
    /// Polled over the in-network gateway, without telemetry
    Local(Arc<LocalApi>),
}

pub struct ServiceLocation {
    id: LocationId,
    serial_number: Option<String>,
    backend: Backend,
    transport: Option<Arc<dyn TelemetryTransport>>,
    settings: Settings,
    state: Arc<RwLock<LocationState>>,
    cache: Mutex<TrendCache<TrendKey, TrendResult>>,
    connections: Mutex<Vec<TelemetryConnection>>,
    loading: tokio::sync::Mutex<()>,
}

impl ServiceLocation {
    pub fn cloud(
        id: LocationId,
        serial_number: Option<String>,
        api: Arc<dyn MeteringApi>,
        transport: Option<Arc<dyn TelemetryTransport>>,
        settings: Settings,
    ) -> Self {
        Self::with_backend(id, serial_number, Backend::Cloud(api), transport, settings)
    }

    pub fn local(serial_number: impl Into<String>, api: Arc<LocalApi>, settings: Settings) -> Self {
        Self::with_backend(
            LOCAL_LOCATION_ID,
            Some(serial_number.into()),
            Backend::Local(api),
            None,
            settings,
        )
    }

    fn with_backend(
        id: LocationId,
        serial_number: Option<String>,
        backend: Backend,
        transport: Option<Arc<dyn TelemetryTransport>>,
        settings: Settings,
    ) -> Self {
        let state = LocationState::new(id, serial_number.clone());
        Self {
            id,
            serial_number,
            backend,
            transport,
            cache: Mutex::new(TrendCache::new(settings.trend_ttl)),
            settings,
            state: Arc::new(RwLock::new(state)),
            connections: Mutex::new(Vec::new()),
            loading: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> LocationId {
        self.id
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local(_))
    }

    /// Runs `f` against the current state under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&LocationState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn snapshot(&self) -> LocationState {
        self.state.read().clone()
    }

    pub fn details(&self) -> LocationDetails {
        self.state.read().details.clone()
    }

    pub fn realtime(&self) -> RealtimeValues {
        self.state.read().realtime.clone()
    }

    pub fn aggregated(&self) -> AggregatedValues {
        self.state.read().aggregated.clone()
    }

    pub fn actuator(&self, id: EntityId) -> Option<Actuator> {
        self.state.read().actuators.get(&id).cloned()
    }

    pub fn connection_states(&self) -> Vec<(ConnectionKind, ConnectionState)> {
        self.connections
            .lock()
            .iter()
            .map(|c| (c.kind(), c.state()))
            .collect()
    }

    fn cloud_api(&self) -> Option<&dyn MeteringApi> {
        match &self.backend {
            Backend::Cloud(api) => Some(api.as_ref()),
            Backend::Local(_) => None,
        }
    }

    /// Pulls the topology and rebuilds the entity maps. Entities that are still
    /// configured keep their live and fetched values. Non-refresh loads connect
    /// whichever telemetry session is missing.
    pub async fn load_configuration(&self, refresh: bool) -> Result<()> {
        let _loading = self.loading.lock().await;
        match &self.backend {
            Backend::Cloud(api) => {
                let config = api.get_metering_configuration(self.id).await?;
                let uuid = self.install_cloud_configuration(api.as_ref(), config).await?;
                if !refresh {
                    self.connect_telemetry(uuid).await;
                }
                Ok(())
            }
            Backend::Local(api) => self.load_local(api).await,
        }
    }

    async fn install_cloud_configuration(
        &self,
        api: &dyn MeteringApi,
        config: MeteringConfiguration,
    ) -> Result<Option<String>> {
        let capabilities = DeviceCapabilities::from_serial(self.serial_number.as_deref());
        let mut topology = Topology::default();

        for appliance in config.appliances {
            if appliance.kind == FIND_ME || appliance.source_type.as_deref() != Some("NILM") {
                continue;
            }
            topology.appliances.insert(
                appliance.id,
                Appliance::new(appliance.id, appliance.name, appliance.kind, appliance.source_type),
            );
        }

        for entry in config.actuators {
            let mut actuator = Actuator::new(
                entry.id,
                entry.name,
                entry.serial_number,
                &entry.states,
                entry.connection_state,
                entry.kind,
            );
            let state = api.get_actuator_state(self.id, entry.id).await?;
            actuator.set_state(&state, None);
            let connection_state = api
                .get_actuator_connection_state(self.id, entry.id)
                .await?;
            actuator.set_connection_state(&connection_state);
            topology.actuators.insert(entry.id, actuator);
        }

        for sensor in config.sensors {
            topology
                .sensors
                .insert(sensor.id, Sensor::new(sensor.id, sensor.name, sensor.channels));
        }

        let mut has_production = false;
        for m in config.measurements {
            let measurement = Measurement::new(m.id, m.name, m.kind, m.subcircuit_type, m.channels);
            has_production |= measurement.is_production();
            topology.measurements.insert(m.id, measurement);
        }

        let info = match api.get_service_location_info(self.id).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(location_id = self.id, error = %e, "Failed to load service location info");
                None
            }
        };

        let mut state = self.state.write();
        let details = &mut state.details;
        details.name = config.name;
        if config.service_location_uuid.is_some() {
            details.uuid = config.service_location_uuid;
        }
        details.latitude = config.lat;
        details.longitude = config.lon;
        details.timezone = config.timezone;
        details.phase_type = config.phase_type;
        details.capabilities = capabilities;
        details.has_solar_production = capabilities.solar_production || has_production;
        details.has_voltage_values = capabilities.voltage_values;
        details.has_reactive_value = capabilities.reactive_power;
        if let Some(info) = info {
            details.electricity_cost = info.electricity_cost;
            details.electricity_currency = info.electricity_currency;
        }
        let uuid = details.uuid.clone();

        info!(
            location_id = self.id,
            model = capabilities.model_name(),
            appliances = topology.appliances.len(),
            actuators = topology.actuators.len(),
            sensors = topology.sensors.len(),
            measurements = topology.measurements.len(),
            "Loaded metering configuration"
        );
        state.install_topology(topology);
        Ok(uuid)
    }

    async fn load_local(&self, api: &LocalApi) -> Result<()> {
        let capabilities = DeviceCapabilities::from_serial(self.serial_number.as_deref());
        if capabilities.family == DeviceFamily::Genius {
            return Err(Error::Config(
                "local polling is not available for the Genius series".to_string(),
            ));
        }

        api.logon().await;
        let mut topology = Topology::default();
        for entry in api.load_command_control_config().await.unwrap_or_default() {
            let kind = match entry.kind.as_deref() {
                Some("2") => "COMFORT_PLUG",
                Some("3") => "SWITCH",
                _ => continue,
            };
            let Ok(id) = entry.key.trim().parse::<EntityId>() else {
                warn!(key = %entry.key, "Skipping controllable node with a non-numeric key");
                continue;
            };
            let states = [
                StateValue {
                    id: STATE_ON.to_string(),
                    name: Some("on".to_string()),
                    current: entry.relay_status == Some(true),
                },
                StateValue {
                    id: STATE_OFF.to_string(),
                    name: Some("off".to_string()),
                    current: entry.relay_status == Some(false),
                },
            ];
            let connection_state = entry.connection_status.map(|s| s.to_uppercase());
            topology.actuators.insert(
                id,
                Actuator::new(id, entry.value, entry.serial_number, &states, connection_state, kind),
            );
        }

        let mut has_solar = capabilities.solar_production;
        match capabilities.family {
            DeviceFamily::Solar => {
                api.load_config().await;
            }
            DeviceFamily::ProPlus => {
                if let Some(channels) = api.load_channels_config().await {
                    has_solar |= channels.has_grid_production();
                }
            }
            _ => {}
        }

        let mut state = self.state.write();
        state.details.name = Some(format!(
            "Smappee {} local",
            self.serial_number.as_deref().unwrap_or_default()
        ));
        state.details.capabilities = capabilities;
        state.details.has_solar_production = has_solar;
        state.details.has_voltage_values = capabilities.voltage_values;
        info!(
            serial_number = ?self.serial_number,
            actuators = topology.actuators.len(),
            "Loaded local gateway configuration"
        );
        state.install_topology(topology);
        Ok(())
    }

    fn dispatcher(&self, prefix: &str, kind: ConnectionKind) -> Dispatcher {
        Dispatcher::new(
            self.id,
            prefix,
            kind,
            self.settings.discovery,
            Arc::clone(&self.state),
        )
    }

    fn is_connected(&self, kind: ConnectionKind) -> bool {
        self.connections
            .lock()
            .iter()
            .any(|c| c.kind() == kind && c.state() != ConnectionState::Disconnected)
    }

    /// Keeps at most one connection per kind; a closed one is dropped here
    fn add_connection(&self, connection: TelemetryConnection) {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.kind() != connection.kind());
        connections.push(connection);
    }

    /// Central broker always; the device broker as well where the hardware has
    /// one. Only the kinds without a live connection are (re)connected.
    async fn connect_telemetry(&self, uuid: Option<String>) {
        let Some(transport) = &self.transport else {
            return;
        };
        let Some(uuid) = uuid else {
            warn!(location_id = self.id, "No location UUID, running without telemetry");
            return;
        };
        let prefix = topic_prefix(&uuid);

        if !self.is_connected(ConnectionKind::Central) {
            let options = ConnectOptions::central(&self.settings, &uuid);
            let keepalive = KeepAlive::new(
                &self.settings,
                prefix.clone(),
                options.client_id.clone(),
                self.serial_number.clone(),
                self.id,
            );
            let dispatcher = self.dispatcher(&prefix, ConnectionKind::Central);
            match TelemetryConnection::start(transport.as_ref(), options, dispatcher, Some(keepalive))
                .await
            {
                Ok(connection) => self.add_connection(connection),
                Err(e) => warn!(location_id = self.id, error = %e, "Central telemetry unavailable"),
            }
        }

        let local_telemetry = self.state.read().details.capabilities.local_telemetry;
        let Some(serial) = self.serial_number.as_deref().filter(|_| local_telemetry) else {
            return;
        };
        if self.is_connected(ConnectionKind::Local) {
            return;
        }
        let options = ConnectOptions::local(&self.settings, &uuid, serial);
        let dispatcher = self.dispatcher(&prefix, ConnectionKind::Local);
        let connect = TelemetryConnection::start(transport.as_ref(), options, dispatcher, None);
        match timeout(self.settings.local_timeout, connect).await {
            Ok(Ok(connection)) => self.add_connection(connection),
            Ok(Err(e)) => info!(location_id = self.id, error = %e, "Local telemetry unavailable"),
            Err(_) => info!(location_id = self.id, "Local telemetry connect timed out"),
        }
    }

    /// Refreshes the consumption trends, sensor and actuator totals and the
    /// appliance states. Results younger than the trend TTL are not fetched
    /// again; failed fetches are logged and retried on the next call.
    pub async fn update_trends_and_appliance_states(&self) {
        if let Backend::Local(api) = &self.backend {
            self.poll_local_power(api).await;
            return;
        }

        for trend in Trend::ALL {
            if let Err(e) = self.update_active_consumptions(trend).await {
                warn!(location_id = self.id, trend = trend.name(), error = %e, "Failed to update consumption");
            }
        }
        self.update_todays_sensor_consumptions().await;
        self.update_todays_actuator_consumptions().await;

        let appliances: Vec<EntityId> = self.state.read().appliances.keys().copied().collect();
        for id in appliances {
            if let Err(e) = self.update_appliance_state(id).await {
                warn!(location_id = self.id, appliance_id = id, error = %e, "Failed to update appliance state");
            }
        }
    }

    fn is_cached(&self, key: &TrendKey) -> bool {
        self.cache.lock().contains(key)
    }

    pub async fn update_active_consumptions(&self, trend: Trend) -> Result<()> {
        let Some(api) = self.cloud_api() else {
            return Ok(());
        };
        let key = TrendKey::TotalConsumption(trend);
        if self.is_cached(&key) {
            return Ok(());
        }

        let range = TimeRange::last_minutes(trend.window_minutes());
        let result = api
            .get_consumption(self.id, range, trend.aggregation())
            .await?;
        self.state.write().apply_consumption(trend, &result);
        self.cache.lock().insert(key, TrendResult::Consumption(result));
        Ok(())
    }

    pub async fn update_todays_actuator_consumptions(&self) {
        let Some(api) = self.cloud_api() else {
            return;
        };
        let range = TimeRange::last_minutes(Trend::Today.window_minutes());
        let actuators: Vec<EntityId> = self.state.read().actuators.keys().copied().collect();

        for id in actuators {
            let key = TrendKey::ActuatorConsumptionToday(id);
            if self.is_cached(&key) {
                continue;
            }
            match api
                .get_switch_consumption(self.id, id, range, Aggregation::Daily)
                .await
            {
                Ok(result) => {
                    self.state.write().apply_actuator_consumption(id, &result);
                    self.cache.lock().insert(key, TrendResult::Records(result));
                }
                Err(e) => {
                    warn!(location_id = self.id, actuator_id = id, error = %e, "Failed to update actuator consumption")
                }
            }
        }
    }

    pub async fn update_todays_sensor_consumptions(&self) {
        let Some(api) = self.cloud_api() else {
            return;
        };
        let range = TimeRange::last_minutes(Trend::Today.window_minutes());
        let sensors: Vec<EntityId> = self.state.read().sensors.keys().copied().collect();

        for id in sensors {
            let key = TrendKey::SensorConsumptionToday(id);
            if self.is_cached(&key) {
                continue;
            }
            let applied = match api
                .get_sensor_consumption(self.id, id, range, Aggregation::Daily)
                .await
            {
                Ok(result) => self
                    .state
                    .write()
                    .apply_sensor_consumption(id, &result)
                    .map(|_| result),
                Err(e) => Err(e),
            };
            match applied {
                Ok(result) => self.cache.lock().insert(key, TrendResult::Records(result)),
                Err(e) => {
                    warn!(location_id = self.id, sensor_id = id, error = %e, "Failed to update sensor consumption")
                }
            }
        }
    }

    pub async fn update_appliance_state(&self, id: EntityId) -> Result<()> {
        let Some(api) = self.cloud_api() else {
            return Ok(());
        };
        let key = TrendKey::Appliance(id);
        if self.is_cached(&key) {
            return Ok(());
        }

        let range = TimeRange::last_minutes(Trend::Today.window_minutes());
        let events = api.get_events(self.id, id, range, None).await?;
        self.state.write().apply_appliance_events(id, &events);
        self.cache.lock().insert(key, TrendResult::Events(events));
        Ok(())
    }

    async fn poll_local_power(&self, api: &LocalApi) {
        if let Some(total) = api.active_power(false).await {
            self.state.write().realtime.total_power = Some(total);
        }
        let has_solar = self.state.read().details.has_solar_production;
        if has_solar {
            if let Some(solar) = api.active_power(true).await {
                self.state.write().realtime.solar_power = Some(solar);
            }
        }
    }

    /// Switches an actuator. The state must be one of the actuator's options;
    /// on success the local model is updated without waiting for telemetry.
    pub async fn set_actuator_state(
        &self,
        actuator_id: EntityId,
        state: &str,
        duration: Option<u32>,
    ) -> Result<()> {
        let state = normalize_state(state);
        self.validate_actuator_state(actuator_id, &state)?;

        match &self.backend {
            Backend::Cloud(api) => {
                api.set_actuator_state(self.id, actuator_id, &state, duration)
                    .await?
            }
            Backend::Local(api) => {
                if api.set_actuator_state(actuator_id, &state).await.is_none() {
                    warn!(actuator_id, "Local gateway did not confirm the command");
                }
            }
        }

        debug!(location_id = self.id, actuator_id, state = %state, "Actuator state set");
        self.state
            .write()
            .set_actuator_state(actuator_id, &state, None);
        Ok(())
    }

    fn validate_actuator_state(&self, actuator_id: EntityId, state: &str) -> Result<()> {
        let location = self.state.read();
        let actuator = location
            .actuators
            .get(&actuator_id)
            .ok_or(Error::UnknownActuator(actuator_id))?;
        if !actuator.accepts(state) {
            return Err(Error::InvalidState {
                actuator_id,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// Stops every telemetry connection; the model keeps its last values
    pub async fn stop(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in &connections {
            connection.stop().await;
        }
        if !connections.is_empty() {
            info!(location_id = self.id, "Telemetry stopped");
        }
    }
}
