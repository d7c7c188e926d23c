//! All service locations of an account, kept in step with the cloud

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::MeteringApi;
use crate::error::Result;
use crate::location::ServiceLocation;
use crate::settings::Settings;
use crate::telemetry::TelemetryTransport;
use crate::LocationId;

pub struct Smappee {
    api: Arc<dyn MeteringApi>,
    transport: Option<Arc<dyn TelemetryTransport>>,
    settings: Settings,
    locations: RwLock<BTreeMap<LocationId, Arc<ServiceLocation>>>,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl Smappee {
    /// Without a transport the locations are kept up to date by polling only
    pub fn new(
        api: Arc<dyn MeteringApi>,
        transport: Option<Arc<dyn TelemetryTransport>>,
        settings: Settings,
    ) -> Self {
        Self {
            api,
            transport,
            settings,
            locations: RwLock::new(BTreeMap::new()),
            refresh: Mutex::new(None),
        }
    }

    pub fn service_locations(&self) -> Vec<Arc<ServiceLocation>> {
        self.locations.read().values().cloned().collect()
    }

    pub fn service_location(&self, id: LocationId) -> Option<Arc<ServiceLocation>> {
        self.locations.read().get(&id).cloned()
    }

    /// Syncs the set of locations with the account. New locations are loaded
    /// and connected, known ones reloaded when `refresh` is set, and vanished
    /// ones stopped and dropped. Locations without a monitor are skipped.
    ///
    /// Only a failure to list the account's locations is returned. A location
    /// that fails to load is logged and left out until the next sync.
    pub async fn load_service_locations(&self, refresh: bool) -> Result<()> {
        let summaries = self.api.get_service_locations().await?.service_locations;

        let active: BTreeSet<LocationId> = summaries
            .iter()
            .filter(|s| s.device_serial_number.is_some())
            .map(|s| s.service_location_id)
            .collect();
        let removed: Vec<Arc<ServiceLocation>> = {
            let mut locations = self.locations.write();
            let gone: Vec<LocationId> = locations
                .keys()
                .filter(|id| !active.contains(id))
                .copied()
                .collect();
            gone.iter().filter_map(|id| locations.remove(id)).collect()
        };
        for location in removed {
            info!(location_id = location.id(), "Service location removed from account");
            location.stop().await;
        }

        for summary in summaries {
            let id = summary.service_location_id;
            let Some(serial_number) = summary.device_serial_number else {
                debug!(location_id = id, "Skipping service location without a monitor");
                continue;
            };

            let known = self.service_location(id);
            if let Some(location) = known {
                if refresh {
                    if let Err(e) = location.load_configuration(true).await {
                        warn!(location_id = id, error = %e, "Failed to reload service location");
                    }
                }
                continue;
            }

            let location = Arc::new(ServiceLocation::cloud(
                id,
                Some(serial_number),
                Arc::clone(&self.api),
                self.transport.clone(),
                self.settings.clone(),
            ));
            if let Err(e) = location.load_configuration(false).await {
                warn!(location_id = id, error = %e, "Failed to load service location");
                location.stop().await;
                continue;
            }
            location.update_trends_and_appliance_states().await;
            info!(location_id = id, name = ?summary.name, "Service location added");
            self.locations.write().insert(id, location);
        }
        Ok(())
    }

    pub async fn update_trends_and_appliance_states(&self) {
        for location in self.service_locations() {
            location.update_trends_and_appliance_states().await;
        }
    }

    /// Re-syncs the account and refreshes trends every `period`, starting one
    /// period from now. Replaces a loop started earlier. The loop ends with
    /// `stop` or once the registry is dropped.
    pub fn spawn_refresh_loop(self: &Arc<Self>, period: Duration) {
        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(Self::refresh_loop(registry, period));
        if let Some(previous) = self.refresh.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn refresh_loop(registry: Weak<Self>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            if let Err(e) = registry.load_service_locations(true).await {
                warn!(error = %e, "Failed to refresh service locations");
            }
            registry.update_trends_and_appliance_states().await;
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.refresh.lock().take() {
            handle.abort();
        }
        let locations: Vec<Arc<ServiceLocation>> = {
            let mut locations = self.locations.write();
            std::mem::take(&mut *locations).into_values().collect()
        };
        for location in locations {
            location.stop().await;
        }
    }
}

impl Drop for Smappee {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh.get_mut().take() {
            handle.abort();
        }
    }
}
