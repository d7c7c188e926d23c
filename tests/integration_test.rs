use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::oneshot, time::sleep};

use smappee_mirror::{
    memory_transport::MemoryTransport, telemetry::ConnectionKind, CloudApi, Error, Settings,
    Smappee, StaticToken,
};

const LOCATION_ID: i64 = 1001;
const UUID: &str = "uuid-1001";
const TOKEN: &str = "test-token";

/// Mock of the cloud REST API that counts requests per endpoint
#[derive(Default)]
struct MockCloud {
    locations: Mutex<Vec<Value>>,
    service_locations_calls: AtomicU32,
    configuration_calls: AtomicU32,
    consumption_calls: AtomicU32,
    sensor_calls: AtomicU32,
    switch_calls: AtomicU32,
    event_calls: AtomicU32,
    info_calls: AtomicU32,
    unauthorized_calls: AtomicU32,
    commands: Mutex<Vec<(String, Value)>>,
}

impl MockCloud {
    fn with_location(serial: &str) -> Self {
        let cloud = Self::default();
        cloud.set_locations(vec![json!({
            "serviceLocationId": LOCATION_ID,
            "serviceLocationUuid": UUID,
            "name": "Home",
            "deviceSerialNumber": serial,
        })]);
        cloud
    }

    fn set_locations(&self, locations: Vec<Value>) {
        *self.locations.lock().unwrap() = locations;
    }

    fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::Relaxed)
    }

    fn commands(&self) -> Vec<(String, Value)> {
        self.commands.lock().unwrap().clone()
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        let expected = format!("Bearer {TOKEN}");
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some(value) if value == expected => Ok(()),
            _ => {
                self.unauthorized_calls.fetch_add(1, Ordering::Relaxed);
                Err(StatusCode::UNAUTHORIZED)
            }
        }
    }

    fn create_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/servicelocation", get(service_locations))
            .route("/servicelocation/:id/meteringconfiguration", get(metering_configuration))
            .route("/servicelocation/:id/info", get(info))
            .route("/servicelocation/:id/consumption", get(consumption))
            .route("/servicelocation/:id/sensor/:sensor/consumption", get(sensor_consumption))
            .route("/servicelocation/:id/switch/:switch/consumption", get(switch_consumption))
            .route("/servicelocation/:id/events", get(events))
            .route(
                "/servicelocation/:id/actuator/:actuator/:action",
                get(actuator_query).post(actuator_command),
            )
            .with_state(self)
    }
}

type Shared = State<Arc<MockCloud>>;

async fn service_locations(State(cloud): Shared, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    cloud.authorize(&headers)?;
    cloud.service_locations_calls.fetch_add(1, Ordering::Relaxed);
    let locations = cloud.locations.lock().unwrap().clone();
    Ok(Json(json!({"appName": "mirror", "serviceLocations": locations})))
}

async fn metering_configuration(State(cloud): Shared, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    cloud.authorize(&headers)?;
    cloud.configuration_calls.fetch_add(1, Ordering::Relaxed);
    Ok(Json(json!({
        "name": "Home",
        "serviceLocationUuid": UUID,
        "timezone": "Europe/Brussels",
        "appliances": [
            {"id": 1, "name": "Fridge", "type": "Refrigerator", "sourceType": "NILM"},
            {"id": 2, "name": "Unknown", "type": "Find me", "sourceType": "NILM"}
        ],
        "actuators": [{"id": 7, "name": "Coffee", "type": "COMFORT_PLUG", "serialNumber": "P7",
            "states": [{"id": "ON_ON", "name": "on"}, {"id": "OFF_OFF", "name": "off"}]}],
        "sensors": [{"id": 5, "name": "Gas", "channels": [{"channel": 1, "ppu": 100, "uom": "m3"}]}],
        "measurements": [
            {"id": 10, "name": "Grid", "type": "GRID",
             "channels": [{"powerTopicIndex": 0, "consumptionIndex": 0}, {"powerTopicIndex": 1, "consumptionIndex": 1}]}
        ]
    })))
}

async fn info(State(cloud): Shared, Path(id): Path<i64>) -> Json<Value> {
    cloud.info_calls.fetch_add(1, Ordering::Relaxed);
    Json(json!({"serviceLocationId": id, "electricityCost": 0.3, "electricityCurrency": "EUR"}))
}

async fn consumption(State(cloud): Shared) -> Json<Value> {
    cloud.consumption_calls.fetch_add(1, Ordering::Relaxed);
    Json(json!({"consumptions": [{"timestamp": 1700000000000i64, "consumption": 2400, "solar": 0, "alwaysOn": 120}]}))
}

async fn sensor_consumption(State(cloud): Shared) -> Json<Value> {
    cloud.sensor_calls.fetch_add(1, Ordering::Relaxed);
    Json(json!({"records": [{"value1": 250, "temperature": 20.5, "battery": 90}]}))
}

async fn switch_consumption(State(cloud): Shared) -> Json<Value> {
    cloud.switch_calls.fetch_add(1, Ordering::Relaxed);
    Json(json!({"records": [{"active": 1.2}]}))
}

async fn events(State(cloud): Shared) -> Json<Value> {
    cloud.event_calls.fetch_add(1, Ordering::Relaxed);
    Json(json!([{"activePower": 85.0, "timestamp": 1700000000000i64}]))
}

async fn actuator_query(Path((_, _, action)): Path<(i64, i64, String)>) -> Result<String, StatusCode> {
    match action.as_str() {
        "state" => Ok("\"OFF_OFF\"".to_string()),
        "connectionstate" => Ok("\"CONNECTED\"".to_string()),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

async fn actuator_command(
    State(cloud): Shared,
    Path((_, _, state)): Path<(i64, i64, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    cloud.commands.lock().unwrap().push((state, body));
    StatusCode::OK
}

/// Start the mock cloud on a random port
async fn start_mock_cloud(cloud: Arc<MockCloud>) -> (SocketAddr, oneshot::Sender<()>) {
    let app = cloud.create_router();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let server = axum::serve(listener, app);
        tokio::select! {
            _ = server => {},
            _ = shutdown_rx => {
                println!("Mock cloud shutting down");
            }
        }
    });

    (addr, shutdown_tx)
}

fn test_settings() -> Settings {
    Settings {
        trend_ttl: Duration::from_millis(300),
        tracking_toggle_delay: Duration::from_millis(50),
        ..Settings::default()
    }
}

fn smappee(addr: SocketAddr, transport: &Arc<MemoryTransport>, token: &str) -> Arc<Smappee> {
    let api = CloudApi::new(
        format!("http://{addr}/servicelocation"),
        Arc::new(StaticToken::new(token)),
    );
    Arc::new(Smappee::new(
        Arc::new(api),
        Some(transport.clone()),
        test_settings(),
    ))
}

/// Polls `check` until it holds or two seconds have passed
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_cold_start_builds_model_and_connects() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let cloud = Arc::new(MockCloud::with_location("5010000001"));
    let (addr, _shutdown) = start_mock_cloud(cloud.clone()).await;
    let transport = Arc::new(MemoryTransport::new());
    let smappee = smappee(addr, &transport, TOKEN);

    smappee.load_service_locations(false).await.unwrap();

    let location = smappee.service_location(LOCATION_ID).unwrap();
    let state = location.snapshot();
    assert_eq!(state.details.uuid.as_deref(), Some(UUID));
    assert_eq!(state.details.model_name(), "Smappee Genius");
    assert_eq!(state.details.electricity_currency.as_deref(), Some("EUR"));
    assert_eq!(state.appliances.len(), 1);
    assert_eq!(state.actuators[&7].state(), Some("OFF_OFF"));
    assert_eq!(state.actuators[&7].connection_state.as_deref(), Some("CONNECTED"));

    // cold start runs one trend pass
    assert_eq!(MockCloud::count(&cloud.consumption_calls), 3);
    assert_eq!(MockCloud::count(&cloud.sensor_calls), 1);
    assert_eq!(MockCloud::count(&cloud.switch_calls), 1);
    assert_eq!(MockCloud::count(&cloud.event_calls), 1);
    assert_eq!(MockCloud::count(&cloud.info_calls), 1);
    assert_eq!(state.aggregated.today.power, Some(2400.0));
    assert_eq!(state.sensors[&5].channels()[0].value_today, 2.5);
    assert_eq!(state.actuators[&7].consumption_today, Some(1.2));
    assert!(state.appliances[&1].state);

    let central = transport.connections(ConnectionKind::Central);
    assert_eq!(central.len(), 1);
    assert_eq!(central[0].credentials.as_ref().unwrap().username, UUID);
    let local = transport.connections(ConnectionKind::Local);
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].host, "smappee5010000001.local");

    smappee.stop().await;
}

#[tokio::test]
async fn test_telemetry_updates_model() {
    let cloud = Arc::new(MockCloud::with_location("5010000001"));
    let (addr, _shutdown) = start_mock_cloud(cloud.clone()).await;
    let transport = Arc::new(MemoryTransport::new());
    let smappee = smappee(addr, &transport, TOKEN);
    smappee.load_service_locations(false).await.unwrap();
    let location = smappee.service_location(LOCATION_ID).unwrap();
    let topic = |suffix: &str| format!("servicelocation/{UUID}{suffix}");

    assert!(
        transport
            .inject(ConnectionKind::Central, &topic("/plug/7/state"), r#"{"value": "ON_ON", "since": 1700000000}"#)
            .await
    );
    assert!(wait_until(|| location.actuator(7).map_or(false, |a| a.is_on())).await);
    assert_eq!(location.actuator(7).unwrap().state_since(), Some(1700000000));

    transport
        .inject(ConnectionKind::Central, &topic("/plug/7/connectionState"), r#"{"value": "DISCONNECTED"}"#)
        .await;
    assert!(
        wait_until(|| location.actuator(7).unwrap().connection_state.as_deref() == Some("DISCONNECTED"))
            .await
    );
    assert_eq!(location.actuator(7).unwrap().state(), Some("ON_ON"));

    // a broken payload must not stall the stream
    transport
        .inject(ConnectionKind::Central, &topic("/power"), "not json")
        .await;
    transport
        .inject(
            ConnectionKind::Central,
            &topic("/power"),
            r#"{"consumptionPower": 1500, "solarPower": 0, "alwaysOn": 110, "activePowerData": [900, 600], "phaseVoltageData": [2301, 2299, 2310]}"#,
        )
        .await;
    assert!(wait_until(|| location.realtime().total_power == Some(1500.0)).await);
    let realtime = location.realtime();
    assert_eq!(realtime.phase_voltages, Some(vec![230.1, 229.9, 231.0]));
    let grid_total = location.read(|s| s.measurements[&10].active_total());
    assert_eq!(grid_total.map(|t| t.total), Some(1500.0));

    transport
        .inject(
            ConnectionKind::Local,
            &topic("/realtime"),
            r#"{"totalPower": 1480, "totalReactivePower": 95, "channelPowers": [{"publishIndex": 0, "power": 880, "current": 38}]}"#,
        )
        .await;
    assert!(wait_until(|| location.realtime().total_reactive_power == Some(95.0)).await);

    smappee.stop().await;
}

#[tokio::test]
async fn test_trend_refresh_is_cached_until_expiry() {
    let cloud = Arc::new(MockCloud::with_location("1010000001"));
    let (addr, _shutdown) = start_mock_cloud(cloud.clone()).await;
    let transport = Arc::new(MemoryTransport::new());
    let smappee = smappee(addr, &transport, TOKEN);
    smappee.load_service_locations(false).await.unwrap();
    assert_eq!(MockCloud::count(&cloud.consumption_calls), 3);

    smappee.update_trends_and_appliance_states().await;
    smappee.update_trends_and_appliance_states().await;
    assert_eq!(MockCloud::count(&cloud.consumption_calls), 3);
    assert_eq!(MockCloud::count(&cloud.event_calls), 1);

    sleep(Duration::from_millis(400)).await;
    smappee.update_trends_and_appliance_states().await;
    assert_eq!(MockCloud::count(&cloud.consumption_calls), 6);
    assert_eq!(MockCloud::count(&cloud.switch_calls), 2);
    assert_eq!(MockCloud::count(&cloud.event_calls), 2);

    smappee.stop().await;
}

#[tokio::test]
async fn test_actuator_commands() {
    let cloud = Arc::new(MockCloud::with_location("1010000001"));
    let (addr, _shutdown) = start_mock_cloud(cloud.clone()).await;
    let transport = Arc::new(MemoryTransport::new());
    let smappee = smappee(addr, &transport, TOKEN);
    smappee.load_service_locations(false).await.unwrap();
    let location = smappee.service_location(LOCATION_ID).unwrap();

    assert!(matches!(
        location.set_actuator_state(7, "DIMMED", None).await,
        Err(Error::InvalidState { actuator_id: 7, .. })
    ));
    assert!(matches!(
        location.set_actuator_state(8, "ON_ON", None).await,
        Err(Error::UnknownActuator(8))
    ));
    assert!(cloud.commands().is_empty());

    location.set_actuator_state(7, "ON", Some(30)).await.unwrap();
    assert_eq!(
        cloud.commands(),
        vec![("ON_ON".to_string(), json!({"duration": 30}))]
    );
    assert!(location.actuator(7).unwrap().is_on());

    smappee.stop().await;
}

#[tokio::test]
async fn test_keepalive_publishes_on_central_session() {
    let cloud = Arc::new(MockCloud::with_location("1010000001"));
    let (addr, _shutdown) = start_mock_cloud(cloud.clone()).await;
    let transport = Arc::new(MemoryTransport::new());
    let smappee = smappee(addr, &transport, TOKEN);
    smappee.load_service_locations(false).await.unwrap();

    let central = transport.client(ConnectionKind::Central).unwrap();
    let tracking = format!("servicelocation/{UUID}/tracking");
    let heartbeat = format!("servicelocation/{UUID}/homeassistant/heartbeat");
    assert!(
        wait_until(|| {
            let published = central.published();
            published.iter().filter(|(t, _)| *t == tracking).count() == 2
                && published.iter().any(|(t, _)| *t == heartbeat)
        })
        .await
    );

    let published = central.published();
    let values: Vec<Value> = published
        .iter()
        .filter(|(t, _)| *t == tracking)
        .map(|(_, p)| serde_json::from_slice::<Value>(p).unwrap()["value"].clone())
        .collect();
    assert_eq!(values, vec![json!("OFF"), json!("ON")]);
    let beat = published.iter().find(|(t, _)| *t == heartbeat).unwrap();
    assert_eq!(
        serde_json::from_slice::<Value>(&beat.1).unwrap(),
        json!({"serviceLocationId": LOCATION_ID})
    );

    smappee.stop().await;
    assert!(central.is_disconnected());
}

#[tokio::test]
async fn test_removed_location_is_stopped() {
    let cloud = Arc::new(MockCloud::with_location("1010000001"));
    let (addr, _shutdown) = start_mock_cloud(cloud.clone()).await;
    let transport = Arc::new(MemoryTransport::new());
    let smappee = smappee(addr, &transport, TOKEN);
    smappee.load_service_locations(false).await.unwrap();
    let central = transport.client(ConnectionKind::Central).unwrap();

    cloud.set_locations(Vec::new());
    smappee.load_service_locations(true).await.unwrap();

    assert!(smappee.service_locations().is_empty());
    assert!(central.is_disconnected());
    assert_eq!(MockCloud::count(&cloud.service_locations_calls), 2);
    assert_eq!(MockCloud::count(&cloud.configuration_calls), 1);
}

#[tokio::test]
async fn test_rejected_token_fails_load() {
    let cloud = Arc::new(MockCloud::with_location("1010000001"));
    let (addr, _shutdown) = start_mock_cloud(cloud.clone()).await;
    let transport = Arc::new(MemoryTransport::new());
    let smappee = smappee(addr, &transport, "expired");

    let result = smappee.load_service_locations(false).await;

    assert!(matches!(result, Err(Error::Unauthorized)));
    // one refresh-and-retry, then give up
    assert_eq!(MockCloud::count(&cloud.unauthorized_calls), 2);
    assert!(smappee.service_locations().is_empty());
}
