//! Publish/subscribe transport seam and the per-connection receive task

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::keepalive::KeepAlive;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl TelemetryMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// The cloud broker or the broker running on the device itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Central,
    Local,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Central => "central",
            ConnectionKind::Local => "local",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub kind: ConnectionKind,
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub credentials: Option<Credentials>,
}

impl ConnectOptions {
    /// Farm broker over TLS, authenticated with the location UUID
    pub fn central(settings: &Settings, location_uuid: &str) -> Self {
        Self {
            kind: ConnectionKind::Central,
            client_id: client_id(location_uuid, ConnectionKind::Central),
            host: settings.endpoints.mqtt_host.clone(),
            port: settings.endpoints.mqtt_port,
            tls: true,
            credentials: Some(Credentials {
                username: location_uuid.to_string(),
                password: location_uuid.to_string(),
            }),
        }
    }

    /// Broker on the device, reachable only from the same network
    pub fn local(settings: &Settings, location_uuid: &str, serial_number: &str) -> Self {
        Self {
            kind: ConnectionKind::Local,
            client_id: client_id(location_uuid, ConnectionKind::Local),
            host: format!("smappee{serial_number}.local"),
            port: settings.local_mqtt_port,
            tls: false,
            credentials: None,
        }
    }
}

fn client_id(location_uuid: &str, kind: ConnectionKind) -> String {
    format!("smappee-mirror-{location_uuid}-{kind}-{}", Uuid::new_v4())
}

/// Outbound half of an established broker session
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;
}

pub struct TelemetrySession {
    pub client: Arc<dyn TelemetryClient>,
    /// Inbound messages; the sender side closes when the broker session ends
    pub messages: Receiver<TelemetryMessage>,
}

#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> anyhow::Result<TelemetrySession>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Subscribed,
}

/// A live broker session feeding one dispatcher
pub struct TelemetryConnection {
    kind: ConnectionKind,
    client: Arc<dyn TelemetryClient>,
    state: Arc<RwLock<ConnectionState>>,
    receiver: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl TelemetryConnection {
    /// Connects, subscribes to the dispatcher's topic filter and spawns the
    /// receive loop. The keep-alive task starts only once subscribed.
    pub async fn start(
        transport: &dyn TelemetryTransport,
        options: ConnectOptions,
        dispatcher: Dispatcher,
        keepalive: Option<KeepAlive>,
    ) -> Result<Self> {
        let kind = options.kind;
        let TelemetrySession { client, messages } = transport.connect(options).await?;
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        let subscription = dispatcher.subscription();
        client.subscribe(&subscription).await?;
        *state.write() = ConnectionState::Subscribed;
        info!(location_id = dispatcher.location_id(), %kind, topic = %subscription, "Subscribed to telemetry");

        let receiver = Self::spawn_receiver(messages, dispatcher, Arc::clone(&state));
        let keepalive = keepalive.map(|k| k.spawn(Arc::clone(&client)));

        Ok(Self {
            kind,
            client,
            state,
            receiver,
            keepalive,
        })
    }

    fn spawn_receiver(
        mut messages: Receiver<TelemetryMessage>,
        dispatcher: Dispatcher,
        state: Arc<RwLock<ConnectionState>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                dispatcher.dispatch(&message);
            }
            *state.write() = ConnectionState::Disconnected;
            info!(location_id = dispatcher.location_id(), "Telemetry stream closed");
        })
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Halts the receive loop without draining queued messages
    pub async fn stop(&self) {
        self.receiver.abort();
        if let Some(keepalive) = &self.keepalive {
            keepalive.abort();
        }
        if let Err(e) = self.client.disconnect().await {
            warn!(kind = %self.kind, error = %e, "Failed to disconnect telemetry client");
        }
        *self.state.write() = ConnectionState::Disconnected;
    }
}

impl Drop for TelemetryConnection {
    fn drop(&mut self) {
        self.receiver.abort();
        if let Some(keepalive) = &self.keepalive {
            keepalive.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location_state::LocationState;
    use crate::memory_transport::MemoryTransport;
    use std::time::Duration;

    #[test]
    fn test_central_options() {
        let settings = Settings::default();
        let options = ConnectOptions::central(&settings, "abc");

        assert_eq!(options.host, "52.51.163.167");
        assert_eq!(options.port, 80);
        assert!(options.tls);
        assert_eq!(
            options.credentials,
            Some(Credentials {
                username: "abc".into(),
                password: "abc".into()
            })
        );
        assert!(options.client_id.starts_with("smappee-mirror-abc-central-"));
    }

    #[test]
    fn test_local_options() {
        let settings = Settings::default();
        let options = ConnectOptions::local(&settings, "abc", "5010000001");

        assert_eq!(options.host, "smappee5010000001.local");
        assert_eq!(options.port, 1883);
        assert!(!options.tls);
        assert!(options.credentials.is_none());

        let other = ConnectOptions::local(&settings, "abc", "5010000001");
        assert_ne!(options.client_id, other.client_id);
    }

    #[tokio::test]
    async fn test_dropped_connection_stops_receiving() {
        let transport = MemoryTransport::new();
        let state = Arc::new(RwLock::new(LocationState::new(1, None)));
        let dispatcher = Dispatcher::new(1, "servicelocation/abc", ConnectionKind::Central, false, state);
        let options = ConnectOptions::central(&Settings::default(), "abc");

        let connection = TelemetryConnection::start(&transport, options, dispatcher, None)
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Subscribed);
        assert!(transport.is_open(ConnectionKind::Central));

        drop(connection);
        let closed = tokio::time::timeout(Duration::from_secs(1), async {
            while transport.is_open(ConnectionKind::Central) {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(!transport.inject(ConnectionKind::Central, "servicelocation/abc/power", "{}").await);
    }
}
