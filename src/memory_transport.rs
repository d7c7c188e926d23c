//! In-process broker for running locations without a network

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, Sender};

use crate::telemetry::{
    ConnectOptions, ConnectionKind, TelemetryClient, TelemetryMessage, TelemetrySession,
    TelemetryTransport,
};

/// Records everything published and subscribed through it
#[derive(Default)]
pub struct MemoryClient {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<Vec<String>>,
    disconnected: Mutex<bool>,
}

impl MemoryClient {
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.lock()
    }
}

#[async_trait]
impl TelemetryClient for MemoryClient {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        *self.disconnected.lock() = true;
        Ok(())
    }
}

struct Link {
    options: ConnectOptions,
    client: Arc<MemoryClient>,
    sender: Sender<TelemetryMessage>,
}

#[derive(Default)]
pub struct MemoryTransport {
    links: Mutex<Vec<Link>>,
    refused: Mutex<HashSet<ConnectionKind>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later connect of `kind` fail
    pub fn refuse(&self, kind: ConnectionKind) {
        self.refused.lock().insert(kind);
    }

    pub fn accept(&self, kind: ConnectionKind) {
        self.refused.lock().remove(&kind);
    }

    pub fn connections(&self, kind: ConnectionKind) -> Vec<ConnectOptions> {
        self.links
            .lock()
            .iter()
            .filter(|l| l.options.kind == kind)
            .map(|l| l.options.clone())
            .collect()
    }

    /// Client of the most recent session of `kind`
    pub fn client(&self, kind: ConnectionKind) -> Option<Arc<MemoryClient>> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|l| l.options.kind == kind)
            .map(|l| Arc::clone(&l.client))
    }

    /// Whether the most recent session of `kind` still has a reader
    pub fn is_open(&self, kind: ConnectionKind) -> bool {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|l| l.options.kind == kind)
            .is_some_and(|l| !l.sender.is_closed())
    }

    /// Delivers a message on the most recent session of `kind`. Returns false
    /// when there is no open session.
    pub async fn inject(&self, kind: ConnectionKind, topic: &str, payload: &str) -> bool {
        let sender = self
            .links
            .lock()
            .iter()
            .rev()
            .find(|l| l.options.kind == kind)
            .map(|l| l.sender.clone());
        match sender {
            Some(sender) => sender
                .send(TelemetryMessage::new(topic, payload.as_bytes()))
                .await
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl TelemetryTransport for MemoryTransport {
    async fn connect(&self, options: ConnectOptions) -> anyhow::Result<TelemetrySession> {
        if self.refused.lock().contains(&options.kind) {
            anyhow::bail!("connection to {}:{} refused", options.host, options.port);
        }
        let (sender, messages) = mpsc::channel(64);
        let client = Arc::new(MemoryClient::default());
        self.links.lock().push(Link {
            options,
            client: Arc::clone(&client),
            sender,
        });
        Ok(TelemetrySession { client, messages })
    }
}
