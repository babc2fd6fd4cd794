//! Service registry: where servers advertise nodes and clients find them.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// A reachable instance of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One version of a named service and the nodes serving it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Dot-qualified endpoints exposed by the service.
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("service not found")]
    NotFound,
    #[error("invalid service: {0}")]
    Invalid(String),
    #[error("watcher stopped")]
    WatcherStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

/// A registration change.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub action: EventAction,
    pub service: Service,
}

/// Stream of registry changes.
pub struct Watcher {
    rx: broadcast::Receiver<RegistryEvent>,
    service: Option<String>,
}

impl Watcher {
    /// Next change, skipping events for other services when filtered.
    pub async fn next(&mut self) -> Result<RegistryEvent, RegistryError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(name) = &self.service {
                        if &event.service.name != name {
                            continue;
                        }
                    }
                    return Ok(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "registry watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(RegistryError::WatcherStopped)
                }
            }
        }
    }
}

#[async_trait]
pub trait Registry: Send + Sync + 'static {
    async fn register(&self, service: &Service) -> Result<(), RegistryError>;
    async fn deregister(&self, service: &Service) -> Result<(), RegistryError>;
    /// Every registered version of `name`; `NotFound` when there are none.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError>;
    async fn list_services(&self) -> Result<Vec<Service>, RegistryError>;
    /// Watches all services, or only `service` when given.
    async fn watch(&self, service: Option<&str>) -> Result<Watcher, RegistryError>;
}

const WATCH_CAPACITY: usize = 64;

/// In-process registry keyed by service name, then version.
pub struct MemoryRegistry {
    services: DashMap<String, HashMap<String, Service>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            services: DashMap::new(),
            events,
        }
    }

    fn notify(&self, action: EventAction, service: Service) {
        // No watchers is fine.
        let _ = self.events.send(RegistryEvent { action, service });
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, service: &Service) -> Result<(), RegistryError> {
        if service.name.is_empty() {
            return Err(RegistryError::Invalid("service name is empty".into()));
        }
        let (action, snapshot) = {
            let mut versions = self.services.entry(service.name.clone()).or_default();
            match versions.get_mut(&service.version) {
                Some(existing) => {
                    for node in &service.nodes {
                        existing.nodes.retain(|n| n.id != node.id);
                        existing.nodes.push(node.clone());
                    }
                    existing.metadata = service.metadata.clone();
                    existing.endpoints = service.endpoints.clone();
                    (EventAction::Update, existing.clone())
                }
                None => {
                    versions.insert(service.version.clone(), service.clone());
                    (EventAction::Create, service.clone())
                }
            }
        };
        debug!(service = service.name.as_str(), version = service.version.as_str(), "registered");
        self.notify(action, snapshot);
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        let removed = {
            let Some(mut versions) = self.services.get_mut(&service.name) else {
                return Ok(());
            };
            let mut removed = None;
            if let Some(existing) = versions.get_mut(&service.version) {
                existing
                    .nodes
                    .retain(|n| !service.nodes.iter().any(|gone| gone.id == n.id));
                if existing.nodes.is_empty() {
                    removed = versions.remove(&service.version);
                }
            }
            removed
        };
        self.services.remove_if(&service.name, |_, versions| versions.is_empty());
        debug!(service = service.name.as_str(), version = service.version.as_str(), "deregistered");
        let event = match removed {
            Some(gone) => (EventAction::Delete, gone),
            None => (EventAction::Update, service.clone()),
        };
        self.notify(event.0, event.1);
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>, RegistryError> {
        let versions = self.services.get(name).ok_or(RegistryError::NotFound)?;
        let list: Vec<Service> = versions.values().cloned().collect();
        if list.is_empty() {
            return Err(RegistryError::NotFound);
        }
        Ok(list)
    }

    async fn list_services(&self) -> Result<Vec<Service>, RegistryError> {
        Ok(self
            .services
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect())
    }

    async fn watch(&self, service: Option<&str>) -> Result<Watcher, RegistryError> {
        Ok(Watcher {
            rx: self.events.subscribe(),
            service: service.map(str::to_string),
        })
    }
}
