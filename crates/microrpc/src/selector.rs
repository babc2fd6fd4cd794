//! Node selection: turns a service name into a `Next` function yielding nodes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::error::RpcError;
use crate::registry::{Node, Registry, RegistryError, Service};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("service not found")]
    NotFound,
    #[error("no nodes available")]
    NoneAvailable,
    #[error("registry error: {0}")]
    Registry(String),
}

/// Yields the node for the next attempt.
pub type Next = Arc<dyn Fn() -> Result<Node, SelectorError> + Send + Sync>;

/// Narrows the candidate services before nodes are collected.
pub type Filter = Arc<dyn Fn(Vec<Service>) -> Vec<Service> + Send + Sync>;

/// How `Next` walks the candidate nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    #[default]
    Random,
    RoundRobin,
}

/// Per-call selection options.
#[derive(Clone, Default)]
pub struct SelectOptions {
    pub filters: Vec<Filter>,
    pub strategy: Option<Strategy>,
}

impl fmt::Debug for SelectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectOptions")
            .field("filters", &self.filters.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl SelectOptions {
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Keeps nodes whose metadata has `key` set to `value`.
pub fn filter_metadata(key: impl Into<String>, value: impl Into<String>) -> Filter {
    let key = key.into();
    let value = value.into();
    Arc::new(move |services: Vec<Service>| {
        services
            .into_iter()
            .map(|mut s| {
                s.nodes
                    .retain(|n| n.metadata.get(&key).map(String::as_str) == Some(value.as_str()));
                s
            })
            .collect()
    })
}

/// Keeps nodes that advertise the given `protocol`.
pub fn filter_protocol(protocol: impl Into<String>) -> Filter {
    filter_metadata("protocol", protocol)
}

/// Keeps services of one version.
pub fn filter_version(version: impl Into<String>) -> Filter {
    let version = version.into();
    Arc::new(move |services: Vec<Service>| {
        services
            .into_iter()
            .filter(|s| s.version == version)
            .collect()
    })
}

#[async_trait]
pub trait Selector: Send + Sync + 'static {
    async fn select(&self, service: &str, opts: &SelectOptions) -> Result<Next, SelectorError>;
    /// Reports the outcome of using `node`.
    fn mark(&self, service: &str, node: &Node, err: Option<&RpcError>);
    /// Forgets any accumulated state for `service`.
    fn reset(&self, service: &str);
}

/// Consecutive failures after which a node is skipped while others remain.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Selector backed by a [`Registry`], down-ranking nodes that keep failing.
pub struct RegistrySelector {
    registry: Arc<dyn Registry>,
    strategy: Strategy,
    threshold: u32,
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl RegistrySelector {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            strategy: Strategy::default(),
            threshold: DEFAULT_FAILURE_THRESHOLD,
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    /// Consecutive failures recorded for a node.
    pub fn failures(&self, node_id: &str) -> u32 {
        self.failures.lock().get(node_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Selector for RegistrySelector {
    async fn select(&self, service: &str, opts: &SelectOptions) -> Result<Next, SelectorError> {
        let mut services = match self.registry.get_service(service).await {
            Ok(services) => services,
            Err(RegistryError::NotFound) => return Err(SelectorError::NotFound),
            Err(e) => return Err(SelectorError::Registry(e.to_string())),
        };
        for filter in &opts.filters {
            services = filter(services);
        }
        let nodes: Vec<Node> = services.into_iter().flat_map(|s| s.nodes).collect();
        if nodes.is_empty() {
            return Err(SelectorError::NoneAvailable);
        }
        debug!(service, nodes = nodes.len(), "selected candidate nodes");

        let strategy = opts.strategy.unwrap_or(self.strategy);
        let cursor = AtomicUsize::new(rand::thread_rng().gen_range(0..nodes.len()));
        let failures = Arc::clone(&self.failures);
        let threshold = self.threshold;
        let nodes = Arc::new(nodes);

        Ok(Arc::new(move || {
            let healthy: Vec<&Node> = {
                let failures = failures.lock();
                nodes
                    .iter()
                    .filter(|n| failures.get(&n.id).copied().unwrap_or(0) < threshold)
                    .collect()
            };
            // All nodes down-ranked: fall back to the full list rather than fail.
            let candidates: Vec<&Node> = if healthy.is_empty() {
                nodes.iter().collect()
            } else {
                healthy
            };
            let index = match strategy {
                Strategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
                Strategy::RoundRobin => cursor.fetch_add(1, Ordering::Relaxed) % candidates.len(),
            };
            Ok(candidates[index].clone())
        }))
    }

    fn mark(&self, _service: &str, node: &Node, err: Option<&RpcError>) {
        let mut failures = self.failures.lock();
        match err {
            None => {
                failures.remove(&node.id);
            }
            Some(e) if e.is_retryable() || matches!(e, RpcError::Timeout(_)) => {
                *failures.entry(node.id.clone()).or_insert(0) += 1;
            }
            Some(_) => {}
        }
    }

    fn reset(&self, _service: &str) {
        self.failures.lock().clear();
    }
}
