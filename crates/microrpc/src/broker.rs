//! Publish/subscribe broker used for events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::RpcError;

/// A published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,
    #[error("subscriber for {topic} failed: {source}")]
    Handler {
        topic: String,
        #[source]
        source: RpcError,
    },
}

impl From<BrokerError> for RpcError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Handler { source, .. } => source,
            other => RpcError::Internal(other.to_string()),
        }
    }
}

/// Receives messages for a subscription.
pub type BrokerHandler =
    Arc<dyn Fn(BrokerMessage) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self) -> Result<(), BrokerError>;
    async fn disconnect(&self) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, msg: BrokerMessage) -> Result<(), BrokerError>;
    async fn subscribe(&self, topic: &str, handler: BrokerHandler)
        -> Result<Subscription, BrokerError>;
    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BrokerError>;
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub id: u64,
}

/// In-process broker. Publication delivers to every subscriber of the topic
/// before returning.
#[derive(Default)]
pub struct MemoryBroker {
    connected: AtomicBool,
    next_id: AtomicU64,
    subscribers: DashMap<String, Vec<(u64, BrokerHandler)>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map_or(0, |s| s.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, msg: BrokerMessage) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let handlers: Vec<BrokerHandler> = self
            .subscribers
            .get(topic)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        debug!(topic, subscribers = handlers.len(), "publishing");

        let mut first_err = None;
        for handler in handlers {
            if let Err(e) = handler(msg.clone()).await {
                warn!(topic, error = %e, "subscriber failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(source) => Err(BrokerError::Handler {
                topic: topic.to_string(),
                source,
            }),
            None => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: BrokerHandler,
    ) -> Result<Subscription, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        Ok(Subscription {
            topic: topic.to_string(),
            id,
        })
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BrokerError> {
        if let Some(mut subs) = self.subscribers.get_mut(&subscription.topic) {
            subs.retain(|(id, _)| *id != subscription.id);
        }
        self.subscribers
            .remove_if(&subscription.topic, |_, subs| subs.is_empty());
        Ok(())
    }
}
