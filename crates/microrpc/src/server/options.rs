//! Server construction options.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use microrpc_codec::{CodecRegistry, NewCodec};
use microrpc_transport::{TcpTransport, Transport};

use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::server::handler::HandlerWrapper;
use crate::server::subscriber::SubscriberWrapper;

pub const DEFAULT_NAME: &str = "microrpc.server";
pub const DEFAULT_VERSION: &str = "latest";
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:0";

#[derive(Clone)]
pub struct ServerOptions {
    /// Service name registered with the registry.
    pub name: String,
    /// Unique node id; a fresh UUID by default.
    pub id: String,
    pub version: String,
    /// Listen address. Port `0` picks a free port.
    pub address: String,
    /// Node metadata advertised in the registry.
    pub metadata: HashMap<String, String>,
    pub transport: Arc<dyn Transport>,
    pub registry: Option<Arc<dyn Registry>>,
    pub broker: Option<Arc<dyn Broker>>,
    /// Codecs consulted before the built-ins.
    pub codecs: CodecRegistry,
    /// Applied outermost-first around every dispatched request.
    pub handler_wrappers: Vec<HandlerWrapper>,
    /// Applied outermost-first around every delivered event.
    pub subscriber_wrappers: Vec<SubscriberWrapper>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            version: DEFAULT_VERSION.to_string(),
            address: DEFAULT_ADDRESS.to_string(),
            metadata: HashMap::new(),
            transport: Arc::new(TcpTransport::default()),
            registry: None,
            broker: None,
            codecs: CodecRegistry::new(),
            handler_wrappers: Vec::new(),
            subscriber_wrappers: Vec::new(),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("address", &self.address)
            .field("metadata", &self.metadata)
            .field("transport", &self.transport.name())
            .field("registry", &self.registry.is_some())
            .field("broker", &self.broker.is_some())
            .field("handler_wrappers", &self.handler_wrappers.len())
            .field("subscriber_wrappers", &self.subscriber_wrappers.len())
            .finish()
    }
}

impl ServerOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Registers an extra codec for `content_type`.
    pub fn codec(mut self, content_type: impl Into<String>, factory: NewCodec) -> Self {
        self.codecs.register(content_type, factory);
        self
    }

    pub fn wrap_handler(mut self, wrapper: HandlerWrapper) -> Self {
        self.handler_wrappers.push(wrapper);
        self
    }

    pub fn wrap_subscriber(mut self, wrapper: SubscriberWrapper) -> Self {
        self.subscriber_wrappers.push(wrapper);
        self
    }

    /// Applies a [`ServerConfig`].
    pub fn with_config(mut self, config: &ServerConfig) -> Self {
        self.name = config.name.clone();
        self.version = config.version.clone();
        self.address = config.address.clone();
        self.metadata.extend(config.metadata.clone());
        self
    }
}
