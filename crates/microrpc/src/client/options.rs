//! Client and per-call options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use microrpc_codec::{CodecRegistry, DEFAULT_CONTENT_TYPE};
use microrpc_transport::transport::DEFAULT_DIAL_TIMEOUT;
use microrpc_transport::{PoolConfig, TcpTransport, Transport};

use crate::broker::Broker;
use crate::client::backoff::{exponential_backoff, BackoffFn};
use crate::client::retry::{retry_on_error, RetryFn};
use crate::client::RpcRequest;
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::Result;
use crate::registry::{MemoryRegistry, Node, Registry};
use crate::selector::{Filter, RegistrySelector, SelectOptions, Selector, Strategy};

/// Retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 1;

/// Default per-call deadline when the caller's context has none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One call attempt against a chosen node, returning the encoded reply body.
pub type CallFunc = Arc<
    dyn Fn(Context, Node, Arc<RpcRequest>, CallOptions) -> BoxFuture<'static, Result<Bytes>>
        + Send
        + Sync,
>;

/// Decorates a [`CallFunc`].
pub type CallWrapper = Arc<dyn Fn(CallFunc) -> CallFunc + Send + Sync>;

/// Mutates [`CallOptions`] for a single call.
pub type CallOption = Arc<dyn Fn(&mut CallOptions) + Send + Sync>;

/// Options resolved for each call.
#[derive(Clone)]
pub struct CallOptions {
    pub select_options: SelectOptions,
    /// Bypasses node selection.
    pub address: Option<String>,
    pub backoff: BackoffFn,
    pub retry: RetryFn,
    pub retries: u32,
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
    /// Applied outermost-first: the first wrapper sees the call before the others.
    pub call_wrappers: Vec<CallWrapper>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            select_options: SelectOptions::default(),
            address: None,
            backoff: Arc::new(exponential_backoff),
            retry: Arc::new(retry_on_error),
            retries: DEFAULT_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            call_wrappers: Vec::new(),
        }
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("select_options", &self.select_options)
            .field("address", &self.address)
            .field("retries", &self.retries)
            .field("request_timeout", &self.request_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .field("call_wrappers", &self.call_wrappers.len())
            .finish()
    }
}

pub fn with_address(address: impl Into<String>) -> CallOption {
    let address = address.into();
    Arc::new(move |o: &mut CallOptions| o.address = Some(address.clone()))
}

pub fn with_retries(retries: u32) -> CallOption {
    Arc::new(move |o: &mut CallOptions| o.retries = retries)
}

pub fn with_backoff(backoff: BackoffFn) -> CallOption {
    Arc::new(move |o: &mut CallOptions| o.backoff = Arc::clone(&backoff))
}

pub fn with_retry(retry: RetryFn) -> CallOption {
    Arc::new(move |o: &mut CallOptions| o.retry = Arc::clone(&retry))
}

pub fn with_request_timeout(timeout: Duration) -> CallOption {
    Arc::new(move |o: &mut CallOptions| o.request_timeout = timeout)
}

pub fn with_dial_timeout(timeout: Duration) -> CallOption {
    Arc::new(move |o: &mut CallOptions| o.dial_timeout = timeout)
}

/// Adds a wrapper for this call only, inside any client-level wrappers.
pub fn with_call_wrapper(wrapper: CallWrapper) -> CallOption {
    Arc::new(move |o: &mut CallOptions| o.call_wrappers.push(Arc::clone(&wrapper)))
}

pub fn with_select_filter(filter: Filter) -> CallOption {
    Arc::new(move |o: &mut CallOptions| o.select_options.filters.push(Arc::clone(&filter)))
}

pub fn with_select_strategy(strategy: Strategy) -> CallOption {
    Arc::new(move |o: &mut CallOptions| o.select_options.strategy = Some(strategy))
}

/// Client construction options.
#[derive(Clone)]
pub struct ClientOptions {
    /// Content type for requests that do not name one.
    pub content_type: String,
    /// Codecs consulted before the built-ins.
    pub codecs: CodecRegistry,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<dyn Registry>,
    /// Defaults to a [`RegistrySelector`] over `registry`.
    pub selector: Option<Arc<dyn Selector>>,
    pub broker: Option<Arc<dyn Broker>>,
    pub pool: PoolConfig,
    /// Defaults applied to every call before per-call options.
    pub call_options: CallOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            codecs: CodecRegistry::new(),
            transport: Arc::new(TcpTransport::default()),
            registry: Arc::new(MemoryRegistry::new()),
            selector: None,
            broker: None,
            pool: PoolConfig::default(),
            call_options: CallOptions::default(),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("content_type", &self.content_type)
            .field("codecs", &self.codecs)
            .field("transport", &self.transport.name())
            .field("pool", &self.pool)
            .field("call_options", &self.call_options)
            .finish()
    }
}

impl ClientOptions {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Adds a client-level call wrapper; earlier wrappers run outermost.
    pub fn wrap_call(mut self, wrapper: CallWrapper) -> Self {
        self.call_options.call_wrappers.push(wrapper);
        self
    }

    /// Applies a [`ClientConfig`].
    pub fn with_config(mut self, config: &ClientConfig) -> Self {
        self.content_type = config.content_type.clone();
        self.pool = PoolConfig {
            size: config.pool_size,
            ttl: config.pool_ttl(),
        };
        self.call_options.retries = config.retries;
        self.call_options.request_timeout = config.request_timeout();
        self.call_options.dial_timeout = config.dial_timeout();
        self
    }

    pub(crate) fn resolve_selector(&self) -> Arc<dyn Selector> {
        match &self.selector {
            Some(selector) => Arc::clone(selector),
            None => Arc::new(RegistrySelector::new(Arc::clone(&self.registry))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_option_defaults() {
        let opts = CallOptions::default();
        assert_eq!(opts.retries, 1);
        assert_eq!(opts.request_timeout, Duration::from_secs(5));
        assert_eq!(opts.dial_timeout, Duration::from_secs(5));
        assert!(opts.address.is_none());
    }

    #[test]
    fn test_call_options_apply_in_order() {
        let mut opts = CallOptions::default();
        for o in [with_retries(4), with_address("a:1"), with_retries(2)] {
            o(&mut opts);
        }
        assert_eq!(opts.retries, 2);
        assert_eq!(opts.address.as_deref(), Some("a:1"));
    }

    #[test]
    fn test_with_config() {
        let config = ClientConfig {
            retries: 5,
            pool_size: 3,
            ..ClientConfig::default()
        };
        let opts = ClientOptions::default().with_config(&config);
        assert_eq!(opts.call_options.retries, 5);
        assert_eq!(opts.pool.size, 3);
    }
}
