//! Client call engine.
//!
//! A call resolves its options, picks a `Next` node source, derives a
//! deadline, then runs up to `retries + 1` attempts. Each attempt backs off,
//! takes a node, runs the wrapped call against it and reports the outcome to
//! the selector. The caller's context bounds the whole loop: when it ends the
//! call returns a timeout even if an attempt is still in flight.

pub mod backoff;
pub mod options;
pub mod retry;
pub mod stream;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use microrpc_codec::{headers, BodyFormat, CodecExt, Message, MessageType};
use microrpc_transport::{ConnectionPool, DialOptions, PoolConn};

use crate::broker::BrokerMessage;
use crate::context::{encode_timeout, Context};
use crate::error::{Result, RpcError, Status};
use crate::registry::Node;
use crate::rpc_codec::RpcCodec;
use crate::selector::{Next, Selector, SelectorError};

pub use options::{CallFunc, CallOption, CallOptions, CallWrapper, ClientOptions};
pub use stream::ClientStream;

/// Routes every call to this service name instead of the requested one.
pub const ENV_PROXY: &str = "MICRORPC_PROXY";
/// Routes every call to this address, bypassing selection.
pub const ENV_PROXY_ADDRESS: &str = "MICRORPC_PROXY_ADDRESS";

/// Protocol advertised by (and filtered on for) microrpc nodes.
pub const PROTOCOL: &str = "mrpc";

/// A request with its body already encoded; what wrappers and attempts see.
#[derive(Debug, Clone, Default)]
pub struct RpcRequest {
    pub service: String,
    pub endpoint: String,
    pub content_type: String,
    pub body: Bytes,
    pub stream: bool,
}

/// A typed request built by [`Client::new_request`].
#[derive(Debug, Clone)]
pub struct Request<T> {
    service: String,
    endpoint: String,
    content_type: String,
    body: T,
}

impl<T> Request<T> {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    /// Overrides the client's default content type for this request.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// A typed publication built by [`Client::new_publication`].
#[derive(Debug, Clone)]
pub struct Publication<T> {
    topic: String,
    content_type: String,
    payload: T,
}

impl<T> Publication<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// RPC client. Cheap to clone; clones share the pool and selector.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    opts: ClientOptions,
    selector: Arc<dyn Selector>,
    pool: ConnectionPool,
    seq: AtomicU64,
    broker_connected: OnceCell<()>,
}

fn timeout_error(ctx: &Context, req: &RpcRequest) -> RpcError {
    let why = ctx
        .err()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "context done".to_string());
    RpcError::Timeout(format!("call {} {}: {}", req.service, req.endpoint, why))
}

impl Client {
    pub fn new(opts: ClientOptions) -> Self {
        let selector = opts.resolve_selector();
        let pool = ConnectionPool::new(opts.pool.clone());
        Self {
            inner: Arc::new(ClientInner {
                opts,
                selector,
                pool,
                seq: AtomicU64::new(1),
                broker_connected: OnceCell::new(),
            }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.opts
    }

    /// The connection pool shared by this client's calls.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn new_request<T>(
        &self,
        service: impl Into<String>,
        endpoint: impl Into<String>,
        body: T,
    ) -> Request<T> {
        Request {
            service: service.into(),
            endpoint: endpoint.into(),
            content_type: self.inner.opts.content_type.clone(),
            body,
        }
    }

    pub fn new_publication<T>(&self, topic: impl Into<String>, payload: T) -> Publication<T> {
        Publication {
            topic: topic.into(),
            content_type: self.inner.opts.content_type.clone(),
            payload,
        }
    }

    /// Performs a unary call and decodes the reply as `R`.
    pub async fn call<T, R>(&self, ctx: &Context, req: &Request<T>, opts: &[CallOption]) -> Result<R>
    where
        T: Serialize + 'static,
        R: DeserializeOwned + 'static,
    {
        let format = self.inner.format_for(&req.content_type)?;
        let raw = RpcRequest {
            service: req.service.clone(),
            endpoint: req.endpoint.clone(),
            content_type: req.content_type.clone(),
            body: format.encode(&req.body)?.into(),
            stream: false,
        };
        let reply = self.call_raw(ctx, raw, opts).await?;
        Ok(format.decode(&reply)?)
    }

    /// Performs a unary call with a pre-encoded body, returning the encoded reply.
    pub async fn call_raw(&self, ctx: &Context, req: RpcRequest, opts: &[CallOption]) -> Result<Bytes> {
        let mut call_opts = self.inner.opts.call_options.clone();
        for o in opts {
            o(&mut call_opts);
        }
        let req = Arc::new(req);
        let next = self.inner.next(&req, &call_opts).await?;

        let ctx = match ctx.remaining() {
            None => ctx.with_timeout(call_opts.request_timeout),
            Some(remaining) => {
                call_opts.request_timeout = remaining;
                ctx.clone()
            }
        };
        if ctx.is_done() {
            return Err(timeout_error(&ctx, &req));
        }

        let mut rcall: CallFunc = {
            let inner = Arc::clone(&self.inner);
            Arc::new(move |ctx, node, req, opts| {
                ClientInner::call_node(Arc::clone(&inner), ctx, node, req, opts).boxed()
            })
        };
        for wrapper in call_opts.call_wrappers.iter().rev() {
            rcall = wrapper(rcall);
        }

        let mut last_err = None;
        for attempt in 0..=call_opts.retries {
            let task = {
                let ctx = ctx.clone();
                let req = Arc::clone(&req);
                let next = Arc::clone(&next);
                let rcall = Arc::clone(&rcall);
                let opts = call_opts.clone();
                let selector = Arc::clone(&self.inner.selector);
                tokio::spawn(async move {
                    let delay = (opts.backoff)(&ctx, &*req, attempt)?;
                    if !delay.is_zero() {
                        debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
                        tokio::time::sleep(delay).await;
                    }
                    let node = next().map_err(|e| RpcError::ServiceUnavailable {
                        service: req.service.clone(),
                        reason: e.to_string(),
                    })?;
                    let result = rcall(ctx, node.clone(), Arc::clone(&req), opts).await;
                    selector.mark(&req.service, &node, result.as_ref().err());
                    result
                })
            };

            let result = tokio::select! {
                _ = ctx.done() => return Err(timeout_error(&ctx, &req)),
                joined = task => joined.unwrap_or_else(|e| {
                    Err(RpcError::Internal(format!("call attempt aborted: {}", e)))
                }),
            };

            match result {
                Ok(body) => return Ok(body),
                Err(err) if err.is_codec() => return Err(err),
                Err(err) => {
                    if !(call_opts.retry)(&ctx, &*req, attempt, &err)? {
                        return Err(err);
                    }
                    if attempt < call_opts.retries {
                        warn!(
                            service = req.service.as_str(),
                            endpoint = req.endpoint.as_str(),
                            attempt,
                            error = %err,
                            "call attempt failed, retrying"
                        );
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RpcError::Internal("no call attempt was made".into())))
    }

    /// Opens a bidirectional stream. The request body travels with the
    /// opening envelope; the stream itself is not bound by the request timeout.
    pub async fn stream<T>(&self, ctx: &Context, req: &Request<T>, opts: &[CallOption]) -> Result<ClientStream>
    where
        T: Serialize + 'static,
    {
        let format = self.inner.format_for(&req.content_type)?;
        let req = Arc::new(RpcRequest {
            service: req.service.clone(),
            endpoint: req.endpoint.clone(),
            content_type: req.content_type.clone(),
            body: format.encode(&req.body)?.into(),
            stream: true,
        });
        let mut call_opts = self.inner.opts.call_options.clone();
        for o in opts {
            o(&mut call_opts);
        }
        let next = self.inner.next(&req, &call_opts).await?;
        if ctx.is_done() {
            return Err(timeout_error(ctx, &req));
        }

        let mut last_err = None;
        for attempt in 0..=call_opts.retries {
            let task = {
                let ctx = ctx.clone();
                let req = Arc::clone(&req);
                let next = Arc::clone(&next);
                let opts = call_opts.clone();
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    let delay = (opts.backoff)(&ctx, &*req, attempt)?;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let node = next().map_err(|e| RpcError::ServiceUnavailable {
                        service: req.service.clone(),
                        reason: e.to_string(),
                    })?;
                    let selector = Arc::clone(&inner.selector);
                    let result =
                        ClientInner::stream_node(inner, ctx, node.clone(), Arc::clone(&req), opts).await;
                    selector.mark(&req.service, &node, result.as_ref().err());
                    result
                })
            };

            let result = tokio::select! {
                _ = ctx.done() => return Err(timeout_error(ctx, &req)),
                joined = task => joined.unwrap_or_else(|e| {
                    Err(RpcError::Internal(format!("stream attempt aborted: {}", e)))
                }),
            };

            match result {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_codec() => return Err(err),
                Err(err) => {
                    if !(call_opts.retry)(ctx, &*req, attempt, &err)? {
                        return Err(err);
                    }
                    warn!(service = req.service.as_str(), attempt, error = %err, "stream attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RpcError::Internal("no stream attempt was made".into())))
    }

    /// Publishes `msg` on its topic through the configured broker.
    pub async fn publish<T>(&self, ctx: &Context, msg: &Publication<T>) -> Result<()>
    where
        T: Serialize + 'static,
    {
        let broker = self
            .inner
            .opts
            .broker
            .as_ref()
            .ok_or_else(|| RpcError::Internal("no broker configured".into()))?;
        self.inner
            .broker_connected
            .get_or_try_init(|| broker.connect())
            .await?;

        let mut codec = self.inner.opts.codecs.new_codec(&msg.content_type)?;
        let mut header: HashMap<String, String> = ctx.metadata().clone();
        header.insert(headers::CONTENT_TYPE.to_string(), msg.content_type.clone());
        header.insert(headers::TOPIC.to_string(), msg.topic.clone());
        header.insert(headers::ID.to_string(), uuid::Uuid::new_v4().to_string());

        let mut envelope = Message {
            target: msg.topic.clone(),
            header,
            ..Message::new(MessageType::Event)
        };
        codec.write_value(&mut envelope, Some(&msg.payload))?;
        let body = codec.buffer().take_written();

        debug!(topic = msg.topic.as_str(), bytes = body.len(), "publishing event");
        let publish = broker.publish(
            &msg.topic,
            BrokerMessage {
                header: envelope.header,
                body,
            },
        );
        tokio::select! {
            r = publish => Ok(r?),
            _ = ctx.done() => Err(RpcError::Timeout(format!("publish to {}: context done", msg.topic))),
        }
    }
}

impl ClientInner {
    fn format_for(&self, content_type: &str) -> Result<BodyFormat> {
        Ok(self.opts.codecs.new_codec(content_type)?.format())
    }

    async fn next(&self, req: &RpcRequest, opts: &CallOptions) -> Result<Next> {
        let service = match std::env::var(ENV_PROXY) {
            Ok(proxy) if !proxy.is_empty() => proxy,
            _ => req.service.clone(),
        };
        let address = std::env::var(ENV_PROXY_ADDRESS)
            .ok()
            .filter(|a| !a.is_empty())
            .or_else(|| opts.address.clone());
        if let Some(address) = address {
            let node = Node::new(address.clone(), address).with_metadata("protocol", PROTOCOL);
            return Ok(Arc::new(move || Ok(node.clone())));
        }

        self.selector
            .select(&service, &opts.select_options)
            .await
            .map_err(|e| match e {
                SelectorError::NotFound | SelectorError::NoneAvailable => {
                    RpcError::ServiceUnavailable {
                        service: service.clone(),
                        reason: e.to_string(),
                    }
                }
                SelectorError::Registry(reason) => {
                    RpcError::Internal(format!("error selecting {} node: {}", service, reason))
                }
            })
    }

    async fn checkout(&self, ctx: &Context, req: &RpcRequest, address: &str, dial: DialOptions) -> Result<PoolConn> {
        tokio::select! {
            conn = self.pool.get_conn(address, &*self.opts.transport, dial) => Ok(conn?),
            _ = ctx.done() => Err(timeout_error(ctx, req)),
        }
    }

    async fn call_node(
        self: Arc<Self>,
        ctx: Context,
        node: Node,
        req: Arc<RpcRequest>,
        opts: CallOptions,
    ) -> Result<Bytes> {
        let codec = self.opts.codecs.new_codec(&req.content_type)?;
        let mut header: HashMap<String, String> = ctx.metadata().clone();
        header.insert(headers::TIMEOUT.to_string(), encode_timeout(opts.request_timeout));
        header.insert(headers::ACCEPT.to_string(), req.content_type.clone());

        let dial = DialOptions {
            timeout: opts.dial_timeout,
            stream: false,
        };
        let conn = self.checkout(&ctx, &req, &node.address, dial).await?;
        let mut rc = RpcCodec::new(conn, codec, req.content_type.clone()).with_header(header);
        let id = self.seq.fetch_add(1, Ordering::Relaxed).to_string();

        let result = tokio::select! {
            r = exchange(&mut rc, &id, &req) => r,
            _ = ctx.done() => Err(timeout_error(&ctx, &req)),
        };

        let err = result
            .as_ref()
            .err()
            .map(|e| e as &(dyn StdError + Send + Sync));
        self.pool.release(&node.address, rc.into_socket(), err).await;
        result
    }

    async fn stream_node(
        self: Arc<Self>,
        ctx: Context,
        node: Node,
        req: Arc<RpcRequest>,
        opts: CallOptions,
    ) -> Result<ClientStream> {
        let codec = self.opts.codecs.new_codec(&req.content_type)?;
        let dial = DialOptions {
            timeout: opts.dial_timeout,
            stream: true,
        };
        let conn = self.checkout(&ctx, &req, &node.address, dial).await?;
        let id = self.seq.fetch_add(1, Ordering::Relaxed).to_string();

        let mut header: HashMap<String, String> = ctx.metadata().clone();
        header.insert(headers::STREAM.to_string(), id.clone());
        header.insert(headers::ACCEPT.to_string(), req.content_type.clone());
        let mut rc = RpcCodec::new(conn, codec, req.content_type.clone()).with_header(header);

        let mut msg = Message {
            id: id.clone(),
            target: req.service.clone(),
            endpoint: req.endpoint.clone(),
            ..Message::new(MessageType::Request)
        };
        let opened = tokio::select! {
            r = rc.write(&mut msg, Some(&req.body)) => r,
            _ = ctx.done() => Err(timeout_error(&ctx, &req)),
        };
        if let Err(e) = opened {
            self.pool.release(&node.address, rc.into_socket(), Some(&e)).await;
            return Err(e);
        }
        debug!(service = req.service.as_str(), endpoint = req.endpoint.as_str(), id = id.as_str(), "stream opened");
        Ok(ClientStream::new(id, ctx, req, node.address, rc, self))
    }
}

async fn exchange(rc: &mut RpcCodec<PoolConn>, id: &str, req: &RpcRequest) -> Result<Bytes> {
    let mut msg = Message {
        id: id.to_string(),
        target: req.service.clone(),
        endpoint: req.endpoint.clone(),
        ..Message::new(MessageType::Request)
    };
    rc.write(&mut msg, Some(&req.body)).await?;

    let mut rsp = Message::default();
    rc.read_header(&mut rsp, MessageType::Response).await?;
    if !rsp.error.is_empty() {
        return Err(RpcError::Application(Status::parse(&rsp.error)));
    }
    rc.read_body()
}
