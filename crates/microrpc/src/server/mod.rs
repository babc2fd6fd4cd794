//! RPC server: listener, connection loop and lifecycle.
//!
//! Each accepted connection is served sequentially by its own task: read a
//! request header, dispatch it through the [`Router`], repeat. A connection is
//! dropped when the peer goes away, when its content type cannot be served,
//! or after a handler panic.

pub mod handler;
pub mod options;
pub mod router;
pub mod stream;
pub mod subscriber;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use microrpc_codec::{headers, CodecError, Message, MessageType, DEFAULT_CONTENT_TYPE, END_OF_STREAM};
use microrpc_transport::{Listener, Socket, TransportError};

use crate::broker::{BrokerHandler, BrokerMessage, Subscription};
use crate::client::PROTOCOL;
use crate::context::{parse_timeout, Context};
use crate::error::{Result, RpcError, Status};
use crate::registry::{Node, Service};
use crate::rpc_codec::RpcCodec;

pub use handler::{Handler, HandlerBuilder, HandlerFunc, HandlerWrapper, MethodKind, ServerRequest};
pub use options::ServerOptions;
pub use router::{HandleError, Router, ServeOutcome};
pub use stream::{ServerStream, SharedCodec};
pub use subscriber::{Event, Subscriber, SubscriberFunc, SubscriberWrapper};

const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(10);

struct Running {
    address: String,
    service: Service,
    subscriptions: Vec<Subscription>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

pub struct Server {
    opts: ServerOptions,
    router: Arc<Router>,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        let router = Router::new(opts.name.clone())
            .with_codecs(opts.codecs.clone())
            .with_handler_wrappers(opts.handler_wrappers.clone())
            .with_subscriber_wrappers(opts.subscriber_wrappers.clone());
        Self {
            opts,
            router: Arc::new(router),
            running: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn handle(&self, handler: Handler) -> std::result::Result<(), HandleError> {
        self.router.handle(handler)
    }

    /// Adds a subscriber. Topics are subscribed on the broker at start.
    pub fn subscribe(&self, subscriber: Subscriber) -> Result<()> {
        self.router.subscribe(subscriber)
    }

    /// Bound address while running.
    pub fn address(&self) -> Option<String> {
        self.running.lock().as_ref().map(|r| r.address.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Listens, registers the node, subscribes topics and starts accepting.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<String> {
        if self.is_running() {
            return Err(RpcError::Internal(format!("server {} already started", self.opts.name)));
        }

        let mut listener = self.opts.transport.listen(&self.opts.address).await?;
        let address = listener.addr().to_string();

        let mut metadata = self.opts.metadata.clone();
        metadata.insert("protocol".to_string(), PROTOCOL.to_string());
        metadata.insert("transport".to_string(), self.opts.transport.name().to_string());
        let service = Service {
            name: self.opts.name.clone(),
            version: self.opts.version.clone(),
            metadata: HashMap::new(),
            endpoints: self.router.endpoints(),
            nodes: vec![Node {
                id: format!("{}-{}", self.opts.name, self.opts.id),
                address: address.clone(),
                metadata,
            }],
        };
        let subscriptions = match self.subscribe_topics().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                let _ = listener.close().await;
                return Err(e);
            }
        };

        if let Some(registry) = &self.opts.registry {
            if let Err(e) = registry.register(&service).await {
                self.unsubscribe_all(&subscriptions).await;
                let _ = listener.close().await;
                return Err(RpcError::Internal(format!("registering {}: {}", service.name, e)));
            }
        }

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            listener,
            Arc::clone(&self.router),
            shutdown.clone(),
            tracker.clone(),
        ));

        info!(
            service = self.opts.name.as_str(),
            address = address.as_str(),
            transport = self.opts.transport.name(),
            "server started"
        );
        *self.running.lock() = Some(Running {
            address: address.clone(),
            service,
            subscriptions,
            shutdown,
            tracker,
        });
        Ok(address)
    }

    async fn subscribe_topics(&self) -> Result<Vec<Subscription>> {
        let topics = self.router.topics();
        if topics.is_empty() {
            return Ok(Vec::new());
        }
        let broker = self.opts.broker.as_ref().ok_or_else(|| {
            RpcError::Internal("subscribers registered but no broker configured".into())
        })?;
        broker.connect().await?;

        let mut subscriptions = Vec::with_capacity(topics.len());
        for topic in topics {
            let router = Arc::clone(&self.router);
            let topic_name = topic.clone();
            let handler: BrokerHandler = Arc::new(move |msg: BrokerMessage| {
                let router = Arc::clone(&router);
                let topic = topic_name.clone();
                async move { router.process_message(Context::background(), &topic, msg).await }.boxed()
            });
            subscriptions.push(broker.subscribe(&topic, handler).await?);
        }
        Ok(subscriptions)
    }

    async fn unsubscribe_all(&self, subscriptions: &[Subscription]) {
        let Some(broker) = &self.opts.broker else {
            return;
        };
        for subscription in subscriptions {
            if let Err(e) = broker.unsubscribe(subscription).await {
                warn!(topic = subscription.topic.as_str(), error = %e, "unsubscribe failed");
            }
        }
    }

    /// Deregisters, unsubscribes, stops accepting and waits for every
    /// connection task to finish.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        if let Some(registry) = &self.opts.registry {
            if let Err(e) = registry.deregister(&running.service).await {
                warn!(service = running.service.name.as_str(), error = %e, "deregister failed");
            }
        }
        self.unsubscribe_all(&running.subscriptions).await;

        running.shutdown.cancel();
        running.tracker.close();
        running.tracker.wait().await;
        info!(service = self.opts.name.as_str(), address = running.address.as_str(), "server stopped");
        Ok(())
    }
}

async fn accept_loop(
    mut listener: Box<dyn Listener>,
    router: Arc<Router>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(socket) => {
                    debug!(remote = socket.remote(), "accepted connection");
                    tracker.spawn(serve_conn(Arc::clone(&router), socket, shutdown.clone()));
                }
                Err(TransportError::ListenerClosed) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            },
        }
    }
    if let Err(e) = listener.close().await {
        debug!(error = %e, "closing listener");
    }
}

/// Handler context for one request: its headers plus `Local`/`Remote`, with
/// the deadline taken from the `Timeout` header.
fn request_context(msg: &Message, local: &str, remote: &str) -> Context {
    let mut metadata = msg.header.clone();
    metadata.insert(headers::LOCAL.to_string(), local.to_string());
    metadata.insert(headers::REMOTE.to_string(), remote.to_string());
    let ctx = Context::background().with_metadata_map(metadata);
    match msg.header(headers::TIMEOUT).and_then(parse_timeout) {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx,
    }
}

/// Serves one connection until the peer leaves or the server stops.
pub async fn serve_conn(router: Arc<Router>, socket: Box<dyn Socket>, shutdown: CancellationToken) {
    let local = socket.local().to_string();
    let remote = socket.remote().to_string();
    let codec = match RpcCodec::negotiating(socket, router.codecs().clone(), DEFAULT_CONTENT_TYPE) {
        Ok(codec) => codec,
        Err(e) => {
            warn!(remote = remote.as_str(), error = %e, "no default codec");
            return;
        }
    };
    let codec: SharedCodec = Arc::new(tokio::sync::Mutex::new(codec));
    // Id of a finished stream whose client frames are still arriving.
    let mut draining: Option<String> = None;

    loop {
        let mut msg = Message::default();
        let read = {
            let mut guard = codec.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                r = guard.read_header(&mut msg, MessageType::Request) => r,
            }
        };

        match read {
            Ok(()) => {}
            Err(RpcError::Transport(e)) => {
                if !e.is_closed() {
                    debug!(remote = remote.as_str(), error = %e, "connection read failed");
                }
                break;
            }
            Err(RpcError::Codec(CodecError::UnsupportedContentType(ct))) => {
                let text = format!("Unsupported Content-Type: {}", ct);
                warn!(remote = remote.as_str(), content_type = ct.as_str(), "unsupported content type");
                if let Err(e) = codec.lock().await.write_plain_error(&text).await {
                    debug!(error = %e, "writing plain error");
                }
                break;
            }
            Err(e) => {
                let status = Status::bad_request(router.name(), format!("rpc: unable to read request header: {}", e));
                if let Err(e) = router::write_error(&codec, &msg, &status).await {
                    debug!(error = %e, "writing header error");
                }
                break;
            }
        }

        if let Some(stream_id) = &draining {
            if msg.id != *stream_id {
                warn!(
                    remote = remote.as_str(),
                    stream = stream_id.as_str(),
                    id = msg.id.as_str(),
                    "request arrived before the previous stream was closed"
                );
                break;
            }
            if msg.error == END_OF_STREAM {
                draining = None;
            } else {
                trace!(stream = stream_id.as_str(), "discarding frame of finished stream");
            }
            continue;
        }

        // A late close from a client stream that already ended.
        if msg.error == END_OF_STREAM {
            continue;
        }

        let id = msg.id.clone();
        let ctx = request_context(&msg, &local, &remote);
        match router.serve_request(ctx, msg, Arc::clone(&codec)).await {
            Ok(ServeOutcome::Completed) => {}
            Ok(ServeOutcome::StreamPending) => draining = Some(id),
            Ok(ServeOutcome::Panicked) => break,
            Err(e) => {
                debug!(remote = remote.as_str(), error = %e, "reply not delivered");
                break;
            }
        }
    }

    if let Err(e) = codec.lock().await.close().await {
        debug!(remote = remote.as_str(), error = %e, "closing connection");
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, Registry};
    use microrpc_transport::MemoryTransport;

    struct Greeter;

    fn server(registry: Arc<MemoryRegistry>) -> Server {
        let server = Server::new(
            ServerOptions::default()
                .name("greeter")
                .address("greeter:0")
                .transport(Arc::new(MemoryTransport::new()))
                .registry(registry),
        );
        server
            .handle(
                Handler::new(Greeter)
                    .unary("Hello", |_g: Arc<Greeter>, _ctx: Context, name: String| async move {
                        Ok(format!("Hello {}", name))
                    })
                    .build(),
            )
            .unwrap();
        server
    }

    #[test]
    fn test_request_context() {
        let mut msg = Message::default();
        msg.header.insert(headers::TIMEOUT.into(), "2000000000".into());
        msg.header.insert("X-Trace".into(), "abc".into());
        let ctx = request_context(&msg, "l:1", "r:2");
        assert_eq!(ctx.metadata().get("X-Trace").map(String::as_str), Some("abc"));
        assert_eq!(ctx.metadata().get(headers::REMOTE).map(String::as_str), Some("r:2"));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(2) && remaining > Duration::from_secs(1));
        assert!(request_context(&Message::default(), "l", "r").deadline().is_none());
    }

    #[tokio::test]
    async fn test_start_registers_and_stop_deregisters() {
        let registry = Arc::new(MemoryRegistry::new());
        let server = server(Arc::clone(&registry));
        let address = server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.address().as_deref(), Some(address.as_str()));
        assert!(server.start().await.is_err());

        let services = registry.get_service("greeter").await.unwrap();
        assert_eq!(services[0].endpoints, vec!["Greeter.Hello".to_string()]);
        let node = &services[0].nodes[0];
        assert_eq!(node.address, address);
        assert_eq!(node.metadata.get("protocol").map(String::as_str), Some(PROTOCOL));

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(registry.get_service("greeter").await.is_err());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_need_broker() {
        let server = server(Arc::new(MemoryRegistry::new()));
        server
            .subscribe(Subscriber::new("t", |_ctx: Context, _v: u32| async { Ok(()) }))
            .unwrap();
        assert!(server.start().await.is_err());
        assert!(!server.is_running());
    }
}
