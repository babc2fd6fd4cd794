//! Request dispatch.
//!
//! The router owns the installed handlers and subscribers. `serve_request`
//! resolves `Service.Method`, decodes the argument for unary methods and runs
//! the wrapped handler inside a panic boundary. Every dispatched unary
//! request gets exactly one reply envelope, carrying either the result or a
//! structured error. Streams end with a single terminal envelope.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use microrpc_codec::{headers, CodecRegistry, Message, MessageType, DEFAULT_CONTENT_TYPE, END_OF_STREAM};

use crate::broker::BrokerMessage;
use crate::context::Context;
use crate::error::{Result, RpcError, Status};
use crate::server::handler::{
    is_exported, Handler, HandlerFunc, HandlerWrapper, MethodDescriptor, MethodKind, ServerRequest,
};
use crate::server::stream::{ServerStream, SharedCodec};
use crate::server::subscriber::{Event, Subscriber, SubscriberFunc, SubscriberWrapper};

/// Why a handler could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("rpc.Handle: no service name for handler")]
    NoName,
    #[error("rpc.Handle: type {0} is not exported")]
    NotExported(String),
    #[error("rpc: service already defined: {0}")]
    AlreadyDefined(String),
    #[error("rpc.Handle: type {0} has no exported methods of suitable type")]
    NoMethods(String),
}

impl From<HandleError> for RpcError {
    fn from(err: HandleError) -> Self {
        RpcError::Internal(err.to_string())
    }
}

/// How a dispatched request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Completed,
    /// The handler panicked; its connection should be closed.
    Panicked,
    /// A stream ended before its client end was read. The client's remaining
    /// frames for it, up to its end-of-stream marker, are still on the wire.
    StreamPending,
}

pub struct Router {
    name: String,
    codecs: CodecRegistry,
    services: Mutex<HashMap<String, Arc<Handler>>>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    handler_wrappers: Vec<HandlerWrapper>,
    subscriber_wrappers: Vec<SubscriberWrapper>,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Router {
    /// A router whose errors are attributed to `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            codecs: CodecRegistry::new(),
            services: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            handler_wrappers: Vec::new(),
            subscriber_wrappers: Vec::new(),
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_handler_wrappers(mut self, wrappers: Vec<HandlerWrapper>) -> Self {
        self.handler_wrappers = wrappers;
        self
    }

    pub fn with_subscriber_wrappers(mut self, wrappers: Vec<SubscriberWrapper>) -> Self {
        self.subscriber_wrappers = wrappers;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Installs a handler under its name.
    pub fn handle(&self, handler: Handler) -> std::result::Result<(), HandleError> {
        let name = handler.name().to_string();
        if name.is_empty() {
            return Err(HandleError::NoName);
        }
        if !is_exported(&name) {
            return Err(HandleError::NotExported(name));
        }
        if handler.methods().is_empty() {
            return Err(HandleError::NoMethods(name));
        }
        let mut services = self.services.lock();
        if services.contains_key(&name) {
            return Err(HandleError::AlreadyDefined(name));
        }
        debug!(service = name.as_str(), methods = handler.methods().len(), "handler installed");
        services.insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn subscribe(&self, subscriber: Subscriber) -> Result<()> {
        if subscriber.topic().is_empty() {
            return Err(RpcError::Internal("subscriber has no topic".into()));
        }
        self.subscribers
            .lock()
            .entry(subscriber.topic().to_string())
            .or_default()
            .push(subscriber);
        Ok(())
    }

    /// `Service.Method` for every installed method, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .services
            .lock()
            .values()
            .flat_map(|h| h.endpoints())
            .collect();
        endpoints.sort();
        endpoints
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscribers.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    fn lookup(&self, endpoint: &str) -> std::result::Result<(String, MethodDescriptor), Status> {
        let Some((service, method)) = endpoint.split_once('.') else {
            return Err(Status::bad_request(
                &self.name,
                format!("rpc: service/method request ill-formed: {}", endpoint),
            ));
        };
        if service.is_empty() || method.is_empty() {
            return Err(Status::bad_request(
                &self.name,
                format!("rpc: service/method request ill-formed: {}", endpoint),
            ));
        }
        let handler = self.services.lock().get(service).cloned().ok_or_else(|| {
            Status::not_found(&self.name, format!("rpc: can't find service {}", service))
        })?;
        let descriptor = handler.method(method).cloned().ok_or_else(|| {
            Status::not_found(&self.name, format!("rpc: can't find method {}", endpoint))
        })?;
        Ok((handler.name().to_string(), descriptor))
    }

    fn wrap(&self, func: HandlerFunc) -> HandlerFunc {
        self.handler_wrappers
            .iter()
            .rev()
            .fold(func, |inner, wrapper| wrapper(inner))
    }

    /// Dispatches a request whose header has been read from `codec`. Failing
    /// to reach the peer is the only error; everything else is answered.
    pub async fn serve_request(&self, ctx: Context, msg: Message, codec: SharedCodec) -> Result<ServeOutcome> {
        let answered = if msg.header.contains_key(headers::STREAM) {
            ServeOutcome::StreamPending
        } else {
            ServeOutcome::Completed
        };
        let (body, content_type, format) = {
            let mut guard = codec.lock().await;
            let body = guard.read_body();
            (body, guard.content_type().to_string(), guard.format())
        };

        let (service, method) = match self.lookup(&msg.endpoint) {
            Ok(found) => found,
            Err(status) => {
                warn!(endpoint = msg.endpoint.as_str(), detail = status.detail.as_str(), "rejecting request");
                write_error(&codec, &msg, &status).await?;
                return Ok(answered);
            }
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                let status = Status::bad_request(&self.name, format!("rpc: unable to read request body: {}", e));
                write_error(&codec, &msg, &status).await?;
                return Ok(answered);
            }
        };

        let mut req = ServerRequest::new(
            service,
            method.name.clone(),
            content_type,
            format,
            msg.header.clone(),
        );
        let mut client_finished = None;
        match (method.kind, &method.decode) {
            (MethodKind::Unary, Some(decode)) => match decode(format, &body) {
                Ok(arg) => req = req.with_arg(arg),
                Err(e) => {
                    let status = Status::bad_request(&self.name, format!("rpc: unable to decode request body: {}", e));
                    write_error(&codec, &msg, &status).await?;
                    return Ok(answered);
                }
            },
            (MethodKind::Unary, None) => {
                let status = Status::internal(&self.name, format!("rpc: {} has no decoder", msg.endpoint));
                write_error(&codec, &msg, &status).await?;
                return Ok(answered);
            }
            (MethodKind::Streaming, _) => {
                let stream = ServerStream::new(ctx.clone(), &msg, body, Arc::clone(&codec));
                client_finished = Some(stream.client_finished());
                req = req.with_stream(stream);
            }
        }

        let func = self.wrap(Arc::clone(&method.invoke));
        let outcome = AssertUnwindSafe(async move { func(ctx, req).await })
            .catch_unwind()
            .await;

        let finished = match &client_finished {
            Some(flag) if flag.load(Ordering::Acquire) => ServeOutcome::Completed,
            Some(_) => ServeOutcome::StreamPending,
            None => answered,
        };
        match (outcome, method.kind) {
            (Ok(Ok(reply)), MethodKind::Unary) => {
                write_reply(&codec, &msg, &reply).await?;
                Ok(finished)
            }
            (Ok(Ok(_)), MethodKind::Streaming) => {
                write_end_of_stream(&codec, &msg).await?;
                Ok(finished)
            }
            (Ok(Err(err)), _) => {
                debug!(endpoint = msg.endpoint.as_str(), error = %err, "handler returned error");
                write_error(&codec, &msg, &err.to_status(&self.name)).await?;
                Ok(finished)
            }
            (Err(panic), _) => {
                let detail = panic_message(panic.as_ref());
                error!(endpoint = msg.endpoint.as_str(), panic = detail.as_str(), "handler panicked");
                let status = Status::internal(&self.name, format!("panic recovered: {}", detail));
                write_error(&codec, &msg, &status).await?;
                Ok(ServeOutcome::Panicked)
            }
        }
    }

    /// Delivers a broker message to every subscriber of `topic`. Failures
    /// from individual subscribers are collected into one error.
    pub async fn process_message(&self, ctx: Context, topic: &str, msg: BrokerMessage) -> Result<()> {
        let subscribers = self.subscribers.lock().get(topic).cloned().unwrap_or_default();
        if subscribers.is_empty() {
            return Ok(());
        }

        let content_type = msg
            .header
            .get(headers::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let mut codec = self.codecs.new_codec(&content_type).map_err(|e| {
            RpcError::Internal(format!("no codec for event on {}: {}", topic, e))
        })?;
        codec.buffer().reset_read(&msg.body);
        let mut envelope = Message::new(MessageType::Event);
        codec.read_header(&mut envelope, MessageType::Event)?;
        let payload: Bytes = codec.read_body()?;
        let format = codec.format();

        let ctx = ctx.with_metadata_map(msg.header.clone());
        let mut failures = Vec::new();
        for subscriber in subscribers {
            let decoded = match (subscriber.decode)(format, &payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    failures.push(format!("decoding {}: {}", subscriber.payload_type(), e));
                    continue;
                }
            };
            let event = Event::new(topic.to_string(), content_type.clone(), msg.header.clone(), decoded);
            let func: SubscriberFunc = self
                .subscriber_wrappers
                .iter()
                .rev()
                .fold(Arc::clone(&subscriber.handler), |inner, wrapper| wrapper(inner));
            let ctx = ctx.clone();
            match AssertUnwindSafe(async move { func(ctx, event).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    error!(topic, panic = detail.as_str(), "subscriber panicked");
                    failures.push(format!("panic recovered: {}", detail));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(topic, failed = failures.len(), "event delivery failed");
            Err(RpcError::Internal(format!(
                "subscriber error: {}",
                failures.join("\n")
            )))
        }
    }
}

fn reply_envelope(msg: &Message, message_type: MessageType) -> Message {
    Message {
        id: msg.id.clone(),
        target: msg.target.clone(),
        endpoint: msg.endpoint.clone(),
        ..Message::new(message_type)
    }
}

async fn write_reply(codec: &SharedCodec, msg: &Message, body: &[u8]) -> Result<()> {
    let mut envelope = reply_envelope(msg, MessageType::Response);
    codec.lock().await.write(&mut envelope, Some(body)).await
}

pub(crate) async fn write_error(codec: &SharedCodec, msg: &Message, status: &Status) -> Result<()> {
    let mut envelope = reply_envelope(msg, MessageType::Error);
    envelope.error = status.to_json();
    codec.lock().await.write(&mut envelope, None).await
}

async fn write_end_of_stream(codec: &SharedCodec, msg: &Message) -> Result<()> {
    let mut envelope = reply_envelope(msg, MessageType::Error);
    envelope.error = END_OF_STREAM.to_string();
    codec.lock().await.write(&mut envelope, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_codec::RpcCodec;
    use crate::server::handler::Handler;
    use microrpc_transport::{DialOptions, Listener, MemoryTransport, Socket, Transport, TransportMessage};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    struct Echo;

    fn router() -> Router {
        let router = Router::new("test.server");
        router
            .handle(
                Handler::new(Echo)
                    .unary("Double", |_e: Arc<Echo>, _ctx: Context, p: Ping| async move { Ok(p.n * 2) })
                    .unary("Fail", |_e: Arc<Echo>, _ctx: Context, _p: Ping| async move {
                        Err::<u32, _>(RpcError::from(Status::new("1", "custom failure", 99)))
                    })
                    .unary("Boom", |_e: Arc<Echo>, _ctx: Context, _p: Ping| async move {
                        if true {
                            panic!("boom");
                        }
                        Ok(0u32)
                    })
                    .build(),
            )
            .unwrap();
        router
    }

    /// Returns the client socket and the server-side codec after the request has been read.
    async fn dispatch(endpoint: &str, body: &[u8]) -> (Box<dyn Socket>, SharedCodec, Message) {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("router:0").await.unwrap();
        let mut client = transport.dial(listener.addr(), DialOptions::default()).await.unwrap();
        let server = listener.accept().await.unwrap();

        client
            .send(
                &TransportMessage::new(body.to_vec())
                    .with_header(headers::CONTENT_TYPE, "application/json")
                    .with_header(headers::ENDPOINT, endpoint)
                    .with_header(headers::ID, "7"),
            )
            .await
            .unwrap();
        let mut codec = RpcCodec::negotiating(server, CodecRegistry::new(), DEFAULT_CONTENT_TYPE).unwrap();
        let mut msg = Message::default();
        codec.read_header(&mut msg, MessageType::Request).await.unwrap();
        (client, Arc::new(tokio::sync::Mutex::new(codec)), msg)
    }

    async fn expect_one_reply(client: &mut Box<dyn Socket>) -> TransportMessage {
        let reply = client.recv().await.unwrap();
        let extra = tokio::time::timeout(std::time::Duration::from_millis(50), client.recv()).await;
        assert!(!matches!(extra, Ok(Ok(_))), "more than one reply envelope");
        reply
    }

    #[test]
    fn test_handle_errors() {
        let router = router();
        let dup = Handler::new(Echo)
            .unary("Double", |_e: Arc<Echo>, _ctx: Context, p: Ping| async move { Ok(p.n) })
            .build();
        assert_eq!(router.handle(dup), Err(HandleError::AlreadyDefined("Echo".into())));
        assert_eq!(
            router.handle(Handler::new(Echo).named("Empty").build()),
            Err(HandleError::NoMethods("Empty".into()))
        );
        assert_eq!(
            router.handle(Handler::new(Echo).named("").build()),
            Err(HandleError::NoName)
        );
        assert_eq!(
            router.endpoints(),
            vec!["Echo.Boom".to_string(), "Echo.Double".to_string(), "Echo.Fail".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stream_outcome_tracks_client_end() {
        let router = Router::new("test.server");
        router
            .handle(
                Handler::new(Echo)
                    .named("Streams")
                    .stream("Ignore", |_e: Arc<Echo>, _ctx: Context, _s: ServerStream| async move { Ok(()) })
                    .stream("Drain", |_e: Arc<Echo>, _ctx: Context, mut s: ServerStream| async move {
                        while s.recv::<u32>().await?.is_some() {}
                        Ok(())
                    })
                    .build(),
            )
            .unwrap();

        let (_client, codec, mut msg) = dispatch("Streams.Ignore", b"null").await;
        msg.header.insert(headers::STREAM.to_string(), "7".into());
        let outcome = router.serve_request(Context::background(), msg, codec).await.unwrap();
        assert_eq!(outcome, ServeOutcome::StreamPending);

        let (_client, codec, mut msg) = dispatch("Streams.Missing", b"null").await;
        msg.header.insert(headers::STREAM.to_string(), "7".into());
        let outcome = router.serve_request(Context::background(), msg, codec).await.unwrap();
        assert_eq!(outcome, ServeOutcome::StreamPending);

        let (mut client, codec, mut msg) = dispatch("Streams.Drain", b"null").await;
        msg.header.insert(headers::STREAM.to_string(), "7".into());
        client
            .send(
                &TransportMessage::default()
                    .with_header(headers::CONTENT_TYPE, "application/json")
                    .with_header(headers::ID, "7")
                    .with_header(headers::ERROR, END_OF_STREAM),
            )
            .await
            .unwrap();
        let outcome = router.serve_request(Context::background(), msg, codec).await.unwrap();
        assert_eq!(outcome, ServeOutcome::Completed);
    }

    #[tokio::test]
    async fn test_unary_success_single_reply() {
        let router = router();
        let (mut client, codec, msg) = dispatch("Echo.Double", br#"{"n":21}"#).await;
        let outcome = router.serve_request(Context::background(), msg, codec).await.unwrap();
        assert_eq!(outcome, ServeOutcome::Completed);
        let reply = expect_one_reply(&mut client).await;
        assert_eq!(&reply.body[..], b"42");
        assert_eq!(reply.header(headers::ID), Some("7"));
        assert!(reply.header(headers::ERROR).is_none());
    }

    #[tokio::test]
    async fn test_handler_error_single_reply() {
        let router = router();
        let (mut client, codec, msg) = dispatch("Echo.Fail", br#"{"n":1}"#).await;
        router.serve_request(Context::background(), msg, codec).await.unwrap();
        let reply = expect_one_reply(&mut client).await;
        let status = Status::parse(reply.header(headers::ERROR).unwrap());
        assert_eq!(status.code, 99);
        assert_eq!(status.id, "1");
        assert_eq!(status.detail, "custom failure");
    }

    #[tokio::test]
    async fn test_unknown_and_ill_formed() {
        let router = router();
        for (endpoint, code) in [("Echo.Nope", 404), ("Nobody.Call", 404), ("NoDot", 400)] {
            let (mut client, codec, msg) = dispatch(endpoint, b"{}").await;
            router.serve_request(Context::background(), msg, codec).await.unwrap();
            let reply = expect_one_reply(&mut client).await;
            let status = Status::parse(reply.header(headers::ERROR).unwrap());
            assert_eq!(status.code, code, "{}", endpoint);
        }
    }

    #[tokio::test]
    async fn test_bad_body_is_bad_request() {
        let router = router();
        let (mut client, codec, msg) = dispatch("Echo.Double", b"not json").await;
        router.serve_request(Context::background(), msg, codec).await.unwrap();
        let reply = expect_one_reply(&mut client).await;
        assert_eq!(Status::parse(reply.header(headers::ERROR).unwrap()).code, 400);
    }

    #[tokio::test]
    async fn test_panic_isolated() {
        let router = router();
        let (mut client, codec, msg) = dispatch("Echo.Boom", br#"{"n":1}"#).await;
        let outcome = router.serve_request(Context::background(), msg, codec).await.unwrap();
        assert_eq!(outcome, ServeOutcome::Panicked);
        let reply = expect_one_reply(&mut client).await;
        let status = Status::parse(reply.header(headers::ERROR).unwrap());
        assert_eq!(status.code, 500);
        assert!(status.detail.contains("boom"));
    }

    #[tokio::test]
    async fn test_handler_wrappers_see_request() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let wrapper: HandlerWrapper = {
            let seen = Arc::clone(&seen);
            Arc::new(move |next: HandlerFunc| -> HandlerFunc {
                let seen = Arc::clone(&seen);
                Arc::new(move |ctx: Context, req: ServerRequest| {
                    seen.lock().push((req.endpoint(), req.arg::<Ping>().map(|p| p.n)));
                    next(ctx, req)
                })
            })
        };
        let router = Router::new("test.server").with_handler_wrappers(vec![wrapper]);
        router
            .handle(
                Handler::new(Echo)
                    .unary("Double", |_e: Arc<Echo>, _ctx: Context, p: Ping| async move { Ok(p.n * 2) })
                    .build(),
            )
            .unwrap();
        let (_client, codec, msg) = dispatch("Echo.Double", br#"{"n":3}"#).await;
        router.serve_request(Context::background(), msg, codec).await.unwrap();
        assert_eq!(seen.lock().as_slice(), &[("Echo.Double".to_string(), Some(3))]);
    }

    #[tokio::test]
    async fn test_process_message_aggregates_failures() {
        let router = Router::new("test.server");
        router
            .subscribe(Subscriber::new("jobs", |_ctx: Context, _p: Ping| async { Ok(()) }))
            .unwrap();
        router
            .subscribe(Subscriber::new("jobs", |_ctx: Context, p: Ping| async move {
                Err(RpcError::Internal(format!("job {} rejected", p.n)))
            }))
            .unwrap();
        router
            .subscribe(Subscriber::new("jobs", |_ctx: Context, _p: Ping| async {
                if true {
                    panic!("subscriber exploded");
                }
                Ok(())
            }))
            .unwrap();
        assert_eq!(router.topics(), vec!["jobs".to_string()]);

        let msg = BrokerMessage {
            header: HashMap::from([(headers::CONTENT_TYPE.to_string(), "application/json".to_string())]),
            body: Bytes::from_static(br#"{"n":5}"#),
        };
        let err = router
            .process_message(Context::background(), "jobs", msg)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("job 5 rejected"));
        assert!(text.contains("subscriber exploded"));
    }
}
