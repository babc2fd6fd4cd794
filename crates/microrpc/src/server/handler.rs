//! Handler registration.
//!
//! A handler is a receiver plus a table of methods. Each method is classified
//! when it is added: unary methods take a decoded request and return a reply,
//! streaming methods drive a [`ServerStream`]. Methods whose name or types are
//! not exported are skipped with a warning.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use microrpc_codec::BodyFormat;

use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::server::stream::ServerStream;

/// Decodes a request body into a freshly allocated argument.
pub type DecodeFn =
    Arc<dyn Fn(BodyFormat, &[u8]) -> microrpc_codec::Result<Box<dyn Any + Send>> + Send + Sync>;

/// Dispatches one request, returning the encoded reply (empty for streams).
pub type HandlerFunc =
    Arc<dyn Fn(Context, ServerRequest) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// Decorates a [`HandlerFunc`].
pub type HandlerWrapper = Arc<dyn Fn(HandlerFunc) -> HandlerFunc + Send + Sync>;

/// How a method is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    Streaming,
}

/// Outcome of checking a method before installing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Unary,
    Streaming,
    Invalid(String),
}

/// An installed method.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: MethodKind,
    pub arg_type: &'static str,
    pub reply_type: &'static str,
    pub(crate) decode: Option<DecodeFn>,
    pub(crate) invoke: HandlerFunc,
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .finish()
    }
}

/// A request as seen by handler wrappers.
pub struct ServerRequest {
    service: String,
    method: String,
    content_type: String,
    format: BodyFormat,
    header: HashMap<String, String>,
    arg: Option<Box<dyn Any + Send>>,
    stream: Option<ServerStream>,
}

impl ServerRequest {
    pub(crate) fn new(
        service: String,
        method: String,
        content_type: String,
        format: BodyFormat,
        header: HashMap<String, String>,
    ) -> Self {
        Self {
            service,
            method,
            content_type,
            format,
            header,
            arg: None,
            stream: None,
        }
    }

    pub(crate) fn with_arg(mut self, arg: Box<dyn Any + Send>) -> Self {
        self.arg = Some(arg);
        self
    }

    pub(crate) fn with_stream(mut self, stream: ServerStream) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// `Service.Method`.
    pub fn endpoint(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn format(&self) -> BodyFormat {
        self.format
    }

    pub fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    pub fn is_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// The decoded argument of a unary request, if it is a `T`.
    pub fn arg<T: 'static>(&self) -> Option<&T> {
        self.arg.as_ref().and_then(|a| a.downcast_ref::<T>())
    }

    fn take_arg<T: 'static>(&mut self) -> Option<T> {
        let arg = self.arg.take()?;
        match arg.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(other) => {
                self.arg = Some(other);
                None
            }
        }
    }
}

/// Whether a method name is exported (starts with an uppercase letter).
pub fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// Whether a type, given by its `type_name`, is exported or builtin.
pub fn is_exported_or_builtin(type_name: &str) -> bool {
    let base = type_name.split('<').next().unwrap_or(type_name);
    if !base.contains("::") {
        return true;
    }
    base.rsplit("::").next().is_some_and(is_exported)
}

/// Last path segment of a type name, without generics.
pub(crate) fn short_type_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Classifies a method from its name and argument/reply type names.
pub fn classify(method: &str, kind: MethodKind, arg_type: &str, reply_type: &str) -> Classification {
    if !is_exported(method) {
        return Classification::Invalid(format!("method {} is not exported", method));
    }
    if !is_exported_or_builtin(arg_type) {
        return Classification::Invalid(format!("argument type {} not exported", arg_type));
    }
    if !is_exported_or_builtin(reply_type) {
        return Classification::Invalid(format!("reply type {} not exported", reply_type));
    }
    match kind {
        MethodKind::Unary => Classification::Unary,
        MethodKind::Streaming => Classification::Streaming,
    }
}

/// A receiver with its installed methods, ready for [`crate::server::Server::handle`].
#[derive(Debug, Clone)]
pub struct Handler {
    name: String,
    methods: Vec<MethodDescriptor>,
    skipped: Vec<String>,
}

impl Handler {
    /// Starts building a handler named after `H`'s type.
    pub fn new<H: Send + Sync + 'static>(receiver: H) -> HandlerBuilder<H> {
        HandlerBuilder {
            name: short_type_name(std::any::type_name::<H>()).to_string(),
            receiver: Arc::new(receiver),
            methods: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Names of methods rejected during classification.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// `Name.Method` for every installed method.
    pub fn endpoints(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|m| format!("{}.{}", self.name, m.name))
            .collect()
    }
}

pub struct HandlerBuilder<H> {
    name: String,
    receiver: Arc<H>,
    methods: Vec<MethodDescriptor>,
    skipped: Vec<String>,
}

impl<H: Send + Sync + 'static> HandlerBuilder<H> {
    /// Overrides the service name derived from the receiver type.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn install(&mut self, descriptor: MethodDescriptor) {
        let classification = classify(
            &descriptor.name,
            descriptor.kind,
            descriptor.arg_type,
            descriptor.reply_type,
        );
        if let Classification::Invalid(reason) = classification {
            warn!(handler = self.name.as_str(), method = descriptor.name.as_str(), reason = reason.as_str(), "skipping method");
            self.skipped.push(descriptor.name);
            return;
        }
        if self.methods.iter().any(|m| m.name == descriptor.name) {
            warn!(handler = self.name.as_str(), method = descriptor.name.as_str(), "duplicate method skipped");
            self.skipped.push(descriptor.name);
            return;
        }
        self.methods.push(descriptor);
    }

    /// Adds a unary method: one decoded request in, one reply out.
    pub fn unary<Req, Rsp, F, Fut>(mut self, method: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Arc<H>, Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let receiver = Arc::clone(&self.receiver);
        let f = Arc::new(f);
        let decode: DecodeFn = Arc::new(
            |format: BodyFormat, data: &[u8]| -> microrpc_codec::Result<Box<dyn Any + Send>> {
                Ok(Box::new(format.decode::<Req>(data)?))
            },
        );
        let invoke: HandlerFunc = Arc::new(move |ctx: Context, mut req: ServerRequest| {
            let receiver = Arc::clone(&receiver);
            let f = Arc::clone(&f);
            async move {
                let arg = req.take_arg::<Req>().ok_or_else(|| {
                    RpcError::Internal(format!("{} called without a decoded argument", req.endpoint()))
                })?;
                let reply = f(receiver, ctx, arg).await?;
                Ok::<_, RpcError>(Bytes::from(req.format().encode(&reply)?))
            }
            .boxed()
        });
        self.install(MethodDescriptor {
            name: method.to_string(),
            kind: MethodKind::Unary,
            arg_type: std::any::type_name::<Req>(),
            reply_type: std::any::type_name::<Rsp>(),
            decode: Some(decode),
            invoke,
        });
        self
    }

    /// Adds a streaming method driven through a [`ServerStream`].
    pub fn stream<F, Fut>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(Arc<H>, Context, ServerStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let receiver = Arc::clone(&self.receiver);
        let f = Arc::new(f);
        let invoke: HandlerFunc = Arc::new(move |ctx: Context, mut req: ServerRequest| {
            let receiver = Arc::clone(&receiver);
            let f = Arc::clone(&f);
            async move {
                let stream = req.stream.take().ok_or_else(|| {
                    RpcError::Internal(format!("{} called without a stream", req.endpoint()))
                })?;
                f(receiver, ctx, stream).await?;
                Ok::<_, RpcError>(Bytes::new())
            }
            .boxed()
        });
        self.install(MethodDescriptor {
            name: method.to_string(),
            kind: MethodKind::Streaming,
            arg_type: std::any::type_name::<ServerStream>(),
            reply_type: std::any::type_name::<()>(),
            decode: None,
            invoke,
        });
        self
    }

    pub fn build(self) -> Handler {
        Handler {
            name: self.name,
            methods: self.methods,
            skipped: self.skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Request {
        name: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    #[allow(non_camel_case_types)]
    struct hidden {
        v: u32,
    }

    struct Greeter;

    async fn hello(_g: Arc<Greeter>, _ctx: Context, req: Request) -> Result<String> {
        Ok(format!("Hello {}", req.name))
    }

    #[test]
    fn test_name_from_type() {
        let handler = Handler::new(Greeter).build();
        assert_eq!(handler.name(), "Greeter");
        assert_eq!(Handler::new(Greeter).named("Other").build().name(), "Other");
    }

    #[test]
    fn test_exported_rules() {
        assert!(is_exported("Hello"));
        assert!(!is_exported("hello"));
        assert!(!is_exported(""));
        assert!(is_exported_or_builtin("u32"));
        assert!(is_exported_or_builtin("()"));
        assert!(is_exported_or_builtin("alloc::string::String"));
        assert!(is_exported_or_builtin("alloc::vec::Vec<u8>"));
        assert!(!is_exported_or_builtin("app::types::hidden"));
    }

    #[test]
    fn test_invalid_methods_skipped() {
        let handler = Handler::new(Greeter)
            .unary("Hello", hello)
            .unary("lower", hello)
            .unary("Hidden", |_g: Arc<Greeter>, _ctx: Context, h: hidden| async move { Ok(h.v) })
            .unary("Hello", hello)
            .build();
        assert_eq!(handler.endpoints(), vec!["Greeter.Hello".to_string()]);
        assert_eq!(handler.skipped(), &["lower", "Hidden", "Hello"]);
        assert_eq!(handler.method("Hello").map(|m| m.kind), Some(MethodKind::Unary));
    }

    #[tokio::test]
    async fn test_unary_invoke() {
        let handler = Handler::new(Greeter).unary("Hello", hello).build();
        let method = handler.method("Hello").unwrap();
        let body = BodyFormat::Json.encode(&Request { name: "John".into() }).unwrap();
        let decode = method.decode.as_ref().unwrap();
        let arg = decode(BodyFormat::Json, &body).unwrap();
        let req = ServerRequest::new(
            "Greeter".into(),
            "Hello".into(),
            "application/json".into(),
            BodyFormat::Json,
            HashMap::new(),
        )
        .with_arg(arg);
        assert_eq!(req.arg::<Request>().map(|r| r.name.as_str()), Some("John"));
        let reply = (method.invoke)(Context::background(), req).await.unwrap();
        let text: String = BodyFormat::Json.decode(&reply).unwrap();
        assert_eq!(text, "Hello John");
    }
}
