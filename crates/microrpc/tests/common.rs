//! Shared fixtures: a greeter service over the in-memory transport.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use microrpc::transport::MemoryTransport;
use microrpc::{
    Client, ClientOptions, Context, Handler, MemoryBroker, MemoryRegistry, RpcError, Server,
    ServerOptions, ServerStream, Status,
};

pub const SERVICE: &str = "greeter";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub msg: String,
}

#[derive(Default)]
pub struct Greeter {
    pub calls: AtomicUsize,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn echo(_g: Arc<Greeter>, _ctx: Context, mut stream: ServerStream) -> microrpc::Result<()> {
    while let Some(line) = stream.recv::<String>().await? {
        stream.send(&line).await?;
    }
    Ok(())
}

async fn count(_g: Arc<Greeter>, _ctx: Context, mut stream: ServerStream) -> microrpc::Result<()> {
    let upto: u32 = stream.request_body().await?;
    for i in 0..upto {
        stream.send(&i).await?;
    }
    Ok(())
}

pub fn greeter_handler(greeter: Greeter) -> Handler {
    Handler::new(greeter)
        .unary("SayHello", |g: Arc<Greeter>, _ctx: Context, req: HelloRequest| async move {
            g.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HelloResponse {
                msg: format!("Hello {}", req.name),
            })
        })
        .unary("Fail", |g: Arc<Greeter>, _ctx: Context, _req: HelloRequest| async move {
            g.calls.fetch_add(1, Ordering::SeqCst);
            Err::<HelloResponse, _>(RpcError::from(Status::new("1", "custom failure", 99)))
        })
        .unary("Unavailable", |g: Arc<Greeter>, _ctx: Context, _req: HelloRequest| async move {
            g.calls.fetch_add(1, Ordering::SeqCst);
            Err::<HelloResponse, _>(RpcError::from(Status::unavailable(SERVICE, "try later")))
        })
        .unary("Panic", |_g: Arc<Greeter>, _ctx: Context, req: HelloRequest| async move {
            if !req.name.is_empty() {
                panic!("greeter exploded for {}", req.name);
            }
            Ok(HelloResponse { msg: String::new() })
        })
        .unary("Slow", |_g: Arc<Greeter>, _ctx: Context, millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(millis)
        })
        .unary("Metadata", |_g: Arc<Greeter>, ctx: Context, key: String| async move {
            Ok(ctx.metadata().get(&key).cloned())
        })
        .unary("Reverse", |_g: Arc<Greeter>, _ctx: Context, mut raw: Vec<u8>| async move {
            raw.reverse();
            Ok(raw)
        })
        .stream("Echo", echo)
        .stream("Count", count)
        // Answers the first message and returns without reading the rest.
        .stream("First", |_g: Arc<Greeter>, _ctx: Context, mut stream: ServerStream| async move {
            if let Some(first) = stream.recv::<String>().await? {
                stream.send(&first).await?;
            }
            Ok(())
        })
        .stream("Broken", |_g: Arc<Greeter>, _ctx: Context, mut stream: ServerStream| async move {
            stream.send(&"partial".to_string()).await?;
            Err(RpcError::from(Status::new(SERVICE, "stream broke", 500)))
        })
        .build()
}

/// A started greeter server plus the collaborators a client needs.
pub struct Harness {
    pub transport: MemoryTransport,
    pub registry: Arc<MemoryRegistry>,
    pub broker: Arc<MemoryBroker>,
    pub server: Server,
    pub address: String,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(|opts| opts, |_| {}).await
    }

    /// Starts a server after letting the caller adjust options and add handlers.
    pub async fn start_with(
        configure: impl FnOnce(ServerOptions) -> ServerOptions,
        install: impl FnOnce(&Server),
    ) -> Self {
        init_tracing();
        let transport = MemoryTransport::new();
        let registry = Arc::new(MemoryRegistry::new());
        let broker = Arc::new(MemoryBroker::new());
        let opts = ServerOptions::default()
            .name(SERVICE)
            .address("greeter.local:0")
            .transport(Arc::new(transport.clone()))
            .registry(registry.clone())
            .broker(broker.clone());
        let server = Server::new(configure(opts));
        server.handle(greeter_handler(Greeter::default())).unwrap();
        install(&server);
        let address = server.start().await.unwrap();
        Self {
            transport,
            registry,
            broker,
            server,
            address,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::default()
            .transport(Arc::new(self.transport.clone()))
            .registry(self.registry.clone())
            .broker(self.broker.clone())
    }

    pub fn client(&self) -> Client {
        Client::new(self.client_options())
    }

    pub async fn stop(self) {
        self.server.stop().await.unwrap();
    }
}
