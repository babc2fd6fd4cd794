//! microrpc: client call engine with selection, retries and pooled connections, a server dispatch router, bidirectional streams and broker events

pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod registry;
pub mod rpc_codec;
pub mod selector;
pub mod server;

pub use broker::{Broker, BrokerMessage, MemoryBroker};
pub use client::{CallOption, Client, ClientOptions, ClientStream, Publication, Request, RpcRequest};
pub use config::{ClientConfig, RpcConfig, ServerConfig};
pub use context::Context;
pub use error::{Result, RpcError, Status};
pub use registry::{MemoryRegistry, Node, Registry, Service};
pub use selector::{RegistrySelector, SelectOptions, Selector, Strategy};
pub use server::{Handler, Server, ServerOptions, ServerStream, Subscriber};

pub use microrpc_codec as codec;
pub use microrpc_transport as transport;
