//! Transport abstraction traits.
//!
//! A [`Transport`] dials and listens; a [`Socket`] is a bidirectional
//! channel of whole [`TransportMessage`]s. Sockets are owned by a single task
//! at a time, so their I/O methods take `&mut self`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::TransportMessage;

/// Default time allowed for establishing a connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for [`Transport::dial`].
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Upper bound on connection establishment.
    pub timeout: Duration,
    /// The connection will carry a long-lived stream rather than one call at a time.
    pub stream: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            stream: false,
        }
    }
}

/// A message-oriented, bidirectional connection.
#[async_trait]
pub trait Socket: Send {
    /// Sends one message.
    async fn send(&mut self, msg: &TransportMessage) -> Result<()>;

    /// Receives the next message. Returns `ConnectionClosed` once the peer is gone.
    async fn recv(&mut self) -> Result<TransportMessage>;

    /// Closes the socket. Later sends and receives fail.
    async fn close(&mut self) -> Result<()>;

    /// Local address.
    fn local(&self) -> &str;

    /// Remote address.
    fn remote(&self) -> &str;
}

#[async_trait]
impl<S: Socket + ?Sized> Socket for Box<S> {
    async fn send(&mut self, msg: &TransportMessage) -> Result<()> {
        (**self).send(msg).await
    }

    async fn recv(&mut self) -> Result<TransportMessage> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn local(&self) -> &str {
        (**self).local()
    }

    fn remote(&self) -> &str {
        (**self).remote()
    }
}

/// Accepts inbound sockets.
#[async_trait]
pub trait Listener: Send {
    /// Waits for the next inbound socket. Returns `ListenerClosed` after [`Listener::close`].
    async fn accept(&mut self) -> Result<Box<dyn Socket>>;

    /// The bound address, with any ephemeral port resolved.
    fn addr(&self) -> &str;

    /// Stops accepting and releases the address.
    async fn close(&mut self) -> Result<()>;
}

/// Creates outbound sockets and listeners.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connects to `addr`.
    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>>;

    /// Binds a listener on `addr`. A port of `0` picks a free one.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;

    /// Short transport name, advertised in node metadata.
    fn name(&self) -> &'static str;
}
