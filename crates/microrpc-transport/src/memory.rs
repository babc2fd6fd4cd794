//! In-process transport backed by tokio channels.
//!
//! Clients and servers must share the same [`MemoryTransport`] (it is cheap
//! to clone). Listening on a `host:0` address allocates a unique port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::message::TransportMessage;
use crate::transport::{DialOptions, Listener, Socket, Transport};

const ACCEPT_BACKLOG: usize = 128;
const FIRST_EPHEMERAL_PORT: u16 = 10_000;

#[derive(Default)]
struct Inner {
    listeners: Mutex<HashMap<String, mpsc::Sender<MemorySocket>>>,
    next_port: AtomicU16,
}

/// A transport whose sockets are pairs of in-memory channels.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    /// Creates an isolated in-memory network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn resolve(&self, addr: &str) -> String {
        match addr.rsplit_once(':') {
            Some((host, "0")) => {
                let offset = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
                format!("{}:{}", host, FIRST_EPHEMERAL_PORT.wrapping_add(offset))
            }
            _ => addr.to_string(),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>> {
        let accept_tx = self
            .inner
            .listeners
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused {
                addr: addr.to_string(),
            })?;

        let offset = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let local = format!("memory:{}", FIRST_EPHEMERAL_PORT.wrapping_add(offset));
        let (client, server) = MemorySocket::pair(local, addr.to_string());

        tokio::time::timeout(opts.timeout, accept_tx.send(server))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: opts.timeout.as_millis() as u64,
            })?
            .map_err(|_| TransportError::ConnectionRefused {
                addr: addr.to_string(),
            })?;
        debug!(addr = addr, local = client.local.as_str(), "memory socket dialled");
        Ok(Box::new(client))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let addr = self.resolve(addr);
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        {
            let mut listeners = self.inner.listeners.lock();
            if listeners.contains_key(&addr) {
                return Err(TransportError::AddressInUse { addr });
            }
            listeners.insert(addr.clone(), tx);
        }
        debug!(addr = addr.as_str(), "memory listener bound");
        Ok(Box::new(MemoryListener {
            addr,
            rx,
            inner: Arc::clone(&self.inner),
            closed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One end of an in-memory connection.
pub struct MemorySocket {
    local: String,
    remote: String,
    tx: Option<mpsc::UnboundedSender<TransportMessage>>,
    rx: mpsc::UnboundedReceiver<TransportMessage>,
}

impl MemorySocket {
    fn pair(client_addr: String, server_addr: String) -> (Self, Self) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let client = Self {
            local: client_addr.clone(),
            remote: server_addr.clone(),
            tx: Some(to_server),
            rx: from_server,
        };
        let server = Self {
            local: server_addr,
            remote: client_addr,
            tx: Some(to_client),
            rx: from_client,
        };
        (client, server)
    }
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&mut self, msg: &TransportMessage) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(msg.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<TransportMessage> {
        if self.tx.is_none() {
            return Err(TransportError::ConnectionClosed);
        }
        self.rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn local(&self) -> &str {
        &self.local
    }

    fn remote(&self) -> &str {
        &self.remote
    }
}

/// Accept side of the in-memory transport.
pub struct MemoryListener {
    addr: String,
    rx: mpsc::Receiver<MemorySocket>,
    inner: Arc<Inner>,
    closed: bool,
}

impl MemoryListener {
    fn unregister(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.listeners.lock().remove(&self.addr);
            self.rx.close();
        }
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Box<dyn Socket>> {
        match self.rx.recv().await {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(TransportError::ListenerClosed),
        }
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn close(&mut self) -> Result<()> {
        self.unregister();
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_without_listener_refused() {
        let transport = MemoryTransport::new();
        let err = transport
            .dial("svc:1", DialOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn test_send_recv_both_ways() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("svc:0").await.unwrap();
        let addr = listener.addr().to_string();
        assert!(addr.starts_with("svc:"));

        let mut client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.local(), addr);
        assert_eq!(server.remote(), client.local());

        client
            .send(&TransportMessage::new(&b"ping"[..]))
            .await
            .unwrap();
        let got = server.recv().await.unwrap();
        assert_eq!(&got.body[..], b"ping");

        server
            .send(&TransportMessage::new(&b"pong"[..]))
            .await
            .unwrap();
        assert_eq!(&client.recv().await.unwrap().body[..], b"pong");
    }

    #[tokio::test]
    async fn test_close_seen_by_peer() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("svc:0").await.unwrap();
        let addr = listener.addr().to_string();
        let mut client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.close().await.unwrap();
        assert!(matches!(
            server.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            client.send(&TransportMessage::default()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_address_in_use_and_release() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("svc:9").await.unwrap();
        assert!(matches!(
            transport.listen("svc:9").await.err().unwrap(),
            TransportError::AddressInUse { .. }
        ));
        listener.close().await.unwrap();
        assert!(matches!(
            listener.accept().await.err().unwrap(),
            TransportError::ListenerClosed
        ));
        assert_eq!(transport.listener_count(), 0);
        assert!(transport.listen("svc:9").await.is_ok());
    }
}
