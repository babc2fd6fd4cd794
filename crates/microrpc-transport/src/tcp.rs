//! TCP transport implementation

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{Result, TransportError};
use crate::message::TransportMessage;
use crate::protocol::{decode_payload, encode_frame, FrameHeader, FRAME_HEADER_SIZE};
use crate::transport::{DialOptions, Listener, Socket, Transport};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

/// TCP transport: length-prefixed frames over tokio sockets
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>> {
        let stream = tokio::time::timeout(opts.timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: opts.timeout.as_millis() as u64,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                },
                _ => TransportError::from(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = addr, stream = opts.stream, "TCP connected");
        Ok(Box::new(TcpSocket::from_stream(stream)))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::AddrInUse => TransportError::AddressInUse {
                    addr: addr.to_string(),
                },
                _ => TransportError::from(e),
            }
        })?;
        let bound = listener.local_addr()?.to_string();
        tracing::debug!(addr = bound.as_str(), "TCP listening");
        Ok(Box::new(TcpListener {
            inner: Some(listener),
            addr: bound,
            nodelay: self.config.nodelay,
        }))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// A single framed TCP connection
pub struct TcpSocket {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    local: String,
    remote: String,
    closed: bool,
}

impl TcpSocket {
    pub(crate) fn from_stream(stream: tokio::net::TcpStream) -> Self {
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Self {
            read,
            write,
            local,
            remote,
            closed: false,
        }
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&mut self, msg: &TransportMessage) -> Result<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = encode_frame(msg)?;
        self.write.write_all(&frame).await?;
        self.write.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<TransportMessage> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        self.read.read_exact(&mut header_buf).await?;
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            self.read.read_exact(&mut payload).await?;
        }
        decode_payload(&header, &payload)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Peer may already be gone; shutdown failure changes nothing for us.
        let _ = self.write.shutdown().await;
        Ok(())
    }

    fn local(&self) -> &str {
        &self.local
    }

    fn remote(&self) -> &str {
        &self.remote
    }
}

/// Accept side of the TCP transport
pub struct TcpListener {
    inner: Option<tokio::net::TcpListener>,
    addr: String,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> Result<Box<dyn Socket>> {
        let listener = self.inner.as_ref().ok_or(TransportError::ListenerClosed)?;
        let (stream, _) = listener.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(Box::new(TcpSocket::from_stream(stream)))
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn close(&mut self) -> Result<()> {
        self.inner = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_recv_message() {
        let transport = TcpTransport::default();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr().to_string();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let msg = conn.recv().await.unwrap();
            assert_eq!(msg.header("Micro-Endpoint"), Some("Greeter.Hello"));
            let reply = TransportMessage::new(&b"pong"[..]).with_header("Micro-Id", "1");
            conn.send(&reply).await.unwrap();
        });

        let mut conn = transport
            .dial(&addr, DialOptions::default())
            .await
            .unwrap();
        let msg = TransportMessage::new(&b"ping"[..]).with_header("Micro-Endpoint", "Greeter.Hello");
        conn.send(&msg).await.unwrap();
        let reply = conn.recv().await.unwrap();
        assert_eq!(&reply.body[..], b"pong");
        assert_eq!(reply.header("Micro-Id"), Some("1"));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_closed() {
        let transport = TcpTransport::default();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr().to_string();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            conn.close().await.unwrap();
        });

        let opts = DialOptions {
            timeout: Duration::from_secs(1),
            stream: false,
        };
        let mut conn = transport.dial(&addr, opts).await.unwrap();
        server.await.unwrap();
        assert!(matches!(
            conn.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let transport = TcpTransport::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = transport.dial(&addr, DialOptions::default()).await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn test_closed_listener_rejects_accept() {
        let transport = TcpTransport::default();
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        listener.close().await.unwrap();
        assert!(matches!(
            listener.accept().await.err().unwrap(),
            TransportError::ListenerClosed
        ));
    }
}
