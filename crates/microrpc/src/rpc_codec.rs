//! Binds a codec to a socket: one envelope per transport message.
//!
//! Writing stamps the routing headers (`Content-Type`, `Micro-Id`,
//! `Micro-Service`, `Micro-Endpoint`, `Micro-Error`) onto the transport
//! message next to whatever the codec produced. Reading lets the codec parse
//! first and fills any field it left empty from those headers, so an error
//! carried in the body always wins over `Micro-Error`.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::trace;

use microrpc_codec::{headers, BodyFormat, Codec, CodecError, CodecRegistry, Message, MessageType};
use microrpc_transport::{Socket, TransportMessage};

use crate::error::{Result, RpcError};

/// A socket plus the codec speaking over it.
pub struct RpcCodec<S: Socket> {
    socket: S,
    codec: Box<dyn Codec>,
    content_type: String,
    header: HashMap<String, String>,
    negotiate: Option<CodecRegistry>,
}

impl<S: Socket> RpcCodec<S> {
    /// Client side: a fixed codec for a known content type.
    pub fn new(socket: S, codec: Box<dyn Codec>, content_type: impl Into<String>) -> Self {
        Self {
            socket,
            codec,
            content_type: content_type.into(),
            header: HashMap::new(),
            negotiate: None,
        }
    }

    /// Server side: the codec follows each inbound message's `Content-Type`.
    pub fn negotiating(socket: S, codecs: CodecRegistry, default_content_type: &str) -> Result<Self> {
        let codec = codecs.new_codec(default_content_type)?;
        Ok(Self {
            socket,
            codec,
            content_type: default_content_type.to_string(),
            header: HashMap::new(),
            negotiate: Some(codecs),
        })
    }

    /// Headers stamped onto every outgoing message, beneath per-message ones.
    pub fn with_header(mut self, header: HashMap<String, String>) -> Self {
        self.header = header;
        self
    }

    /// Content type of the active codec.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Body format of the active codec.
    pub fn format(&self) -> BodyFormat {
        self.codec.format()
    }

    /// Local socket address.
    pub fn local(&self) -> &str {
        self.socket.local()
    }

    /// Remote socket address.
    pub fn remote(&self) -> &str {
        self.socket.remote()
    }

    /// Encodes and sends one envelope.
    pub async fn write(&mut self, msg: &mut Message, body: Option<&[u8]>) -> Result<()> {
        self.codec.buffer().take_written();
        msg.header
            .entry(headers::CONTENT_TYPE.to_string())
            .or_insert_with(|| self.content_type.clone());
        self.codec.write(msg, body)?;
        let encoded = self.codec.buffer().take_written();

        let mut header = self.header.clone();
        header.extend(msg.header.iter().map(|(k, v)| (k.clone(), v.clone())));
        header.insert(headers::CONTENT_TYPE.to_string(), self.content_type.clone());
        header.insert(headers::ID.to_string(), msg.id.clone());
        if !msg.target.is_empty() {
            header.insert(headers::SERVICE.to_string(), msg.target.clone());
        }
        if !msg.endpoint.is_empty() {
            header.insert(headers::ENDPOINT.to_string(), msg.endpoint.clone());
        }
        if !msg.error.is_empty() {
            header.insert(headers::ERROR.to_string(), msg.error.clone());
        }

        trace!(
            id = msg.id.as_str(),
            endpoint = msg.endpoint.as_str(),
            kind = %msg.message_type,
            bytes = encoded.len(),
            "writing envelope"
        );
        self.socket
            .send(&TransportMessage {
                header,
                body: encoded,
            })
            .await?;
        Ok(())
    }

    /// Receives one envelope and parses its header. Transport failures come
    /// back as [`RpcError::Transport`], codec failures as [`RpcError::Codec`].
    pub async fn read_header(&mut self, msg: &mut Message, message_type: MessageType) -> Result<()> {
        let tm = self.socket.recv().await?;
        self.select_codec(tm.header.get(headers::CONTENT_TYPE).map(String::as_str))?;

        self.codec.buffer().reset_read(&tm.body);
        msg.message_type = message_type;
        msg.header = tm.header;
        let parsed = self.codec.read_header(msg, message_type);

        if msg.error.is_empty() {
            if let Some(e) = msg.header.get(headers::ERROR) {
                msg.error = e.clone();
            }
        }
        if msg.id.is_empty() {
            if let Some(id) = msg.header.get(headers::ID) {
                msg.id = id.clone();
            }
        }
        if msg.endpoint.is_empty() {
            if let Some(ep) = msg.header.get(headers::ENDPOINT) {
                msg.endpoint = ep.clone();
            }
        }
        if msg.target.is_empty() {
            if let Some(svc) = msg.header.get(headers::SERVICE) {
                msg.target = svc.clone();
            }
        }
        parsed.map_err(RpcError::from)
    }

    /// Returns the encoded body of the envelope just read.
    pub fn read_body(&mut self) -> Result<Bytes> {
        Ok(self.codec.read_body()?)
    }

    /// Sends a plain-text error outside any codec, for peers whose content
    /// type could not be served.
    pub async fn write_plain_error(&mut self, text: &str) -> Result<()> {
        let msg = TransportMessage::new(Bytes::copy_from_slice(text.as_bytes()))
            .with_header(headers::CONTENT_TYPE, "text/plain")
            .with_header(headers::ERROR, text);
        self.socket.send(&msg).await?;
        Ok(())
    }

    /// Closes codec and socket.
    pub async fn close(&mut self) -> Result<()> {
        let codec = self.codec.close();
        self.socket.close().await?;
        Ok(codec?)
    }

    /// Releases the socket, dropping the codec.
    pub fn into_socket(self) -> S {
        self.socket
    }

    fn select_codec(&mut self, content_type: Option<&str>) -> Result<()> {
        let Some(codecs) = &self.negotiate else {
            return Ok(());
        };
        let Some(ct) = content_type else {
            return Ok(());
        };
        if ct == self.content_type {
            return Ok(());
        }
        let codec = codecs
            .new_codec(ct)
            .map_err(|_| CodecError::UnsupportedContentType(ct.to_string()))?;
        trace!(from = self.content_type.as_str(), to = ct, "switching codec");
        self.codec = codec;
        self.content_type = ct.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microrpc_transport::{DialOptions, Listener, MemoryTransport, Transport};

    async fn pair() -> (Box<dyn Socket>, Box<dyn Socket>) {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("codec:0").await.unwrap();
        let client = transport
            .dial(listener.addr(), DialOptions::default())
            .await
            .unwrap();
        let server = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_headers_stamped_and_recovered() {
        let (client, server) = pair().await;
        let codecs = CodecRegistry::new();
        let mut tx = RpcCodec::new(client, codecs.new_codec("application/json").unwrap(), "application/json");
        let mut rx = RpcCodec::negotiating(server, codecs, "application/bincode").unwrap();

        let mut msg = Message {
            id: "5".into(),
            target: "greeter".into(),
            endpoint: "Greeter.Hello".into(),
            ..Message::new(MessageType::Request)
        };
        tx.write(&mut msg, Some(br#"{"name":"John"}"#)).await.unwrap();

        let mut got = Message::default();
        rx.read_header(&mut got, MessageType::Request).await.unwrap();
        assert_eq!(rx.content_type(), "application/json");
        assert_eq!(got.id, "5");
        assert_eq!(got.target, "greeter");
        assert_eq!(got.endpoint, "Greeter.Hello");
        assert_eq!(&rx.read_body().unwrap()[..], br#"{"name":"John"}"#);
    }

    #[tokio::test]
    async fn test_body_error_wins_over_header() {
        let (client, mut server) = pair().await;
        let codecs = CodecRegistry::new();
        let mut rx = RpcCodec::new(client, codecs.new_codec("application/json-rpc").unwrap(), "application/json-rpc");

        let body = br#"{"id":1,"result":null,"error":"from body"}"#.to_vec();
        let tm = TransportMessage::new(body)
            .with_header(headers::CONTENT_TYPE, "application/json-rpc")
            .with_header(headers::ERROR, "from header");
        server.send(&tm).await.unwrap();

        let mut got = Message::default();
        rx.read_header(&mut got, MessageType::Response).await.unwrap();
        assert_eq!(got.error, "from body");
    }

    #[tokio::test]
    async fn test_header_error_used_when_body_silent() {
        let (client, mut server) = pair().await;
        let codecs = CodecRegistry::new();
        let mut rx = RpcCodec::new(client, codecs.new_codec("application/bincode").unwrap(), "application/bincode");
        let tm = TransportMessage::default().with_header(headers::ERROR, "from header");
        server.send(&tm).await.unwrap();
        let mut got = Message::default();
        rx.read_header(&mut got, MessageType::Response).await.unwrap();
        assert_eq!(got.error, "from header");
    }

    #[tokio::test]
    async fn test_unknown_content_type_rejected() {
        let (mut client, server) = pair().await;
        let mut rx = RpcCodec::negotiating(server, CodecRegistry::new(), "application/bincode").unwrap();
        client
            .send(&TransportMessage::default().with_header(headers::CONTENT_TYPE, "text/x-nope"))
            .await
            .unwrap();
        let mut got = Message::default();
        let err = rx.read_header(&mut got, MessageType::Request).await.unwrap_err();
        assert!(matches!(err, RpcError::Codec(CodecError::UnsupportedContentType(_))));
    }
}
