//! Server side of a bidirectional stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use microrpc_codec::{Message, MessageType};
use microrpc_transport::Socket;

use crate::context::Context;
use crate::error::{Result, RpcError, Status};
use crate::rpc_codec::RpcCodec;

/// A connection's codec, shared between the serving loop and an open stream.
pub type SharedCodec = Arc<Mutex<RpcCodec<Box<dyn Socket>>>>;

/// A stream handed to a streaming handler. The peer closing the stream, or
/// the connection going away, is a clean end rather than an error.
pub struct ServerStream {
    id: String,
    service: String,
    endpoint: String,
    ctx: Context,
    codec: SharedCodec,
    request_body: Bytes,
    err: Option<RpcError>,
    remote_done: Arc<AtomicBool>,
    closed: bool,
}

impl ServerStream {
    pub(crate) fn new(
        ctx: Context,
        msg: &Message,
        request_body: Bytes,
        codec: SharedCodec,
    ) -> Self {
        Self {
            id: msg.id.clone(),
            service: msg.target.clone(),
            endpoint: msg.endpoint.clone(),
            ctx,
            codec,
            request_body,
            err: None,
            remote_done: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }

    /// Set once the client's end of the stream has been read.
    pub(crate) fn client_finished(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.remote_done)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.err.as_ref()
    }

    /// Decodes the payload that came with the stream's opening envelope.
    pub async fn request_body<T: DeserializeOwned + 'static>(&self) -> Result<T> {
        let format = self.codec.lock().await.format();
        Ok(format.decode(&self.request_body)?)
    }

    pub async fn send<T: Serialize + 'static>(&mut self, msg: &T) -> Result<()> {
        self.check_open()?;
        let mut codec = self.codec.lock().await;
        let body = codec.format().encode(msg)?;
        let mut envelope = Message {
            id: self.id.clone(),
            target: self.service.clone(),
            endpoint: self.endpoint.clone(),
            ..Message::new(MessageType::Response)
        };
        let written = codec.write(&mut envelope, Some(&body)).await;
        drop(codec);
        written.map_err(|e| self.fail(e))
    }

    /// Receives the next message; `Ok(None)` once the client is done.
    pub async fn recv<T: DeserializeOwned + 'static>(&mut self) -> Result<Option<T>> {
        if self.remote_done.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.check_open()?;
        let mut codec = self.codec.lock().await;
        let mut msg = Message::default();
        let received = match codec.read_header(&mut msg, MessageType::Request).await {
            Err(RpcError::Transport(e)) if e.is_closed() => Ok(None),
            Err(e) => Err(e),
            Ok(()) if msg.is_end_of_stream() => Ok(None),
            Ok(()) if !msg.error.is_empty() => {
                Err(RpcError::Application(Status::parse(&msg.error)))
            }
            Ok(()) => codec
                .read_body()
                .and_then(|body| Ok(codec.format().decode(&body)?))
                .map(Some),
        };
        drop(codec);
        match received {
            Ok(None) => {
                debug!(id = self.id.as_str(), "client finished stream");
                self.remote_done.store(true, Ordering::Release);
                Ok(None)
            }
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Marks the stream closed; the connection itself stays with the server.
    pub async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.closed {
            return Err(RpcError::Internal("stream is closed".into()));
        }
        Ok(())
    }

    fn fail(&mut self, err: RpcError) -> RpcError {
        self.err = Some(err.clone());
        err
    }
}
