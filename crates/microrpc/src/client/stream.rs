//! Client side of a bidirectional stream.

use std::error::Error as StdError;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use microrpc_codec::{Message, MessageType, END_OF_STREAM};
use microrpc_transport::PoolConn;

use crate::client::{ClientInner, RpcRequest};
use crate::context::Context;
use crate::error::{Result, RpcError, Status};
use crate::rpc_codec::RpcCodec;

/// An open stream. Any error other than a clean end of stream is sticky:
/// once set, every later `send` or `recv` returns it.
pub struct ClientStream {
    id: String,
    ctx: Context,
    request: Arc<RpcRequest>,
    address: String,
    codec: Option<RpcCodec<PoolConn>>,
    client: Arc<ClientInner>,
    err: Option<RpcError>,
    remote_done: bool,
    closed: bool,
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("id", &self.id)
            .field("endpoint", &self.request.endpoint)
            .field("address", &self.address)
            .field("err", &self.err)
            .field("remote_done", &self.remote_done)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ClientStream {
    pub(crate) fn new(
        id: String,
        ctx: Context,
        request: Arc<RpcRequest>,
        address: String,
        codec: RpcCodec<PoolConn>,
        client: Arc<ClientInner>,
    ) -> Self {
        Self {
            id,
            ctx,
            request,
            address,
            codec: Some(codec),
            client,
            err: None,
            remote_done: false,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn request(&self) -> &RpcRequest {
        &self.request
    }

    /// The sticky error, if the stream has failed.
    pub fn error(&self) -> Option<&RpcError> {
        self.err.as_ref()
    }

    /// Sends one message to the server.
    pub async fn send<T: Serialize + 'static>(&mut self, msg: &T) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let codec = match self.codec.as_mut() {
            Some(codec) if !self.closed => codec,
            _ => return Err(RpcError::Internal("stream is closed".into())),
        };
        let body = codec.format().encode(msg)?;
        let mut envelope = Message {
            id: self.id.clone(),
            target: self.request.service.clone(),
            endpoint: self.request.endpoint.clone(),
            ..Message::new(MessageType::Request)
        };
        if let Err(e) = codec.write(&mut envelope, Some(&body)).await {
            self.err = Some(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Receives the next message. `Ok(None)` means the server ended the
    /// stream cleanly.
    pub async fn recv<T: DeserializeOwned + 'static>(&mut self) -> Result<Option<T>> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.remote_done {
            return Ok(None);
        }
        let codec = match self.codec.as_mut() {
            Some(codec) if !self.closed => codec,
            _ => return Err(RpcError::Internal("stream is closed".into())),
        };

        let mut msg = Message::default();
        let received = match codec.read_header(&mut msg, MessageType::Response).await {
            Err(e) => Err(e),
            Ok(()) if msg.is_end_of_stream() => {
                self.remote_done = true;
                return Ok(None);
            }
            Ok(()) if !msg.error.is_empty() => {
                Err(RpcError::Application(Status::parse(&msg.error)))
            }
            Ok(()) => codec
                .read_body()
                .and_then(|body| Ok(codec.format().decode(&body)?)),
        };
        match received {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                debug!(id = self.id.as_str(), error = %e, "stream failed");
                self.err = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Ends the stream by sending the server an end-of-stream marker.
    /// The connection returns to the pool only when the server already ended
    /// the stream cleanly and the marker was delivered; otherwise it is
    /// discarded. Closing twice is a no-op.
    ///
    /// Dropping an open stream closes it in the background, always
    /// discarding the connection.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let Some(mut codec) = self.codec.take() else {
            return Ok(());
        };

        let mut eos = self.end_of_stream();
        let reason = match codec.write(&mut eos, None).await {
            Err(e) => {
                debug!(id = self.id.as_str(), error = %e, "end of stream not delivered");
                Some(e)
            }
            Ok(()) => match &self.err {
                Some(err) => Some(err.clone()),
                None if self.remote_done => None,
                None => Some(RpcError::Internal(
                    "stream closed before the server finished".into(),
                )),
            },
        };
        self.client
            .pool
            .release(
                &self.address,
                codec.into_socket(),
                reason.as_ref().map(|e| e as &(dyn StdError + Send + Sync)),
            )
            .await;
        Ok(())
    }

    fn end_of_stream(&self) -> Message {
        Message {
            id: self.id.clone(),
            target: self.request.service.clone(),
            endpoint: self.request.endpoint.clone(),
            error: END_OF_STREAM.to_string(),
            ..Message::new(MessageType::Error)
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(mut codec) = self.codec.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut eos = self.end_of_stream();
        let client = Arc::clone(&self.client);
        let address = self.address.clone();
        let id = self.id.clone();
        runtime.spawn(async move {
            if let Err(e) = codec.write(&mut eos, None).await {
                debug!(id = id.as_str(), error = %e, "end of stream not delivered");
            }
            let reason = RpcError::Internal("stream dropped without close".into());
            client
                .pool
                .release(&address, codec.into_socket(), Some(&reason))
                .await;
        });
    }
}
