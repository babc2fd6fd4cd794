//! Typed event subscribers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;

use microrpc_codec::BodyFormat;

use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::server::handler::{short_type_name, DecodeFn};

/// Delivers one decoded event.
pub type SubscriberFunc = Arc<dyn Fn(Context, Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Decorates a [`SubscriberFunc`].
pub type SubscriberWrapper = Arc<dyn Fn(SubscriberFunc) -> SubscriberFunc + Send + Sync>;

/// An event as seen by subscriber wrappers.
pub struct Event {
    topic: String,
    content_type: String,
    header: HashMap<String, String>,
    payload: Option<Box<dyn Any + Send>>,
}

impl Event {
    pub(crate) fn new(
        topic: String,
        content_type: String,
        header: HashMap<String, String>,
        payload: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            topic,
            content_type,
            header,
            payload: Some(payload),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    /// The decoded payload, if it is a `T`.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    fn take_payload<T: 'static>(&mut self) -> Option<T> {
        let payload = self.payload.take()?;
        match payload.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(other) => {
                self.payload = Some(other);
                None
            }
        }
    }
}

/// A topic subscription: a payload decoder and the function receiving it.
#[derive(Clone)]
pub struct Subscriber {
    topic: String,
    payload_type: &'static str,
    pub(crate) decode: DecodeFn,
    pub(crate) handler: SubscriberFunc,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("payload_type", &self.payload_type)
            .finish()
    }
}

impl Subscriber {
    /// Subscribes `f` to `topic`, decoding each payload as `T`.
    pub fn new<T, F, Fut>(topic: impl Into<String>, f: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        let decode: DecodeFn = Arc::new(
            |format: BodyFormat, data: &[u8]| -> microrpc_codec::Result<Box<dyn Any + Send>> {
                Ok(Box::new(format.decode::<T>(data)?))
            },
        );
        let handler: SubscriberFunc = Arc::new(move |ctx: Context, mut event: Event| {
            let f = Arc::clone(&f);
            async move {
                let payload = event.take_payload::<T>().ok_or_else(|| {
                    RpcError::Internal(format!(
                        "event on {} is not a {}",
                        event.topic,
                        short_type_name(std::any::type_name::<T>())
                    ))
                })?;
                f(ctx, payload).await
            }
            .boxed()
        });
        Self {
            topic: topic.into(),
            payload_type: std::any::type_name::<T>(),
            decode,
            handler,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }
}
