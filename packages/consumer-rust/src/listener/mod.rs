//! Listeners turn a broker subscription into calls to a [`Handler`](crate::handler::Handler).
//!
//! - [`consumer`]: Single-queue listener with a serve loop
//! - [`sink`]: Fan-in of several listeners over one shared channel
//! - [`dedicated`]: Decorator giving a listener its own channel
//! - [`closer`]: Close contract returned by every listener

pub mod closer;
pub mod config;
pub mod consumer;
pub mod dedicated;
pub mod sink;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use carrot_core::{Channel, Connection};

use crate::handler::BoxHandler;

pub use closer::{CloseError, Closed, Closer, CloserState, SharedError};
pub use config::{DispatchPolicy, ListenerConfig};
pub use consumer::ConsumerListener;
pub use dedicated::{use_dedicated_channel, Dedicated};
pub use sink::Sink;

/// Errors raised while starting to listen.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("failed to set channel prefetch")]
    Qos(#[source] anyhow::Error),
    #[error("failed to consume from queue {queue:?}")]
    Consume {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to open dedicated channel")]
    OpenChannel(#[source] anyhow::Error),
    #[error("listener #{index} failed to listen")]
    Child {
        index: usize,
        #[source]
        source: Box<ListenError>,
    },
}

/// Starts consuming from a channel and dispatches deliveries to a handler.
///
/// Implementations return a [`Closer`] once the subscription is established.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn listen(
        &self,
        conn: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
        handler: BoxHandler,
    ) -> Result<Arc<dyn Closer>, ListenError>;
}

#[async_trait]
impl<L: Listener + ?Sized> Listener for Arc<L> {
    async fn listen(
        &self,
        conn: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
        handler: BoxHandler,
    ) -> Result<Arc<dyn Closer>, ListenError> {
        (**self).listen(conn, channel, handler).await
    }
}

/// Adapts a closure into a [`Listener`].
pub struct ListenerFn<F> {
    f: F,
}

/// Creates a [`Listener`] from an async closure.
pub fn listener_fn<F, Fut>(f: F) -> ListenerFn<F>
where
    F: Fn(Arc<dyn Connection>, Arc<dyn Channel>, BoxHandler) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn Closer>, ListenError>> + Send,
{
    ListenerFn { f }
}

#[async_trait]
impl<F, Fut> Listener for ListenerFn<F>
where
    F: Fn(Arc<dyn Connection>, Arc<dyn Channel>, BoxHandler) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn Closer>, ListenError>> + Send,
{
    async fn listen(
        &self,
        conn: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
        handler: BoxHandler,
    ) -> Result<Arc<dyn Closer>, ListenError> {
        (self.f)(conn, channel, handler).await
    }
}
