//! Handler and middleware abstractions.
//!
//! A [`Handler`] processes one [`Delivery`] and reports success or failure; it
//! never resolves the delivery itself. Middleware is a `tower::Layer` that
//! turns one boxed handler into another.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use carrot_core::{CompletionError, Delivery};
use tower::Layer;

use crate::context::Context;

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Errors produced while handling a delivery.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no handler bound for consumer tag {consumer_tag:?}")]
    NoHandler { consumer_tag: String },
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("handling cancelled")]
    Cancelled,
    #[error("failed to complete delivery")]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Wraps an application error.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(anyhow::Error::new(error))
    }

    /// Returns the application error of type `E`, if this error wraps one.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Failed(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Processes one delivery.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: Context, delivery: Delivery) -> Result<(), HandlerError>;
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

#[async_trait]
impl Handler for BoxHandler {
    async fn handle(&self, ctx: Context, delivery: Delivery) -> Result<(), HandlerError> {
        self.as_ref().handle(ctx, delivery).await
    }
}

/// Boxes a concrete handler.
pub fn boxed<H: Handler>(handler: H) -> BoxHandler {
    Arc::new(handler)
}

/// Handler backed by an async closure. See [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Creates a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: Context, delivery: Delivery) -> Result<(), HandlerError> {
        (self.f)(ctx, delivery).await
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// A layer wrapping one handler into another.
pub type Middleware = Arc<dyn Layer<BoxHandler, Service = BoxHandler> + Send + Sync>;

/// Type-erases any handler layer into a [`Middleware`].
pub fn middleware<L>(layer: L) -> Middleware
where
    L: Layer<BoxHandler, Service = BoxHandler> + Send + Sync + 'static,
{
    Arc::new(layer)
}

/// Creates a [`Middleware`] from a closure over the next handler.
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync + 'static,
{
    Arc::new(tower::layer::layer_fn(f))
}

/// Wraps `handler` with `stack`. Index 0 ends up outermost.
pub fn apply(handler: BoxHandler, stack: &[Middleware]) -> BoxHandler {
    stack
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware.layer(next))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
