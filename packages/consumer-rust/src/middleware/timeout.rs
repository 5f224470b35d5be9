//! Timeout middleware for handlers.
//!
//! Bounds each delivery's handling time and fails it with
//! `HandlerError::Timeout` when the inner handler does not finish in time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carrot_core::Delivery;
use tokio::time::Instant;
use tower::Layer;

use crate::context::Context;
use crate::handler::{BoxHandler, Handler, HandlerError};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Layer wrapping handlers with a fixed per-delivery timeout.
///
/// The inner handler receives a child context carrying the deadline, so it
/// can stop cooperative work early; the context is cancelled once the
/// handler returns or times out.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Layer<BoxHandler> for TimeoutLayer {
    type Service = BoxHandler;

    fn layer(&self, inner: BoxHandler) -> BoxHandler {
        Arc::new(TimeoutHandler {
            inner,
            timeout: self.timeout,
        })
    }
}

// ---------------------------------------------------------------------------
// TimeoutHandler
// ---------------------------------------------------------------------------

/// Handler wrapper that enforces the timeout.
pub struct TimeoutHandler {
    inner: BoxHandler,
    timeout: Duration,
}

#[async_trait]
impl Handler for TimeoutHandler {
    async fn handle(&self, ctx: Context, delivery: Delivery) -> Result<(), HandlerError> {
        let deadline = Instant::now() + self.timeout;
        let scoped = ctx.with_deadline(deadline);
        let deadline = scoped.deadline().unwrap_or(deadline);

        let result =
            tokio::time::timeout_at(deadline, self.inner.handle(scoped.clone(), delivery)).await;
        scoped.cancel();

        match result {
            Ok(result) => result,
            Err(_elapsed) => Err(HandlerError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
