//! Tracing middleware for handlers.
//!
//! Records handling duration and outcome on a `tracing` span per delivery.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use carrot_core::Delivery;
use tower::Layer;
use tracing::{info_span, Instrument};

use crate::context::Context;
use crate::handler::{BoxHandler, Handler, HandlerError};

// ---------------------------------------------------------------------------
// TraceLayer
// ---------------------------------------------------------------------------

/// Layer that instruments handlers with timing and outcome via `tracing` spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLayer;

impl Layer<BoxHandler> for TraceLayer {
    type Service = BoxHandler;

    fn layer(&self, inner: BoxHandler) -> BoxHandler {
        Arc::new(TraceHandler { inner })
    }
}

// ---------------------------------------------------------------------------
// TraceHandler
// ---------------------------------------------------------------------------

/// Handler wrapper that records delivery duration and outcome in tracing spans.
pub struct TraceHandler {
    inner: BoxHandler,
}

#[async_trait]
impl Handler for TraceHandler {
    async fn handle(&self, ctx: Context, delivery: Delivery) -> Result<(), HandlerError> {
        let consumer_tag = delivery.consumer_tag.clone();
        let delivery_tag = delivery.delivery_tag;

        let span = info_span!(
            "delivery",
            consumer_tag = %consumer_tag,
            delivery_tag = delivery_tag,
            redelivered = delivery.redelivered,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let result = self.inner.handle(ctx, delivery).await;
            let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            let outcome = match &result {
                Ok(()) => "ok",
                Err(_) => "error",
            };

            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);

            match &result {
                Ok(()) => tracing::info!(
                    consumer_tag = %consumer_tag,
                    delivery_tag = delivery_tag,
                    duration_ms = duration_ms,
                    "delivery handled"
                ),
                Err(err) => tracing::warn!(
                    consumer_tag = %consumer_tag,
                    delivery_tag = delivery_tag,
                    duration_ms = duration_ms,
                    error = %err,
                    "delivery handling failed"
                ),
            }

            result
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
