//! Inbound message envelope and its completion operations.
//!
//! Every [`Delivery`] must be resolved exactly once, by acknowledging it or by
//! rejecting it. Clones share the same resolution flag, so whichever copy is
//! completed first wins and every later attempt fails with
//! [`CompletionError::AlreadyResolved`] without reaching the broker.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::FieldTable;

// ---------------------------------------------------------------------------
// Acknowledger
// ---------------------------------------------------------------------------

/// Broker-side completion operations for deliveries received on a channel.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge `delivery_tag`, and every earlier unacknowledged delivery
    /// on the channel when `multiple` is set.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> anyhow::Result<()>;

    /// Negatively acknowledge `delivery_tag`.
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> anyhow::Result<()>;

    /// Reject a single delivery.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> anyhow::Result<()>;
}

/// Errors returned when completing a [`Delivery`].
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("delivery {delivery_tag} has already been resolved")]
    AlreadyResolved { delivery_tag: u64 },
    #[error("broker failed to complete delivery {delivery_tag}")]
    Broker {
        delivery_tag: u64,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// One inbound message plus the operations to resolve it.
#[derive(Clone)]
pub struct Delivery {
    /// Opaque message payload.
    pub body: Bytes,
    /// Message headers.
    pub headers: FieldTable,
    /// Consumer tag of the subscription that received the message.
    pub consumer_tag: String,
    /// Channel-scoped delivery identifier.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
    resolved: Arc<AtomicBool>,
}

impl Delivery {
    /// Creates an unresolved delivery completed through `acker`.
    pub fn new(
        consumer_tag: impl Into<String>,
        delivery_tag: u64,
        body: impl Into<Bytes>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            body: body.into(),
            headers: FieldTable::new(),
            consumer_tag: consumer_tag.into(),
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            acker,
            resolved: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_routing(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Marks the delivery as already settled by the broker (auto-ack subscriptions).
    #[must_use]
    pub fn pre_acknowledged(self) -> Self {
        self.resolved.store(true, Ordering::Release);
        self
    }

    /// Returns `true` once any clone of this delivery has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Acknowledges the delivery. With `multiple`, every earlier
    /// unacknowledged delivery on the same channel is acknowledged as well.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::AlreadyResolved`] if the delivery was
    /// already completed, or [`CompletionError::Broker`] if the broker call failed.
    pub async fn ack(&self, multiple: bool) -> Result<(), CompletionError> {
        self.claim()?;
        self.acker
            .ack(self.delivery_tag, multiple)
            .await
            .map_err(|source| self.broker_error(source))
    }

    /// Negatively acknowledges the delivery, optionally requeueing it.
    ///
    /// # Errors
    ///
    /// Same as [`Delivery::ack`].
    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), CompletionError> {
        self.claim()?;
        self.acker
            .nack(self.delivery_tag, multiple, requeue)
            .await
            .map_err(|source| self.broker_error(source))
    }

    /// Rejects the delivery, optionally requeueing it.
    ///
    /// # Errors
    ///
    /// Same as [`Delivery::ack`].
    pub async fn reject(&self, requeue: bool) -> Result<(), CompletionError> {
        self.claim()?;
        self.acker
            .reject(self.delivery_tag, requeue)
            .await
            .map_err(|source| self.broker_error(source))
    }

    fn claim(&self) -> Result<(), CompletionError> {
        self.resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| CompletionError::AlreadyResolved {
                delivery_tag: self.delivery_tag,
            })
    }

    fn broker_error(&self, source: anyhow::Error) -> CompletionError {
        CompletionError::Broker {
            delivery_tag: self.delivery_tag,
            source,
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("consumer_tag", &self.consumer_tag)
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}

/// Two deliveries are equal when they are copies of the same inbound message.
impl PartialEq for Delivery {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.resolved, &other.resolved)
            && self.delivery_tag == other.delivery_tag
            && self.consumer_tag == other.consumer_tag
            && self.body == other.body
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
