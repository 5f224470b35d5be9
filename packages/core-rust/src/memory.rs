//! In-process broker implementing [`Connection`] and [`Channel`].
//!
//! Messages published on a [`MemoryChannel`] are handed round-robin to the
//! subscriptions consuming the target queue. Every completion performed on a
//! delivery is recorded, so callers can assert on what the consumer runtime
//! acknowledged or rejected. Failure injection hooks make subscribe, open and
//! close errors reproducible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::delivery::{Acknowledger, Delivery};
use crate::traits::{Channel, Connection, DeliveryStream};
use crate::types::{ConsumeArgs, FieldTable};

// ---------------------------------------------------------------------------
// Completion log
// ---------------------------------------------------------------------------

/// A completion operation observed by the in-memory broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool, requeue: bool },
    Reject { delivery_tag: u64, requeue: bool },
}

impl Completion {
    #[must_use]
    pub fn delivery_tag(&self) -> u64 {
        match *self {
            Self::Ack { delivery_tag, .. }
            | Self::Nack { delivery_tag, .. }
            | Self::Reject { delivery_tag, .. } => delivery_tag,
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack { .. })
    }
}

#[derive(Default)]
struct CompletionLog {
    entries: Mutex<Vec<Completion>>,
    notify: Notify,
}

impl CompletionLog {
    fn push(&self, completion: Completion) {
        self.entries.lock().push(completion);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Acknowledger for CompletionLog {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> anyhow::Result<()> {
        self.push(Completion::Ack { delivery_tag, multiple });
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> anyhow::Result<()> {
        self.push(Completion::Nack {
            delivery_tag,
            multiple,
            requeue,
        });
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> anyhow::Result<()> {
        self.push(Completion::Reject {
            delivery_tag,
            requeue,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

/// Connection handing out [`MemoryChannel`]s.
#[derive(Default)]
pub struct MemoryConnection {
    next_channel_id: AtomicU64,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    open_failure: Mutex<Option<String>>,
}

impl MemoryConnection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a channel and returns its concrete handle.
    pub fn open(&self) -> Arc<MemoryChannel> {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Arc::new(MemoryChannel::with_id(id));
        self.channels.lock().push(Arc::clone(&channel));
        channel
    }

    /// Makes the next `channel()` call fail with `message`.
    pub fn fail_next_channel(&self, message: impl Into<String>) {
        *self.open_failure.lock() = Some(message.into());
    }

    /// Channels opened so far, in opening order.
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<MemoryChannel>> {
        self.channels.lock().clone()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn channel(&self) -> anyhow::Result<Arc<dyn Channel>> {
        if let Some(message) = self.open_failure.lock().take() {
            anyhow::bail!(message);
        }
        Ok(self.open())
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

struct Subscription {
    args: ConsumeArgs,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct ChannelState {
    closed: bool,
    close_calls: usize,
    subscriptions: Vec<Subscription>,
    round_robin: HashMap<String, usize>,
    qos: Vec<(u16, u32, bool)>,
    consume_failures: HashMap<String, String>,
    close_failure: Option<String>,
}

/// Channel backed by unbounded in-process queues.
pub struct MemoryChannel {
    id: u64,
    next_delivery_tag: AtomicU64,
    state: Mutex<ChannelState>,
    log: Arc<CompletionLog>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::with_id(0)
    }
}

impl MemoryChannel {
    /// Creates a standalone channel not owned by any connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_id(id: u64) -> Self {
        Self {
            id,
            next_delivery_tag: AtomicU64::new(0),
            state: Mutex::new(ChannelState::default()),
            log: Arc::new(CompletionLog::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publishes `body` to `queue` with no headers.
    ///
    /// # Errors
    ///
    /// See [`MemoryChannel::publish_with_headers`].
    pub fn publish(&self, queue: &str, body: impl Into<Bytes>) -> anyhow::Result<u64> {
        self.publish_with_headers(queue, body, FieldTable::new())
    }

    /// Publishes a message to the next subscription consuming `queue` and
    /// returns its delivery tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed or nothing consumes `queue`.
    pub fn publish_with_headers(
        &self,
        queue: &str,
        body: impl Into<Bytes>,
        headers: FieldTable,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        if state.closed {
            anyhow::bail!("channel {} is closed", self.id);
        }

        let candidates: Vec<usize> = state
            .subscriptions
            .iter()
            .enumerate()
            .filter(|(_, sub)| sub.args.queue == queue)
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            anyhow::bail!("no consumer for queue {queue}");
        }

        let cursor = state.round_robin.entry(queue.to_string()).or_insert(0);
        let chosen = candidates[*cursor % candidates.len()];
        *cursor += 1;

        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
        let subscription = &state.subscriptions[chosen];
        let acker: Arc<dyn Acknowledger> = self.log.clone();
        let mut delivery = Delivery::new(
            subscription.args.consumer_tag.clone(),
            delivery_tag,
            body,
            acker,
        )
        .with_headers(headers)
        .with_routing("", queue);
        if subscription.args.auto_ack {
            delivery = delivery.pre_acknowledged();
        }

        subscription
            .tx
            .send(delivery)
            .map_err(|_| anyhow::anyhow!("consumer for queue {queue} has gone away"))?;
        Ok(delivery_tag)
    }

    /// Acknowledger recording into this channel's completion log.
    #[must_use]
    pub fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        self.log.clone()
    }

    /// Builds a delivery for `consumer_tag` without going through a
    /// subscription. Its completions are recorded on this channel.
    pub fn delivery(&self, consumer_tag: impl Into<String>, body: impl Into<Bytes>) -> Delivery {
        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
        Delivery::new(consumer_tag, delivery_tag, body, self.acknowledger())
    }

    /// Makes `consume` on `queue` fail with `message`.
    pub fn fail_consume(&self, queue: impl Into<String>, message: impl Into<String>) {
        self.state
            .lock()
            .consume_failures
            .insert(queue.into(), message.into());
    }

    /// Makes `close` return `message` as an error (the channel still closes).
    pub fn fail_close(&self, message: impl Into<String>) {
        self.state.lock().close_failure = Some(message.into());
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Prefetch settings applied so far, in call order.
    #[must_use]
    pub fn qos_calls(&self) -> Vec<(u16, u32, bool)> {
        self.state.lock().qos.clone()
    }

    /// Subscriptions currently open on this channel.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<ConsumeArgs> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .map(|sub| sub.args.clone())
            .collect()
    }

    /// Completions recorded so far.
    #[must_use]
    pub fn completions(&self) -> Vec<Completion> {
        self.log.entries.lock().clone()
    }

    /// Waits until at least `count` completions have been recorded.
    pub async fn wait_for_completions(&self, count: usize) -> Vec<Completion> {
        loop {
            let notified = self.log.notify.notified();
            {
                let entries = self.log.entries.lock();
                if entries.len() >= count {
                    return entries.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            anyhow::bail!("channel {} is closed", self.id);
        }
        state.qos.push((prefetch_count, prefetch_size, global));
        Ok(())
    }

    async fn consume(&self, args: &ConsumeArgs) -> anyhow::Result<DeliveryStream> {
        let mut state = self.state.lock();
        if state.closed {
            anyhow::bail!("channel {} is closed", self.id);
        }
        if let Some(message) = state.consume_failures.get(&args.queue) {
            anyhow::bail!("{message}");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriptions.push(Subscription {
            args: args.clone(),
            tx,
        });
        debug!(channel = self.id, queue = %args.queue, consumer_tag = %args.consumer_tag, "subscription opened");

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    /// Closing an already closed channel is a no-op, so listeners sharing a
    /// channel can each close it.
    async fn close(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        if !state.closed {
            state.closed = true;
            // Dropping the senders ends every delivery stream.
            state.subscriptions.clear();
            debug!(channel = self.id, "channel closed");
        }
        match state.close_failure.take() {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
