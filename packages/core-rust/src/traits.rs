use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::delivery::Delivery;
use crate::types::ConsumeArgs;

/// Stream of deliveries for one subscription. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Broker connection able to open channels (sessions).
/// Implementations: an AMQP client adapter, [`MemoryConnection`](crate::memory::MemoryConnection) (tests).
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection.
    async fn channel(&self) -> anyhow::Result<Arc<dyn Channel>>;
}

/// Broker channel used to consume messages.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Set the prefetch window. `global` applies it to the whole channel
    /// instead of to each consumer.
    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> anyhow::Result<()>;

    /// Start a subscription and return its delivery stream.
    async fn consume(&self, args: &ConsumeArgs) -> anyhow::Result<DeliveryStream>;

    /// Close the channel. Every delivery stream opened on it terminates.
    async fn close(&self) -> anyhow::Result<()>;
}
