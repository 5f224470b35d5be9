//! Listener configuration.

use carrot_core::{ConsumeArgs, FieldTable};
use serde::Deserialize;

/// How the serve loop runs handlers for incoming deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// One task per delivery, no limit.
    #[default]
    Unbounded,
    /// Handle deliveries one at a time, in arrival order.
    Sequential,
    /// At most `n` deliveries in flight. The serve loop stops pulling from
    /// the subscription while the limit is reached.
    Bounded(usize),
}

/// Configuration of a single-queue listener.
///
/// Consume flags map one-to-one onto the broker's consume call. The consumer
/// tag defaults to the queue name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub queue: String,
    pub consumer_tag: Option<String>,
    /// Human-readable name, used in logs.
    pub title: Option<String>,
    pub description: Option<String>,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
    pub dispatch: DispatchPolicy,
}

impl ListenerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub fn no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    #[must_use]
    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    #[must_use]
    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    #[must_use]
    pub fn dispatch(mut self, dispatch: DispatchPolicy) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// The consumer tag deliveries will carry.
    #[must_use]
    pub fn effective_consumer_tag(&self) -> &str {
        self.consumer_tag.as_deref().unwrap_or(&self.queue)
    }

    /// Arguments for [`Channel::consume`](carrot_core::Channel::consume).
    #[must_use]
    pub fn consume_args(&self) -> ConsumeArgs {
        ConsumeArgs {
            queue: self.queue.clone(),
            consumer_tag: self.effective_consumer_tag().to_string(),
            auto_ack: self.auto_ack,
            exclusive: self.exclusive,
            no_local: self.no_local,
            no_wait: self.no_wait,
            arguments: self.arguments.clone(),
        }
    }
}
