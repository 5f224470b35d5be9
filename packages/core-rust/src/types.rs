use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Broker-specific argument and header table.
///
/// Ordered by key so two tables with the same entries compare and print the same.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A single value stored in a [`FieldTable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Void,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<FieldValue>),
    Table(FieldTable),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self {
        Self::Table(value)
    }
}

/// Parameters of a single subscription opened with [`Channel::consume`](crate::Channel::consume).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeArgs {
    /// Queue to consume from.
    pub queue: String,
    /// Consumer tag the broker stamps on every delivery of this subscription.
    pub consumer_tag: String,
    /// Deliveries are considered acknowledged as soon as they are sent.
    pub auto_ack: bool,
    /// Request exclusive access to the queue.
    pub exclusive: bool,
    /// Do not receive messages published on the same connection.
    pub no_local: bool,
    /// Do not wait for the broker to confirm the subscription.
    pub no_wait: bool,
    /// Broker-specific arguments.
    pub arguments: FieldTable,
}

impl ConsumeArgs {
    /// Subscription on `queue` whose consumer tag is the queue name itself.
    #[must_use]
    pub fn queue(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            consumer_tag: queue.clone(),
            queue,
            ..Self::default()
        }
    }
}
