//! Carrot core: deliveries, broker channel contracts, and an in-memory broker.

pub mod delivery;
pub mod memory;
pub mod traits;
pub mod types;

pub use delivery::{Acknowledger, CompletionError, Delivery};
pub use memory::{Completion, MemoryChannel, MemoryConnection};
pub use traits::{Channel, Connection, DeliveryStream};
pub use types::{ConsumeArgs, FieldTable, FieldValue};
