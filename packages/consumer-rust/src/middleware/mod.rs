//! Handler middleware layers.
//!
//! - [`timeout`]: Per-delivery timeout enforcement
//! - [`trace`]: Handling duration and outcome via `tracing` spans
//!
//! Closure middleware is built with [`middleware_fn`](crate::handler::middleware_fn).

pub mod timeout;
pub mod trace;

pub use timeout::TimeoutLayer;
pub use trace::TraceLayer;
