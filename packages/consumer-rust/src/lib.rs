//! Carrot consumer runtime: routing, middleware, listeners, fan-in and graceful shutdown
//! on top of the broker contracts in `carrot-core`.

pub mod context;
pub mod handler;
pub mod listener;
pub mod middleware;
pub mod router;
pub mod runner;
pub mod shutdown;

pub use context::{Context, ContextError};
pub use handler::{
    apply, boxed, handler_fn, middleware, middleware_fn, BoxHandler, Handler, HandlerError,
    HandlerFn, Middleware,
};
pub use listener::{
    listener_fn, use_dedicated_channel, CloseError, Closed, Closer, CloserState, ConsumerListener,
    Dedicated, DispatchPolicy, ListenError, Listener, ListenerConfig, Sink,
};
pub use router::Router;
pub use runner::{Runner, RunnerConfig, RunnerError};
pub use shutdown::{
    close_gracefully, graceful_shutdown, ShutdownConfig, ShutdownCoordinator, ShutdownOptions,
    Signal,
};
