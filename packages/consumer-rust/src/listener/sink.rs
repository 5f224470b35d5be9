//! Fan-in of several listeners over one shared channel.
//!
//! A [`Sink`] sets the channel prefetch count to the number of child
//! listeners, then starts each child on the same channel. If a child fails to
//! start, the children already running are closed again before the error is
//! returned. Closing the sink closes every child concurrently and reports the
//! first failure in completion order, without skipping the remaining children.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carrot_core::{Channel, Connection};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::closer::{CloseError, CloseGuard, Closed, Closer, CloserState};
use super::{ListenError, Listener};
use crate::context::Context;
use crate::handler::BoxHandler;

/// Time allowed for closing already started children after a failed listen.
const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener combining several listeners on a single channel.
#[derive(Clone)]
pub struct Sink {
    listeners: Vec<Arc<dyn Listener>>,
    rollback_timeout: Duration,
}

impl Sink {
    /// Returns `None` when `listeners` is empty.
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn Listener>>) -> Option<Self> {
        if listeners.is_empty() {
            return None;
        }
        Some(Self {
            listeners,
            rollback_timeout: DEFAULT_ROLLBACK_TIMEOUT,
        })
    }

    /// Overrides how long closing started children may take after a failed listen.
    #[must_use]
    pub fn rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = timeout;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    async fn roll_back(&self, started: Vec<Arc<dyn Closer>>) {
        if started.is_empty() {
            return;
        }
        let ctx = Context::background().with_timeout(self.rollback_timeout);
        if let Err(err) = close_all(&started, &ctx).await {
            error!(error = %err, started = started.len(), "failed to close listeners after a failed start");
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("listeners", &self.listeners.len())
            .field("rollback_timeout", &self.rollback_timeout)
            .finish()
    }
}

#[async_trait]
impl Listener for Sink {
    async fn listen(
        &self,
        conn: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
        handler: BoxHandler,
    ) -> Result<Arc<dyn Closer>, ListenError> {
        let prefetch = u16::try_from(self.listeners.len()).unwrap_or(u16::MAX);
        channel
            .qos(prefetch, 0, false)
            .await
            .map_err(ListenError::Qos)?;

        let mut closers = Vec::with_capacity(self.listeners.len());
        for (index, listener) in self.listeners.iter().enumerate() {
            match listener
                .listen(Arc::clone(&conn), Arc::clone(&channel), Arc::clone(&handler))
                .await
            {
                Ok(closer) => closers.push(closer),
                Err(err) => {
                    warn!(index, error = %err, "listener failed to start, closing the others");
                    self.roll_back(closers).await;
                    return Err(ListenError::Child {
                        index,
                        source: Box::new(err),
                    });
                }
            }
        }

        debug!(listeners = closers.len(), prefetch, "sink listening");
        Ok(Arc::new(SinkCloser {
            closers,
            guard: CloseGuard::new(),
        }))
    }
}

/// Closes every closer on its own task and returns the first error observed.
async fn close_all(closers: &[Arc<dyn Closer>], ctx: &Context) -> Result<(), CloseError> {
    let mut tasks = JoinSet::new();
    for closer in closers {
        let closer = Arc::clone(closer);
        let ctx = ctx.clone();
        tasks.spawn(async move { closer.close(&ctx).await });
    }

    let mut first = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => Err(CloseError::Task(Arc::new(err))),
        };
        if let Err(err) = outcome {
            debug!(error = %err, "listener close failed");
            first.get_or_insert(err);
        }
    }

    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct SinkCloser {
    closers: Vec<Arc<dyn Closer>>,
    guard: CloseGuard,
}

#[async_trait]
impl Closer for SinkCloser {
    async fn close(&self, ctx: &Context) -> Result<(), CloseError> {
        self.guard.begin()?;
        let outcome = close_all(&self.closers, ctx).await;
        self.guard.finish(outcome)
    }

    fn closed(&self) -> Closed {
        self.guard.closed()
    }

    fn state(&self) -> CloserState {
        self.guard.state()
    }
}
