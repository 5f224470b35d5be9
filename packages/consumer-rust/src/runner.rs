//! Top-level assembly: connection + listener + handler.
//!
//! [`Runner::run`] checks that a listener and a handler are both configured,
//! opens a channel, starts the listener with the handler and,
//! when shutdown options are configured, arms a [`ShutdownCoordinator`] on
//! the returned closer.

use std::fmt;
use std::sync::Arc;

use carrot_core::Connection;
use tracing::info;

use crate::handler::BoxHandler;
use crate::listener::{Closer, ListenError, Listener};
use crate::shutdown::{ShutdownCoordinator, ShutdownOptions};

/// Errors raised by [`Runner::run`].
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no connection configured")]
    NoConnection,
    #[error("listener configured without a handler")]
    NoHandler,
    #[error("handler configured without a listener")]
    NoListener,
    #[error("failed to open channel")]
    OpenChannel(#[source] anyhow::Error),
    #[error("failed to start listening")]
    Listen(#[from] ListenError),
}

/// What the runner assembles.
#[derive(Clone, Default)]
pub struct RunnerConfig {
    pub connection: Option<Arc<dyn Connection>>,
    pub listener: Option<Arc<dyn Listener>>,
    pub handler: Option<BoxHandler>,
    /// Arms signal-driven graceful shutdown when set.
    pub shutdown: Option<ShutdownOptions>,
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("connection", &self.connection.is_some())
            .field("listener", &self.listener.is_some())
            .field("handler", &self.handler.is_some())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

/// Starts listening according to a [`RunnerConfig`].
#[derive(Debug)]
pub struct Runner {
    config: RunnerConfig,
}

impl Runner {
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Starts listening and returns the closer, or `None` when neither a
    /// listener nor a handler is configured.
    ///
    /// The runner is consumed, so graceful shutdown is armed at most once.
    ///
    /// # Errors
    ///
    /// Returns a [`RunnerError`] if the configuration is incomplete, the
    /// channel cannot be opened, or the listener fails to start.
    pub async fn run(self) -> Result<Option<Arc<dyn Closer>>, RunnerError> {
        let RunnerConfig {
            connection,
            listener,
            handler,
            shutdown,
        } = self.config;

        let connection = connection.ok_or(RunnerError::NoConnection)?;
        let (listener, handler) = match (listener, handler) {
            (None, None) => {
                info!("no listener or handler configured, nothing to consume");
                return Ok(None);
            }
            (Some(_), None) => return Err(RunnerError::NoHandler),
            (None, Some(_)) => return Err(RunnerError::NoListener),
            (Some(listener), Some(handler)) => (listener, handler),
        };

        let channel = connection
            .channel()
            .await
            .map_err(RunnerError::OpenChannel)?;

        let closer = listener.listen(Arc::clone(&connection), channel, handler).await?;
        info!("runner started");

        if let Some(options) = shutdown {
            let coordinator = ShutdownCoordinator::new(Arc::clone(&closer), options.resolve());
            // Detached: the coordinator task lives until a signal arrives.
            let _handle = coordinator.spawn();
        }

        Ok(Some(closer))
    }
}
