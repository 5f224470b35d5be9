//! Close contract shared by every listener.
//!
//! A [`Closer`] moves through `Active -> Closing -> Closed` exactly once.
//! [`CloseGuard`] implements the transition with an atomic flag: the first
//! caller performs the close, every other caller gets
//! [`CloseError::AlreadyClosed`]. The terminal outcome is published on a
//! `watch` channel so any number of [`Closed`] handles can await it.

use std::error::Error as StdError;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::context::Context;

/// Cloneable handle to an underlying error.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

pub(crate) fn shared(err: anyhow::Error) -> SharedError {
    Arc::from(Box::<dyn StdError + Send + Sync>::from(err))
}

/// Errors returned by [`Closer::close`] and observed through [`Closed`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum CloseError {
    #[error("already closed")]
    AlreadyClosed,
    #[error("failed to close channel")]
    Channel(#[source] SharedError),
    #[error("deadline exceeded before the listener stopped")]
    DeadlineExceeded(#[source] Option<SharedError>),
    #[error("close task failed")]
    Task(#[source] SharedError),
    #[error("closer dropped before reporting an outcome")]
    Dropped,
}

impl CloseError {
    pub(crate) fn channel(err: anyhow::Error) -> Self {
        Self::Channel(shared(err))
    }

    /// Returns `true` for the double-close error, which is never a failure.
    #[must_use]
    pub fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed)
    }
}

// ---------------------------------------------------------------------------
// Closer
// ---------------------------------------------------------------------------

/// Handle to an in-flight listening operation.
#[async_trait]
pub trait Closer: Send + Sync {
    /// Stops listening. Waits for the listener to wind down until `ctx` is done.
    ///
    /// Only the first call closes; later calls return [`CloseError::AlreadyClosed`].
    async fn close(&self, ctx: &Context) -> Result<(), CloseError>;

    /// Notification of the outcome of the first [`Closer::close`] call.
    fn closed(&self) -> Closed;

    /// Where the closer is in its lifecycle.
    fn state(&self) -> CloserState;
}

/// Lifecycle state of a [`Closer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloserState {
    Active,
    Closing,
    Closed,
}

type Outcome = Option<Result<(), CloseError>>;

/// Awaitable terminal outcome of a [`Closer`].
///
/// Resolves once the close has finished. Awaiting it directly works through
/// [`IntoFuture`].
#[derive(Debug, Clone)]
pub struct Closed {
    rx: watch::Receiver<Outcome>,
}

impl Closed {
    /// Waits for the outcome of the close.
    pub async fn wait(mut self) -> Result<(), CloseError> {
        loop {
            let outcome = self.rx.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                let outcome = self.rx.borrow().clone();
                return outcome.unwrap_or(Err(CloseError::Dropped));
            }
        }
    }

    /// Returns the outcome if the close has already finished.
    #[must_use]
    pub fn try_outcome(&self) -> Option<Result<(), CloseError>> {
        self.rx.borrow().clone()
    }
}

impl IntoFuture for Closed {
    type Output = Result<(), CloseError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

// ---------------------------------------------------------------------------
// CloseGuard
// ---------------------------------------------------------------------------

/// Single-execution guard behind every [`Closer`] implementation.
#[derive(Debug)]
pub(crate) struct CloseGuard {
    closing: AtomicBool,
    outcome: watch::Sender<Outcome>,
}

impl CloseGuard {
    pub(crate) fn new() -> Self {
        let (outcome, _rx) = watch::channel(None);
        Self {
            closing: AtomicBool::new(false),
            outcome,
        }
    }

    /// Claims the close. Fails for everyone but the first caller.
    pub(crate) fn begin(&self) -> Result<(), CloseError> {
        self.closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| CloseError::AlreadyClosed)
    }

    /// Publishes the outcome and hands it back to the closing caller.
    pub(crate) fn finish(&self, outcome: Result<(), CloseError>) -> Result<(), CloseError> {
        self.outcome.send_replace(Some(outcome.clone()));
        outcome
    }

    pub(crate) fn closed(&self) -> Closed {
        Closed {
            rx: self.outcome.subscribe(),
        }
    }

    pub(crate) fn state(&self) -> CloserState {
        if !self.closing.load(Ordering::Acquire) {
            CloserState::Active
        } else if self.outcome.borrow().is_some() {
            CloserState::Closed
        } else {
            CloserState::Closing
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
