//! Signal-driven graceful shutdown.
//!
//! [`ShutdownCoordinator`] waits in the background for one of the configured
//! OS signals, then closes a [`Closer`] under a timeout. Failures go to the
//! configured error callback, which aborts the process by default. Closing a
//! closer that was already closed elsewhere is not a failure.
//!
//! Phase machine: Idle -> Waiting -> Closing -> Finished

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::listener::{CloseError, Closer};

/// Default time allowed for the close to finish.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Callback receiving close failures.
pub type ShutdownErrorCallback = Arc<dyn Fn(CloseError) + Send + Sync>;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// OS signal that can trigger a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
    User1,
    User2,
}

#[cfg(unix)]
impl Signal {
    fn kind(self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            Self::Interrupt => SignalKind::interrupt(),
            Self::Terminate => SignalKind::terminate(),
            Self::Hangup => SignalKind::hangup(),
            Self::Quit => SignalKind::quit(),
            Self::User1 => SignalKind::user_defined1(),
            Self::User2 => SignalKind::user_defined2(),
        }
    }
}

/// Waits for the first of `signals`. An empty list waits for [`Signal::Interrupt`].
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed.
#[cfg(unix)]
pub async fn wait_for_signal(signals: &[Signal]) -> std::io::Result<Signal> {
    use futures_util::future::select_all;
    use tokio::signal::unix::signal;

    let signals = if signals.is_empty() {
        &[Signal::Interrupt][..]
    } else {
        signals
    };

    let mut streams = Vec::with_capacity(signals.len());
    for &sig in signals {
        streams.push((sig, signal(sig.kind())?));
    }

    let waits = streams.iter_mut().map(|(sig, stream)| {
        let sig = *sig;
        Box::pin(async move {
            stream.recv().await;
            sig
        })
    });
    let (received, _, _) = select_all(waits).await;
    Ok(received)
}

/// Waits for Ctrl-C, the only signal available on this platform.
///
/// # Errors
///
/// Returns an error if the Ctrl-C handler cannot be installed.
#[cfg(not(unix))]
pub async fn wait_for_signal(_signals: &[Signal]) -> std::io::Result<Signal> {
    tokio::signal::ctrl_c().await?;
    Ok(Signal::Interrupt)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Resolved shutdown settings.
#[derive(Clone)]
pub struct ShutdownConfig {
    pub timeout: Duration,
    pub signals: Vec<Signal>,
    pub on_error: ShutdownErrorCallback,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            signals: vec![Signal::Interrupt],
            on_error: Arc::new(abort_on_error),
        }
    }
}

impl fmt::Debug for ShutdownConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownConfig")
            .field("timeout", &self.timeout)
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

fn abort_on_error(err: CloseError) {
    error!(error = %err, "graceful shutdown failed, aborting");
    std::process::abort();
}

/// Partial shutdown settings; unset fields fall back to [`ShutdownConfig::default`].
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShutdownOptions {
    pub timeout: Option<Duration>,
    pub signals: Vec<Signal>,
    #[serde(skip)]
    pub on_error: Option<ShutdownErrorCallback>,
}

impl ShutdownOptions {
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn signals(mut self, signals: impl IntoIterator<Item = Signal>) -> Self {
        self.signals = signals.into_iter().collect();
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(CloseError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Merges these options into the defaults. Zero-valued fields (a zero
    /// timeout, no signals) keep the default.
    #[must_use]
    pub fn resolve(&self) -> ShutdownConfig {
        let defaults = ShutdownConfig::default();
        ShutdownConfig {
            timeout: self
                .timeout
                .filter(|timeout| !timeout.is_zero())
                .unwrap_or(defaults.timeout),
            signals: if self.signals.is_empty() {
                defaults.signals
            } else {
                self.signals.clone()
            },
            on_error: self.on_error.clone().unwrap_or(defaults.on_error),
        }
    }
}

impl fmt::Debug for ShutdownOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownOptions")
            .field("timeout", &self.timeout)
            .field("signals", &self.signals)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Progress of a [`ShutdownCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not armed yet.
    Idle,
    /// Waiting for the trigger.
    Waiting,
    /// Trigger fired, the closer is being closed.
    Closing,
    /// Close finished, successfully or not.
    Finished,
}

/// Closes a [`Closer`] once a trigger fires. Arms at most once.
pub struct ShutdownCoordinator {
    closer: Arc<dyn Closer>,
    config: ShutdownConfig,
    armed: AtomicBool,
    phase: Arc<ArcSwap<ShutdownPhase>>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(closer: Arc<dyn Closer>, config: ShutdownConfig) -> Self {
        Self {
            closer,
            config,
            armed: AtomicBool::new(false),
            phase: Arc::new(ArcSwap::from_pointee(ShutdownPhase::Idle)),
        }
    }

    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        **self.phase.load()
    }

    /// Arms the coordinator on the configured OS signals.
    ///
    /// Returns `None` if it was already armed.
    pub fn spawn(&self) -> Option<JoinHandle<()>> {
        let signals = self.config.signals.clone();
        let phase = Arc::clone(&self.phase);
        self.spawn_with(async move {
            match wait_for_signal(&signals).await {
                Ok(signal) => {
                    info!(?signal, "shutdown signal received");
                    true
                }
                Err(err) => {
                    error!(error = %err, "failed to install signal handlers, graceful shutdown disabled");
                    phase.store(Arc::new(ShutdownPhase::Finished));
                    false
                }
            }
        })
    }

    /// Arms the coordinator on an arbitrary trigger. The close runs once
    /// `trigger` resolves to `true`.
    ///
    /// Returns `None` if it was already armed.
    pub fn spawn_with<F>(&self, trigger: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = bool> + Send + 'static,
    {
        if self.armed.swap(true, Ordering::AcqRel) {
            debug!("shutdown coordinator already armed");
            return None;
        }

        self.phase.store(Arc::new(ShutdownPhase::Waiting));
        let closer = Arc::clone(&self.closer);
        let config = self.config.clone();
        let phase = Arc::clone(&self.phase);

        Some(tokio::spawn(async move {
            if !trigger.await {
                return;
            }
            phase.store(Arc::new(ShutdownPhase::Closing));
            close_gracefully(closer.as_ref(), &config).await;
            phase.store(Arc::new(ShutdownPhase::Finished));
        }))
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Waits for one of the configured signals, then closes `closer`.
pub async fn graceful_shutdown(closer: Arc<dyn Closer>, config: ShutdownConfig) {
    match wait_for_signal(&config.signals).await {
        Ok(signal) => {
            info!(?signal, "shutdown signal received");
            close_gracefully(closer.as_ref(), &config).await;
        }
        Err(err) => error!(error = %err, "failed to install signal handlers"),
    }
}

/// Closes `closer` within the configured timeout, reporting failures to the
/// error callback.
pub async fn close_gracefully(closer: &dyn Closer, config: &ShutdownConfig) {
    let ctx = Context::background().with_timeout(config.timeout);
    match closer.close(&ctx).await {
        Ok(()) => info!("closed gracefully"),
        Err(CloseError::AlreadyClosed) => debug!("closer was already closed"),
        Err(err) => (config.on_error)(err),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    use super::*;
    use crate::listener::closer::{CloseGuard, Closed, CloserState};

    struct TestCloser {
        guard: CloseGuard,
        fail: bool,
        hang: bool,
    }

    impl TestCloser {
        fn new() -> Self {
            Self {
                guard: CloseGuard::new(),
                fail: false,
                hang: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl Closer for TestCloser {
        async fn close(&self, ctx: &Context) -> Result<(), CloseError> {
            self.guard.begin()?;
            let outcome = if self.hang {
                ctx.done().await;
                Err(CloseError::DeadlineExceeded(None))
            } else if self.fail {
                Err(CloseError::channel(anyhow::anyhow!("connection reset")))
            } else {
                Ok(())
            };
            self.guard.finish(outcome)
        }

        fn closed(&self) -> Closed {
            self.guard.closed()
        }

        fn state(&self) -> CloserState {
            self.guard.state()
        }
    }

    fn recording() -> (ShutdownErrorCallback, Arc<Mutex<Vec<String>>>) {
        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&errors);
        let callback: ShutdownErrorCallback = Arc::new(move |err: CloseError| {
            sink.lock().push(err.to_string());
        });
        (callback, errors)
    }

    #[test]
    fn defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.signals, vec![Signal::Interrupt]);
    }

    #[test]
    fn options_override_defaults() {
        let config = ShutdownOptions::default()
            .timeout(Duration::from_secs(5))
            .signals([Signal::Terminate, Signal::User1])
            .resolve();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.signals, vec![Signal::Terminate, Signal::User1]);

        let config = ShutdownOptions::default().resolve();
        assert_eq!(config.timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(config.signals, vec![Signal::Interrupt]);
    }

    #[test]
    fn zero_timeout_keeps_the_default() {
        let config = ShutdownOptions::default()
            .timeout(Duration::ZERO)
            .resolve();
        assert_eq!(config.timeout, DEFAULT_SHUTDOWN_TIMEOUT);

        let options: ShutdownOptions =
            serde_json::from_str(r#"{ "timeout": { "secs": 0, "nanos": 0 } }"#).unwrap();
        assert_eq!(options.timeout, Some(Duration::ZERO));
        assert_eq!(options.resolve().timeout, DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[test]
    fn options_deserialize() {
        let options: ShutdownOptions =
            serde_json::from_str(r#"{ "signals": ["terminate", "hangup"] }"#).unwrap();
        assert_eq!(options.signals, vec![Signal::Terminate, Signal::Hangup]);
        assert!(options.timeout.is_none());
        assert!(options.on_error.is_none());
    }

    #[tokio::test]
    async fn trigger_closes_the_closer() {
        let closer = Arc::new(TestCloser::new());
        let (on_error, errors) = recording();
        let config = ShutdownOptions::default().resolve();
        let config = ShutdownConfig { on_error, ..config };
        let coordinator = ShutdownCoordinator::new(closer.clone(), config);
        assert_eq!(coordinator.phase(), ShutdownPhase::Idle);

        let (tx, rx) = oneshot::channel::<()>();
        let handle = coordinator
            .spawn_with(async move { rx.await.is_ok() })
            .unwrap();
        assert_eq!(coordinator.phase(), ShutdownPhase::Waiting);
        assert_eq!(closer.state(), CloserState::Active);

        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(coordinator.phase(), ShutdownPhase::Finished);
        assert_eq!(closer.state(), CloserState::Closed);
        assert!(closer.closed().await.is_ok());
        assert!(errors.lock().is_empty());
    }

    #[tokio::test]
    async fn arms_only_once() {
        let coordinator = ShutdownCoordinator::new(
            Arc::new(TestCloser::new()),
            ShutdownOptions::default().resolve(),
        );
        let first = coordinator.spawn_with(async { false });
        assert!(first.is_some());
        assert!(coordinator.spawn_with(async { true }).is_none());
        assert!(coordinator.spawn().is_none());
    }

    #[tokio::test]
    async fn close_failure_goes_to_the_callback() {
        let closer = Arc::new(TestCloser {
            fail: true,
            ..TestCloser::new()
        });
        let (on_error, errors) = recording();
        let coordinator = ShutdownCoordinator::new(
            closer,
            ShutdownOptions::default()
                .on_error(move |err| on_error(err))
                .resolve(),
        );

        coordinator.spawn_with(async { true }).unwrap().await.unwrap();
        assert_eq!(*errors.lock(), vec!["failed to close channel".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_bounded_by_the_timeout() {
        let closer = Arc::new(TestCloser {
            hang: true,
            ..TestCloser::new()
        });
        let (on_error, errors) = recording();
        let config = ShutdownConfig {
            timeout: Duration::from_millis(250),
            signals: vec![Signal::Interrupt],
            on_error,
        };

        close_gracefully(closer.as_ref(), &config).await;
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].starts_with("deadline exceeded"));
    }

    #[tokio::test]
    async fn already_closed_is_not_a_failure() {
        let closer = Arc::new(TestCloser::new());
        closer.close(&Context::background()).await.unwrap();

        let (on_error, errors) = recording();
        let config = ShutdownConfig {
            on_error,
            ..ShutdownConfig::default()
        };
        close_gracefully(closer.as_ref(), &config).await;
        assert!(errors.lock().is_empty());
    }
}
