//! Single-queue listener.
//!
//! [`ConsumerListener::listen`] opens a subscription and spawns a serve loop
//! that pulls deliveries and hands each one to the handler according to the
//! configured [`DispatchPolicy`]. After the handler returns, the success or
//! error callback runs with the exact delivery (and the error). The default
//! callbacks ack on success and nack-with-requeue on failure, and both leave
//! deliveries that are already resolved alone.
//!
//! Closing cancels the subscription by closing the channel, then waits until
//! the serve loop has drained its in-flight handlers.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use carrot_core::{Channel, Connection, Delivery, DeliveryStream};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use super::closer::{shared, CloseError, CloseGuard, Closed, Closer, CloserState};
use super::config::{DispatchPolicy, ListenerConfig};
use super::{ListenError, Listener};
use crate::context::Context;
use crate::handler::{BoxHandler, HandlerError};

/// Callback run after the handler succeeded.
pub type SuccessCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback run after the handler failed.
pub type ErrorCallback =
    Arc<dyn Fn(Delivery, HandlerError) -> BoxFuture<'static, ()> + Send + Sync>;

// ---------------------------------------------------------------------------
// ConsumerListener
// ---------------------------------------------------------------------------

/// Listener consuming a single queue.
#[derive(Clone)]
pub struct ConsumerListener {
    config: ListenerConfig,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl ConsumerListener {
    #[must_use]
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            on_success: None,
            on_error: None,
        }
    }

    /// Listener on `queue` with default settings.
    pub fn queue(queue: impl Into<String>) -> Self {
        Self::new(ListenerConfig::new(queue))
    }

    /// Replaces the default success callback (`ack(false)`).
    #[must_use]
    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_success = Some(Arc::new(move |delivery| f(delivery).boxed()));
        self
    }

    /// Replaces the default error callback (`nack(false, true)`).
    #[must_use]
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Delivery, HandlerError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |delivery, err| f(delivery, err).boxed()));
        self
    }

    #[must_use]
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }
}

impl std::fmt::Debug for ConsumerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerListener")
            .field("config", &self.config)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[async_trait]
impl Listener for ConsumerListener {
    async fn listen(
        &self,
        _conn: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
        handler: BoxHandler,
    ) -> Result<Arc<dyn Closer>, ListenError> {
        let args = self.config.consume_args();
        let stream = channel
            .consume(&args)
            .await
            .map_err(|source| ListenError::Consume {
                queue: args.queue.clone(),
                source,
            })?;

        info!(
            queue = %args.queue,
            consumer_tag = %args.consumer_tag,
            title = self.config.title.as_deref().unwrap_or_default(),
            dispatch = ?self.config.dispatch,
            "listening"
        );

        let stopped = CancellationToken::new();
        let dispatcher = Dispatcher {
            handler,
            consumer_tag: Arc::from(args.consumer_tag.as_str()),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        };
        let span = info_span!("serve", consumer_tag = %args.consumer_tag);
        tokio::spawn(
            serve(stream, dispatcher, self.config.dispatch, stopped.clone()).instrument(span),
        );

        Ok(Arc::new(Server {
            channel,
            consumer_tag: args.consumer_tag,
            guard: CloseGuard::new(),
            stopped,
        }))
    }
}

// ---------------------------------------------------------------------------
// Serve loop
// ---------------------------------------------------------------------------

/// Pulls deliveries until the subscription ends, then waits for every
/// spawned handler before cancelling `stopped`.
async fn serve(
    mut stream: DeliveryStream,
    dispatcher: Dispatcher,
    policy: DispatchPolicy,
    stopped: CancellationToken,
) {
    // Cancels on every exit path, including a panic in a sequential handler.
    let _stopped = stopped.drop_guard();
    let tracker = TaskTracker::new();
    let limiter = match policy {
        DispatchPolicy::Bounded(limit) => Some(Arc::new(Semaphore::new(limit.max(1)))),
        DispatchPolicy::Unbounded | DispatchPolicy::Sequential => None,
    };

    while let Some(delivery) = stream.next().await {
        match (policy, &limiter) {
            (DispatchPolicy::Sequential, _) => dispatcher.dispatch(delivery).await,
            (DispatchPolicy::Bounded(_), Some(limiter)) => {
                let Ok(permit) = Arc::clone(limiter).acquire_owned().await else {
                    break;
                };
                let dispatcher = dispatcher.clone();
                tracker.spawn(async move {
                    dispatcher.dispatch(delivery).await;
                    drop(permit);
                });
            }
            _ => {
                let dispatcher = dispatcher.clone();
                tracker.spawn(async move { dispatcher.dispatch(delivery).await });
            }
        }
    }

    debug!(in_flight = tracker.len(), "subscription ended, draining handlers");
    tracker.close();
    tracker.wait().await;
    debug!("serve loop stopped");
}

#[derive(Clone)]
struct Dispatcher {
    handler: BoxHandler,
    consumer_tag: Arc<str>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl Dispatcher {
    async fn dispatch(&self, delivery: Delivery) {
        let handled = AssertUnwindSafe(self.handler.handle(Context::background(), delivery.clone()))
            .catch_unwind()
            .await;
        let outcome = match handled {
            Ok(outcome) => outcome,
            Err(_panic) => Err(HandlerError::Failed(anyhow::anyhow!("handler panicked"))),
        };

        match outcome {
            Ok(()) => {
                self.count("ok");
                match &self.on_success {
                    Some(callback) => callback(delivery).await,
                    None => acknowledge(delivery).await,
                }
            }
            Err(err) => {
                self.count("error");
                match &self.on_error {
                    Some(callback) => callback(delivery, err).await,
                    None => requeue(delivery, err).await,
                }
            }
        }
    }

    fn count(&self, outcome: &'static str) {
        metrics::counter!(
            "carrot_deliveries_total",
            "consumer" => self.consumer_tag.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

async fn acknowledge(delivery: Delivery) {
    if delivery.is_resolved() {
        return;
    }
    if let Err(err) = delivery.ack(false).await {
        warn!(delivery_tag = delivery.delivery_tag, error = %err, "failed to ack delivery");
    }
}

async fn requeue(delivery: Delivery, err: HandlerError) {
    debug!(delivery_tag = delivery.delivery_tag, error = %err, "handler failed");
    if delivery.is_resolved() {
        return;
    }
    if let Err(err) = delivery.nack(false, true).await {
        warn!(delivery_tag = delivery.delivery_tag, error = %err, "failed to nack delivery");
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// [`Closer`] of a running serve loop.
struct Server {
    channel: Arc<dyn Channel>,
    consumer_tag: String,
    guard: CloseGuard,
    stopped: CancellationToken,
}

#[async_trait]
impl Closer for Server {
    async fn close(&self, ctx: &Context) -> Result<(), CloseError> {
        self.guard.begin()?;
        debug!(consumer_tag = %self.consumer_tag, "closing listener");

        let closed = self.channel.close().await.map_err(shared);
        let outcome = tokio::select! {
            () = self.stopped.cancelled() => closed.map_err(CloseError::Channel),
            _ = ctx.done() => Err(CloseError::DeadlineExceeded(closed.err())),
        };

        match &outcome {
            Ok(()) => info!(consumer_tag = %self.consumer_tag, "listener closed"),
            Err(err) => warn!(consumer_tag = %self.consumer_tag, error = %err, "listener close failed"),
        }
        self.guard.finish(outcome)
    }

    fn closed(&self) -> Closed {
        self.guard.closed()
    }

    fn state(&self) -> CloserState {
        self.guard.state()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use carrot_core::{Completion, MemoryChannel, MemoryConnection};
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::handler::{boxed, handler_fn};

    fn ok_handler() -> BoxHandler {
        boxed(handler_fn(|_ctx, _delivery| async { Ok(()) }))
    }

    fn failing_handler() -> BoxHandler {
        boxed(handler_fn(|_ctx, _delivery| async {
            Err(HandlerError::Failed(anyhow::anyhow!("boom")))
        }))
    }

    async fn start(
        listener: &ConsumerListener,
        handler: BoxHandler,
    ) -> (Arc<MemoryChannel>, Arc<dyn Closer>) {
        let conn = Arc::new(MemoryConnection::new());
        let channel = conn.open();
        let closer = listener.listen(conn, channel.clone(), handler).await.unwrap();
        (channel, closer)
    }

    #[tokio::test]
    async fn success_acks_by_default() {
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, ok_handler()).await;

        let tag = channel.publish("jobs", "a").unwrap();
        let completions = channel.wait_for_completions(1).await;
        assert_eq!(
            completions,
            vec![Completion::Ack {
                delivery_tag: tag,
                multiple: false
            }]
        );

        closer.close(&Context::background()).await.unwrap();
    }

    #[tokio::test]
    async fn failure_nacks_with_requeue_by_default() {
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, failing_handler()).await;

        let tag = channel.publish("jobs", "a").unwrap();
        let completions = channel.wait_for_completions(1).await;
        assert_eq!(
            completions,
            vec![Completion::Nack {
                delivery_tag: tag,
                multiple: false,
                requeue: true
            }]
        );

        closer.close(&Context::background()).await.unwrap();
    }

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("invalid payload at byte {offset}")]
    struct InvalidPayload {
        offset: usize,
    }

    /// Handler that records every delivery it sees and fails with `fail` if set.
    fn recording_handler(fail: Option<usize>) -> (BoxHandler, Arc<Mutex<Vec<Delivery>>>) {
        let handled: Arc<Mutex<Vec<Delivery>>> = Arc::default();
        let seen = Arc::clone(&handled);
        let handler = boxed(handler_fn(move |_ctx, delivery: Delivery| {
            seen.lock().push(delivery);
            async move {
                match fail {
                    Some(offset) => Err(HandlerError::failed(InvalidPayload { offset })),
                    None => Ok(()),
                }
            }
        }));
        (handler, handled)
    }

    #[tokio::test]
    async fn error_callback_receives_the_handled_delivery_and_error() {
        let failures: Arc<Mutex<Vec<(Delivery, HandlerError)>>> = Arc::default();
        let successes: Arc<Mutex<Vec<Delivery>>> = Arc::default();
        let notify = Arc::new(Notify::new());

        let listener = ConsumerListener::queue("jobs")
            .on_success({
                let successes = Arc::clone(&successes);
                move |delivery: Delivery| {
                    successes.lock().push(delivery);
                    async {}
                }
            })
            .on_error({
                let failures = Arc::clone(&failures);
                let notify = Arc::clone(&notify);
                move |delivery: Delivery, err: HandlerError| {
                    failures.lock().push((delivery, err));
                    notify.notify_one();
                    async {}
                }
            });
        let (handler, handled) = recording_handler(Some(7));
        let (channel, closer) = start(&listener, handler).await;

        let tag = channel.publish("jobs", "payload").unwrap();
        notify.notified().await;

        let handled = handled.lock().clone();
        let failures = failures.lock();
        assert_eq!(handled.len(), 1);
        assert_eq!(failures.len(), 1);
        let (delivery, err) = &failures[0];
        assert_eq!(delivery, &handled[0]);
        assert_eq!(delivery.delivery_tag, tag);
        assert_eq!(&delivery.body[..], b"payload");
        assert_eq!(
            err.downcast_ref::<InvalidPayload>(),
            Some(&InvalidPayload { offset: 7 })
        );
        assert!(successes.lock().is_empty());
        // The custom callback replaced the default nack.
        assert!(!delivery.is_resolved());
        assert!(channel.completions().is_empty());
        drop(failures);

        closer.close(&Context::background()).await.unwrap();
    }

    #[tokio::test]
    async fn success_callback_receives_the_handled_delivery() {
        let successes: Arc<Mutex<Vec<Delivery>>> = Arc::default();
        let failures = Arc::new(Mutex::new(0_usize));

        let listener = ConsumerListener::queue("jobs")
            .on_success({
                let successes = Arc::clone(&successes);
                move |delivery: Delivery| {
                    successes.lock().push(delivery.clone());
                    async move {
                        delivery.reject(false).await.unwrap();
                    }
                }
            })
            .on_error({
                let failures = Arc::clone(&failures);
                move |_delivery: Delivery, _err: HandlerError| {
                    *failures.lock() += 1;
                    async {}
                }
            });
        let (handler, handled) = recording_handler(None);
        let (channel, closer) = start(&listener, handler).await;

        let tag = channel.publish("jobs", "a").unwrap();
        let completions = channel.wait_for_completions(1).await;
        // The custom callback replaced the default ack.
        assert_eq!(
            completions,
            vec![Completion::Reject {
                delivery_tag: tag,
                requeue: false
            }]
        );

        let handled = handled.lock().clone();
        assert_eq!(handled.len(), 1);
        assert_eq!(*successes.lock(), handled);
        assert_eq!(*failures.lock(), 0);

        closer.close(&Context::background()).await.unwrap();
    }

    #[tokio::test]
    async fn resolved_deliveries_are_not_completed_twice() {
        let handler = boxed(handler_fn(|_ctx, delivery: Delivery| async move {
            delivery.ack(true).await?;
            Ok(())
        }));
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, handler).await;

        channel.publish("jobs", "a").unwrap();
        channel.wait_for_completions(1).await;
        closer.close(&Context::background()).await.unwrap();

        assert_eq!(channel.completions().len(), 1);
        assert!(matches!(
            channel.completions()[0],
            Completion::Ack { multiple: true, .. }
        ));
    }

    #[tokio::test]
    async fn auto_ack_deliveries_are_left_alone() {
        let listener = ConsumerListener::new(ListenerConfig::new("jobs").auto_ack(true));
        let handled = Arc::new(Notify::new());
        let handler = boxed(handler_fn({
            let handled = Arc::clone(&handled);
            move |_ctx, _delivery| {
                let handled = Arc::clone(&handled);
                async move {
                    handled.notify_one();
                    Ok(())
                }
            }
        }));
        let (channel, closer) = start(&listener, handler).await;

        channel.publish("jobs", "a").unwrap();
        handled.notified().await;
        closer.close(&Context::background()).await.unwrap();

        assert!(channel.completions().is_empty());
    }

    #[tokio::test]
    async fn consume_failure_is_reported() {
        let conn = Arc::new(MemoryConnection::new());
        let channel = conn.open();
        channel.fail_consume("jobs", "access refused");

        let err = ConsumerListener::queue("jobs")
            .listen(conn, channel, ok_handler())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ListenError::Consume { ref queue, .. } if queue == "jobs"));
    }

    #[tokio::test]
    async fn subscription_uses_configured_tag_and_flags() {
        let listener = ConsumerListener::new(
            ListenerConfig::new("jobs")
                .consumer_tag("jobs-worker")
                .exclusive(true),
        );
        let (channel, closer) = start(&listener, ok_handler()).await;

        let subscriptions = channel.subscriptions();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].consumer_tag, "jobs-worker");
        assert!(subscriptions[0].exclusive);

        closer.close(&Context::background()).await.unwrap();
    }

    #[tokio::test]
    async fn second_close_reports_already_closed() {
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, ok_handler()).await;

        closer.close(&Context::background()).await.unwrap();
        let err = closer.close(&Context::background()).await.unwrap_err();
        assert!(err.is_already_closed());
        assert_eq!(channel.close_calls(), 1);
        assert!(closer.closed().await.is_ok());
    }

    #[tokio::test]
    async fn close_error_is_propagated() {
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, ok_handler()).await;
        channel.fail_close("connection reset");

        let err = closer.close(&Context::background()).await.unwrap_err();
        assert!(matches!(err, CloseError::Channel(_)));
        assert!(matches!(closer.closed().await, Err(CloseError::Channel(_))));
        assert_eq!(closer.state(), CloserState::Closed);

        // A failed close still counts as the close.
        let err = closer.close(&Context::background()).await.unwrap_err();
        assert!(err.is_already_closed());
        assert_eq!(channel.close_calls(), 1);
        assert!(matches!(closer.closed().await, Err(CloseError::Channel(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_closes_close_once() {
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, ok_handler()).await;

        let mut closes = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let closer = Arc::clone(&closer);
            closes.spawn(async move { closer.close(&Context::background()).await });
        }

        let mut closed = 0;
        let mut already_closed = 0;
        while let Some(outcome) = closes.join_next().await {
            match outcome.unwrap() {
                Ok(()) => closed += 1,
                Err(err) if err.is_already_closed() => already_closed += 1,
                Err(err) => panic!("unexpected close error: {err}"),
            }
        }
        assert_eq!(closed, 1);
        assert_eq!(already_closed, 7);
        assert_eq!(channel.close_calls(), 1);
        assert!(closer.closed().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn state_follows_the_close() {
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let handler = boxed(handler_fn({
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            move |_ctx, _delivery| {
                let release = Arc::clone(&release);
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                }
            }
        }));
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, handler).await;
        assert_eq!(closer.state(), CloserState::Active);

        channel.publish("jobs", "a").unwrap();
        started.notified().await;

        let closing = tokio::spawn({
            let closer = Arc::clone(&closer);
            async move { closer.close(&Context::background()).await }
        });
        while closer.state() == CloserState::Active {
            tokio::task::yield_now().await;
        }
        // The in-flight handler holds the close open.
        assert_eq!(closer.state(), CloserState::Closing);

        release.notify_one();
        closing.await.unwrap().unwrap();
        assert_eq!(closer.state(), CloserState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_in_flight_handlers() {
        let finished = Arc::new(Mutex::new(false));
        let handler = boxed(handler_fn({
            let finished = Arc::clone(&finished);
            move |_ctx, _delivery| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    *finished.lock() = true;
                    Ok(())
                }
            }
        }));
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, handler).await;

        channel.publish("jobs", "a").unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        closer.close(&ctx).await.unwrap();
        assert!(*finished.lock());
        assert_eq!(channel.completions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_deadline_reports_deadline_exceeded() {
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let handler = boxed(handler_fn({
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            move |_ctx, _delivery| {
                let release = Arc::clone(&release);
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                }
            }
        }));
        let listener = ConsumerListener::queue("jobs");
        let (channel, closer) = start(&listener, handler).await;

        channel.publish("jobs", "a").unwrap();
        started.notified().await;

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let err = closer.close(&ctx).await.unwrap_err();
        assert!(matches!(err, CloseError::DeadlineExceeded(None)));
        assert_eq!(
            closer.closed().try_outcome().map(|outcome| outcome.is_err()),
            Some(true)
        );

        release.notify_one();
    }

    #[tokio::test]
    async fn sequential_policy_handles_in_order() {
        let order: Arc<Mutex<Vec<u64>>> = Arc::default();
        let handler = boxed(handler_fn({
            let order = Arc::clone(&order);
            move |_ctx, delivery: Delivery| {
                let order = Arc::clone(&order);
                async move {
                    // Later deliveries finish faster; order only holds if they never overlap.
                    let delay = 30_u64.saturating_sub(delivery.delivery_tag * 10);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    order.lock().push(delivery.delivery_tag);
                    Ok(())
                }
            }
        }));
        let listener =
            ConsumerListener::new(ListenerConfig::new("jobs").dispatch(DispatchPolicy::Sequential));
        let (channel, closer) = start(&listener, handler).await;

        for body in ["a", "b", "c"] {
            channel.publish("jobs", body).unwrap();
        }
        channel.wait_for_completions(3).await;
        closer.close(&Context::background()).await.unwrap();

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn bounded_policy_caps_concurrency() {
        let current = Arc::new(Mutex::new(0_usize));
        let peak = Arc::new(Mutex::new(0_usize));
        let handler = boxed(handler_fn({
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            move |_ctx, _delivery| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                async move {
                    {
                        let mut now = current.lock();
                        *now += 1;
                        let mut max = peak.lock();
                        *max = (*max).max(*now);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    *current.lock() -= 1;
                    Ok(())
                }
            }
        }));
        let listener =
            ConsumerListener::new(ListenerConfig::new("jobs").dispatch(DispatchPolicy::Bounded(2)));
        let (channel, closer) = start(&listener, handler).await;

        for _ in 0..8 {
            channel.publish("jobs", "x").unwrap();
        }
        channel.wait_for_completions(8).await;
        closer.close(&Context::background()).await.unwrap();

        assert!(*peak.lock() <= 2);
        assert!(channel.completions().iter().all(Completion::is_ack));
    }

    #[tokio::test]
    async fn panicking_handler_is_treated_as_failure() {
        let handler = boxed(handler_fn(|_ctx, delivery: Delivery| async move {
            assert!(delivery.body.is_empty(), "handler bug");
            Ok(())
        }));
        let listener = ConsumerListener::new(
            ListenerConfig::new("jobs").dispatch(DispatchPolicy::Sequential),
        );
        let (channel, closer) = start(&listener, handler).await;

        channel.publish("jobs", "a").unwrap();
        let completions = channel.wait_for_completions(1).await;
        assert!(matches!(
            completions[0],
            Completion::Nack { requeue: true, .. }
        ));

        closer.close(&Context::background()).await.unwrap();
    }
}
