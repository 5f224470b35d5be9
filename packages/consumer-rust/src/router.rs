//! Delivery routing: dispatches a `Delivery` to the handler bound to its consumer tag.
//!
//! Routers derived from one another through [`Router::with`] and
//! [`Router::group`] share a single binding registry but own separate
//! middleware scopes. Scopes form a tree: the stack applied to a binding is
//! the stack of every ancestor scope followed by the stack of the scope the
//! binding was made in, read at dispatch time.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use carrot_core::Delivery;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::context::Context;
use crate::handler::{apply, BoxHandler, Handler, HandlerError, Middleware};

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// One level of the middleware tree.
struct Scope {
    parent: Option<Arc<Scope>>,
    stack: ArcSwap<Vec<Middleware>>,
}

impl Scope {
    fn root() -> Self {
        Self {
            parent: None,
            stack: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn child(parent: &Arc<Scope>, stack: Vec<Middleware>) -> Self {
        Self {
            parent: Some(Arc::clone(parent)),
            stack: ArcSwap::from_pointee(stack),
        }
    }

    fn push(&self, middleware: &Middleware) {
        self.stack.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(middleware));
            next
        });
    }

    /// Ancestors first, so parent middleware ends up outermost.
    fn effective_stack(&self) -> Vec<Middleware> {
        let mut stack = self
            .parent
            .as_ref()
            .map(|parent| parent.effective_stack())
            .unwrap_or_default();
        stack.extend(self.stack.load().iter().cloned());
        stack
    }
}

#[derive(Clone)]
struct Binding {
    handler: BoxHandler,
    scope: Arc<Scope>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes deliveries to handlers by consumer tag and resolves them.
///
/// On success the delivery is acknowledged together with every earlier
/// unacknowledged delivery on its channel; on failure it is negatively
/// acknowledged and requeued. Deliveries with no bound handler are rejected
/// and requeued.
#[derive(Clone)]
pub struct Router {
    bindings: Arc<DashMap<String, Binding>>,
    scope: Arc<Scope>,
}

impl Router {
    /// Create a new empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bindings: Arc::new(DashMap::new()),
            scope: Arc::new(Scope::root()),
        }
    }

    /// Bind `handler` to `consumer_tag`, replacing any previous binding.
    pub fn bind<H: Handler>(&self, consumer_tag: impl Into<String>, handler: H) -> &Self {
        self.bind_optional(consumer_tag, Some(Arc::new(handler) as BoxHandler))
    }

    /// Bind an optional handler. `None` leaves the router untouched.
    pub fn bind_optional(
        &self,
        consumer_tag: impl Into<String>,
        handler: Option<BoxHandler>,
    ) -> &Self {
        let Some(handler) = handler else {
            return self;
        };

        let consumer_tag = consumer_tag.into();
        debug!(consumer_tag = %consumer_tag, "handler bound");
        self.bindings.insert(
            consumer_tag,
            Binding {
                handler,
                scope: Arc::clone(&self.scope),
            },
        );
        self
    }

    /// Append `middleware` to this router's scope. Applies to every binding
    /// made in this scope or in a scope derived from it, including bindings
    /// made before the call.
    pub fn layer(&self, middleware: Middleware) -> &Self {
        self.scope.push(&middleware);
        self
    }

    /// A router sharing this router's bindings whose scope adds `middlewares`
    /// on top of this router's stack.
    #[must_use]
    pub fn with(&self, middlewares: impl IntoIterator<Item = Middleware>) -> Router {
        Self {
            bindings: Arc::clone(&self.bindings),
            scope: Arc::new(Scope::child(&self.scope, middlewares.into_iter().collect())),
        }
    }

    /// Run `f` against a fresh child scope and return it.
    pub fn group<F>(&self, f: F) -> Router
    where
        F: FnOnce(&Router),
    {
        let child = self.with(Vec::new());
        f(&child);
        child
    }

    /// Returns `true` if a handler is bound to `consumer_tag`.
    #[must_use]
    pub fn contains(&self, consumer_tag: &str) -> bool {
        self.bindings.contains_key(consumer_tag)
    }

    /// Number of bound consumer tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn lookup(&self, consumer_tag: &str) -> Option<Binding> {
        self.bindings
            .get(consumer_tag)
            .map(|entry| entry.value().clone())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, ctx: Context, delivery: Delivery) -> Result<(), HandlerError> {
        let Some(binding) = self.lookup(&delivery.consumer_tag) else {
            warn!(
                consumer_tag = %delivery.consumer_tag,
                delivery_tag = delivery.delivery_tag,
                "no handler bound, requeueing delivery"
            );
            if !delivery.is_resolved() {
                if let Err(err) = delivery.reject(true).await {
                    warn!(delivery_tag = delivery.delivery_tag, error = %err, "failed to reject delivery");
                }
            }
            return Err(HandlerError::NoHandler {
                consumer_tag: delivery.consumer_tag.clone(),
            });
        };

        let handler = apply(binding.handler, &binding.scope.effective_stack());
        let result = handler.handle(ctx, delivery.clone()).await;

        if delivery.is_resolved() {
            return result;
        }

        match result {
            Ok(()) => {
                delivery.ack(true).await?;
                Ok(())
            }
            Err(err) => {
                if let Err(nack_err) = delivery.nack(false, true).await {
                    warn!(
                        delivery_tag = delivery.delivery_tag,
                        error = %nack_err,
                        "failed to requeue delivery"
                    );
                }
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
