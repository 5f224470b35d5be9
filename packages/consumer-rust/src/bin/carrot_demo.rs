// Demo consumer: routes deliveries from several queues of the in-memory broker
// through a Router, a Sink of ConsumerListeners and graceful shutdown.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use carrot_consumer::middleware::{TimeoutLayer, TraceLayer};
use carrot_consumer::{
    handler_fn, middleware, ConsumerListener, Context, DispatchPolicy, HandlerError, Listener,
    ListenerConfig, Router, Runner, RunnerConfig, ShutdownOptions, Signal, Sink,
};
use carrot_core::{Delivery, MemoryConnection};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Dispatch {
    Unbounded,
    Sequential,
    Bounded,
}

#[derive(Parser, Debug)]
#[command(name = "carrot-demo")]
#[command(about = "Consumes from an in-memory broker until every message is resolved")]
struct Args {
    /// Number of queues, one listener each
    #[arg(long, default_value_t = 2)]
    queues: usize,

    /// Messages published, spread round-robin over the queues
    #[arg(long, default_value_t = 20)]
    messages: usize,

    /// How each listener runs its handlers
    #[arg(long, value_enum, default_value_t = Dispatch::Unbounded)]
    dispatch: Dispatch,

    /// In-flight limit for `--dispatch bounded`
    #[arg(long, default_value_t = 4)]
    limit: usize,

    /// Simulated work per delivery in milliseconds
    #[arg(long, default_value_t = 50)]
    work_ms: u64,

    /// Handler timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,

    /// Fail every Nth delivery
    #[arg(long)]
    fail_every: Option<u64>,

    /// Time allowed for the final close in seconds
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,

    /// Emit logs as JSON
    #[arg(long, env = "CARROT_LOG_JSON")]
    json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn router(args: &Args, queues: &[String]) -> Router {
    let router = Router::new();
    router.layer(middleware(TraceLayer));

    let work = Duration::from_millis(args.work_ms);
    let fail_every = args.fail_every;
    let timed = router.with([middleware(TimeoutLayer::new(Duration::from_millis(
        args.timeout_ms,
    )))]);

    for queue in queues {
        timed.bind(
            queue.clone(),
            handler_fn(move |ctx: Context, delivery: Delivery| async move {
                tokio::select! {
                    () = tokio::time::sleep(work) => {}
                    err = ctx.done() => return Err(HandlerError::failed(err)),
                }
                if fail_every.is_some_and(|n| n > 0 && delivery.delivery_tag % n == 0) {
                    return Err(HandlerError::Failed(anyhow::anyhow!(
                        "simulated failure for delivery {}",
                        delivery.delivery_tag
                    )));
                }
                info!(
                    consumer_tag = %delivery.consumer_tag,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "processed"
                );
                Ok(())
            }),
        );
    }
    router
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let queues: Vec<String> = (0..args.queues.max(1)).map(|i| format!("queue-{i}")).collect();
    let policy = match args.dispatch {
        Dispatch::Unbounded => DispatchPolicy::Unbounded,
        Dispatch::Sequential => DispatchPolicy::Sequential,
        Dispatch::Bounded => DispatchPolicy::Bounded(args.limit),
    };

    let listeners: Vec<Arc<dyn Listener>> = queues
        .iter()
        .map(|queue| {
            let config = ListenerConfig::new(queue.as_str())
                .title(format!("demo consumer for {queue}"))
                .dispatch(policy);
            Arc::new(ConsumerListener::new(config)) as Arc<dyn Listener>
        })
        .collect();
    let sink = Sink::new(listeners).context("at least one queue is required")?;

    let connection = Arc::new(MemoryConnection::new());
    let runner = Runner::new(RunnerConfig {
        connection: Some(connection.clone()),
        listener: Some(Arc::new(sink)),
        handler: Some(Arc::new(router(&args, &queues))),
        shutdown: Some(
            ShutdownOptions::default()
                .timeout(Duration::from_secs(args.shutdown_timeout))
                .signals([Signal::Interrupt, Signal::Terminate]),
        ),
    });
    let closer = runner.run().await?.context("runner has nothing to consume")?;

    let channel = connection
        .channels()
        .first()
        .cloned()
        .context("runner opened no channel")?;
    for i in 0..args.messages {
        let queue = &queues[i % queues.len()];
        channel.publish(queue, format!("message {i}"))?;
    }
    info!(messages = args.messages, queues = queues.len(), "published");

    tokio::select! {
        completions = channel.wait_for_completions(args.messages) => {
            let acked = completions.iter().filter(|c| c.is_ack()).count();
            info!(acked, failed = completions.len() - acked, "all deliveries resolved");
        }
        outcome = closer.closed().wait() => {
            info!(?outcome, "closed by signal");
            return Ok(());
        }
    }

    let ctx = Context::background().with_timeout(Duration::from_secs(args.shutdown_timeout));
    match closer.close(&ctx).await {
        Err(err) if !err.is_already_closed() => Err(err.into()),
        _ => {
            info!("shut down");
            Ok(())
        }
    }
}
