use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use fanout_api::{
    Consumer, ConsumerContext, DropFn, FormatterChain, Message, MessageRouter, PluginControl, PluginError,
    Producer, StreamId,
};
use fanout_pipeline::{ProducerContext, ProducerCore};
use fanout_router::{DropReceiver, DropSender, Router, RouterStats, drop_queue};

use crate::config::{ProducerConfig, ServeArgs, ServerConfig, config_json};
use crate::error::ServerError;
use crate::registry::Registry;

/// Собранный граф: producers, router с drop-очередью и consumers.
pub struct Wiring {
    pub router: Arc<Router>,
    pub drops: DropReceiver,
    pub producers: Vec<Arc<dyn Producer>>,
    pub consumers: Vec<Arc<dyn Consumer>>,
}

/// Shutdown deadlines.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// How long stopped consumers get before they are aborted.
    pub consumer_grace: Duration,
    /// How long producers get to drain before they are aborted.
    pub producer_drain: Duration,
}

impl Timing {
    pub fn from_config(config: &ServerConfig) -> Self {
        let grace = Duration::from_millis(config.router.shutdown_grace_ms);
        Self {
            consumer_grace: grace,
            producer_drain: Duration::from_millis(config.max_shutdown_timeout_ms()) + grace,
        }
    }
}

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("fanout-server starting");

    let config = ServerConfig::load(&args.config)?;
    tracing::info!(config = %args.config, "loaded config");

    let wiring = wire(&config, &Registry::builtin())?;
    supervise(wiring, Timing::from_config(&config), tokio::signal::ctrl_c()).await?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  Wiring
// ═══════════════════════════════════════════════════════════════

/// Build everything in dependency order: drop queue, producers, router,
/// consumers. Nothing is started yet.
pub fn wire(config: &ServerConfig, registry: &Registry) -> Result<Wiring, ServerError> {
    let (drops, drop_rx) = drop_queue(config.router.drop_buffer);

    let mut producers = Vec::with_capacity(config.producers.len());
    for producer_cfg in &config.producers {
        producers.push(build_producer(producer_cfg, registry, &drops)?);
    }

    let mut builder = Router::builder(drops)
        .enqueue_timeout(config.router.enqueue_timeout_ms.map(Duration::from_millis));
    for stream in &config.streams {
        builder = builder.distribution(StreamId::new(&stream.name), stream.distribution);
    }
    for producer in &producers {
        builder = builder.producer(producer.clone())?;
    }
    let router = Arc::new(builder.build());

    let default_drop = StreamId::new(&config.router.drop_stream);
    let mut consumers = Vec::with_capacity(config.consumers.len());
    for consumer_cfg in &config.consumers {
        let factory = registry.consumer(&consumer_cfg.plugin)?;
        let ctx = ConsumerContext {
            name: consumer_cfg.name.clone(),
            stream: StreamId::new(&consumer_cfg.stream),
            drop_stream: consumer_cfg.drop_stream.as_deref().map_or_else(|| default_drop.clone(), StreamId::new),
        };
        let consumer = factory(ctx, &config_json(&consumer_cfg.config)?).map_err(|source| ServerError::Plugin {
            component: "consumer",
            name: consumer_cfg.name.clone(),
            source,
        })?;
        tracing::info!(
            consumer = %consumer_cfg.name,
            plugin = %consumer_cfg.plugin,
            stream = %consumer_cfg.stream,
            "consumer created"
        );
        consumers.push(consumer);
    }

    Ok(Wiring { router, drops: drop_rx, producers, consumers })
}

fn build_producer(
    cfg: &ProducerConfig,
    registry: &Registry,
    drops: &DropSender,
) -> Result<Arc<dyn Producer>, ServerError> {
    let factory = registry.producer(&cfg.plugin)?;
    let batch = cfg.batch.resolve().map_err(|source| ServerError::Batch { name: cfg.name.clone(), source })?;
    let plugin_err =
        |source: PluginError| ServerError::Plugin { component: "producer", name: cfg.name.clone(), source };

    let mut formatters = FormatterChain::default();
    for formatter_cfg in &cfg.formatters {
        let make = registry.formatter(&formatter_cfg.plugin)?;
        formatters.push(make(&config_json(&formatter_cfg.config)?).map_err(plugin_err)?);
    }

    // Per-producer drop stream overrides the one stamped at ingress.
    let dropper: DropFn = match &cfg.drop_stream {
        Some(stream) => {
            let stream = StreamId::new(stream);
            let sender = drops.clone();
            Arc::new(move |msg: Message| sender.send(msg.with_drop_stream(stream.clone())))
        }
        None => drops.dropper(),
    };

    let streams = cfg.streams.iter().map(StreamId::new).collect();
    let core = ProducerCore::new(&cfg.name, streams, dropper).with_overflow(cfg.overflow);
    let producer = factory(ProducerContext { core, batch, formatters }, &config_json(&cfg.config)?)
        .map_err(plugin_err)?;

    tracing::info!(
        producer = %cfg.name,
        plugin = %cfg.plugin,
        streams = ?cfg.streams,
        max_count = batch.max_count,
        flush_count = batch.flush_count,
        overflow = ?cfg.overflow,
        "producer created"
    );
    Ok(producer)
}

// ═══════════════════════════════════════════════════════════════
//  Supervision
// ═══════════════════════════════════════════════════════════════

/// Start everything, wait for `shutdown` or for every consumer to finish,
/// then stop consumers, drain producers and stop the drop loop.
pub async fn supervise<S>(wiring: Wiring, timing: Timing, shutdown: S) -> Result<RouterStats, ServerError>
where
    S: Future<Output = io::Result<()>>,
{
    let Wiring { router, drops, producers, consumers } = wiring;

    let drop_cancel = CancellationToken::new();
    let drop_loop = {
        let router = router.clone();
        let cancel = drop_cancel.clone();
        tokio::spawn(async move { router.run_drop_loop(drops, cancel).await })
    };

    let mut producer_tasks = JoinSet::new();
    for producer in &producers {
        let producer = producer.clone();
        producer_tasks.spawn(async move { producer.produce().await });
    }

    let mut consumer_tasks = JoinSet::new();
    let message_router: Arc<dyn MessageRouter> = router.clone();
    for consumer in &consumers {
        let consumer = consumer.clone();
        let router = message_router.clone();
        consumer_tasks.spawn(async move {
            let result = consumer.consume(router).await;
            (consumer.name().to_string(), result)
        });
    }

    tracing::info!(producers = producers.len(), consumers = consumers.len(), "server ready");

    tokio::select! {
        res = shutdown => {
            res?;
            tracing::info!("shutting down...");
        }
        _ = join_consumers(&mut consumer_tasks) => {
            tracing::info!("all consumers finished, shutting down...");
        }
    }

    // --- Consumers ---
    for consumer in &consumers {
        if let Err(e) = consumer.control(PluginControl::StopConsumer) {
            tracing::warn!(consumer = consumer.name(), error = %e, "stop command failed");
        }
    }
    if tokio::time::timeout(timing.consumer_grace, join_consumers(&mut consumer_tasks)).await.is_err() {
        tracing::warn!(remaining = consumer_tasks.len(), "consumers did not stop in time, aborting");
        consumer_tasks.abort_all();
    }

    // --- Producers ---
    for producer in &producers {
        if let Err(e) = producer.control(PluginControl::StopProducer) {
            tracing::warn!(producer = producer.name(), error = %e, "stop command failed");
        }
    }
    let drained = tokio::time::timeout(timing.producer_drain, async {
        while let Some(res) = producer_tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "producer task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = producer_tasks.len(), "producers did not stop in time, aborting");
        producer_tasks.abort_all();
    }

    // --- Drop loop ---
    drop_cancel.cancel();
    if let Err(e) = drop_loop.await {
        tracing::error!(error = %e, "drop loop failed");
    }

    let stats = router.stats();
    tracing::info!(
        routed = stats.routed,
        unrouted = stats.unrouted,
        discarded = stats.discarded,
        "shutdown complete"
    );
    Ok(stats)
}

async fn join_consumers(tasks: &mut JoinSet<(String, Result<(), PluginError>)>) {
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok((name, Ok(()))) => tracing::info!(consumer = %name, "consumer finished"),
            Ok((name, Err(e))) => tracing::error!(consumer = %name, error = %e, "consumer failed"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!(error = %e, "consumer task failed"),
        }
    }
}
