pub mod drop;
pub mod error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use fanout_api::{BoxFuture, Message, MessageRouter, Producer, StreamId};

pub use drop::{DropReceiver, DropSender, drop_queue};
pub use error::RouterError;

// ═══════════════════════════════════════════════════════════════
//  Distribution
// ═══════════════════════════════════════════════════════════════

/// Как stream раздаёт сообщения своим producer'ам.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Каждый producer получает копию.
    #[default]
    Broadcast,
    /// Один producer на сообщение, по кругу.
    #[serde(alias = "roundrobin")]
    RoundRobin,
}

struct Route {
    distribution: Distribution,
    producers: Vec<Arc<dyn Producer>>,
    next: AtomicUsize,
}

impl Route {
    fn new(distribution: Distribution) -> Self {
        Self { distribution, producers: Vec::new(), next: AtomicUsize::new(0) }
    }
}

/// Counters exposed for shutdown reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub unrouted: u64,
    pub discarded: u64,
}

// ═══════════════════════════════════════════════════════════════
//  RouterBuilder
// ═══════════════════════════════════════════════════════════════

pub struct RouterBuilder {
    routes: HashMap<StreamId, Route>,
    wildcard: Vec<Arc<dyn Producer>>,
    names: Vec<String>,
    enqueue_timeout: Option<Duration>,
    drops: DropSender,
}

impl RouterBuilder {
    pub fn enqueue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn distribution(mut self, stream: StreamId, distribution: Distribution) -> Self {
        self.routes
            .entry(stream)
            .or_insert_with(|| Route::new(distribution))
            .distribution = distribution;
        self
    }

    /// Subscribe `producer` to every stream it lists.
    pub fn producer(mut self, producer: Arc<dyn Producer>) -> Result<Self, RouterError> {
        let name = producer.name().to_string();
        if self.names.contains(&name) {
            return Err(RouterError::DuplicateProducer(name));
        }
        if producer.streams().is_empty() {
            return Err(RouterError::NoStreams(name));
        }

        for stream in producer.streams() {
            if stream.is_wildcard() {
                self.wildcard.push(producer.clone());
            } else {
                self.routes
                    .entry(stream.clone())
                    .or_insert_with(|| Route::new(Distribution::default()))
                    .producers
                    .push(producer.clone());
            }
        }
        self.names.push(name);
        Ok(self)
    }

    pub fn build(self) -> Router {
        for (stream, route) in &self.routes {
            if route.producers.is_empty() && self.wildcard.is_empty() {
                tracing::warn!(%stream, "stream has no producers");
            }
        }
        Router {
            routes: self.routes,
            wildcard: self.wildcard,
            enqueue_timeout: self.enqueue_timeout,
            drops: self.drops,
            routed: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Router
// ═══════════════════════════════════════════════════════════════

/// Stream → producers. Wildcard subscribers see every stream except
/// messages travelling on their drop stream.
pub struct Router {
    routes: HashMap<StreamId, Route>,
    wildcard: Vec<Arc<dyn Producer>>,
    enqueue_timeout: Option<Duration>,
    drops: DropSender,
    routed: AtomicU64,
    unrouted: AtomicU64,
}

impl Router {
    pub fn builder(drops: DropSender) -> RouterBuilder {
        RouterBuilder {
            routes: HashMap::new(),
            wildcard: Vec::new(),
            names: Vec::new(),
            enqueue_timeout: None,
            drops,
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.routed.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            discarded: self.drops.discarded(),
        }
    }

    fn targets(&self, msg: &Message) -> (Distribution, Vec<Arc<dyn Producer>>, Option<&Route>) {
        let route = self.routes.get(msg.stream());
        let mut targets: Vec<Arc<dyn Producer>> =
            route.map(|r| r.producers.clone()).unwrap_or_default();
        let dropped = msg.is_dropped() || msg.stream().as_str() == StreamId::DROPPED;
        if !dropped {
            targets.extend(self.wildcard.iter().cloned());
        }
        let distribution = route.map(|r| r.distribution).unwrap_or_default();
        (distribution, targets, route)
    }

    /// Enqueue into every producer subscribed to `msg.stream()`.
    pub async fn route(&self, msg: Message) {
        let (distribution, targets, route) = self.targets(&msg);

        if targets.is_empty() {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(stream = %msg.stream(), seq = msg.sequence(), "no producer for stream, discarded");
            return;
        }
        self.routed.fetch_add(1, Ordering::Relaxed);

        match distribution {
            Distribution::Broadcast => {
                for producer in &targets {
                    producer.enqueue(msg.clone(), self.enqueue_timeout).await;
                }
            }
            Distribution::RoundRobin => {
                let next = route.map_or(0, |r| r.next.fetch_add(1, Ordering::Relaxed));
                let producer = &targets[next % targets.len()];
                producer.enqueue(msg, self.enqueue_timeout).await;
            }
        }
    }

    /// Re-route everything arriving on the drop queue until cancelled.
    pub async fn run_drop_loop(&self, mut queue: DropReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = queue.recv() => match msg {
                    Some(msg) => self.route(msg).await,
                    None => break,
                },
            }
        }

        queue.rx.close();
        let mut left = 0usize;
        while queue.rx.try_recv().is_ok() {
            left += 1;
        }
        if left > 0 {
            tracing::warn!(count = left, "drop loop stopped, queued messages discarded");
        }
    }
}

impl MessageRouter for Router {
    fn route(&self, msg: Message) -> BoxFuture<'_, ()> {
        Box::pin(Router::route(self, msg))
    }

    fn drop_message(&self, msg: Message) {
        self.drops.send(msg);
    }
}
