use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fanout_api::{BoxFuture, Message, PluginControl, PluginError, PluginState, Producer, StreamId};
use fanout_pipeline::{ProducerContext, ProducerCore, ProducerHandler};

/// Принимает всё и ничего не пишет. Полезен для замеров и как заглушка.
pub struct NullProducer {
    core: ProducerCore,
    discarded: AtomicU64,
}

impl NullProducer {
    pub fn new(core: ProducerCore) -> Self {
        Self { core, discarded: AtomicU64::new(0) }
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

struct Idle;

impl ProducerHandler for Idle {
    fn tick_interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn on_tick(&mut self, _core: &ProducerCore) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_flush(&mut self, _core: &ProducerCore) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn close(&mut self, _core: &ProducerCore) -> impl Future<Output = ()> + Send {
        async {}
    }
}

impl Producer for NullProducer {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn streams(&self) -> &[StreamId] {
        self.core.streams()
    }

    fn state(&self) -> PluginState {
        self.core.state()
    }

    fn control(&self, command: PluginControl) -> Result<(), PluginError> {
        self.core.control(command)
    }

    fn enqueue(&self, _msg: Message, _timeout: Option<Duration>) -> BoxFuture<'_, ()> {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        Box::pin(async {})
    }

    fn produce(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.core.run(&mut Idle).await;
            tracing::debug!(producer = %self.core.name(), discarded = self.discarded(), "null producer done");
        })
    }
}

pub fn create(ctx: ProducerContext, _config: &serde_json::Value) -> Result<Arc<dyn Producer>, PluginError> {
    Ok(Arc::new(NullProducer::new(ctx.core)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_everything_and_stops_on_command() {
        let core = ProducerCore::new("null", vec![StreamId::wildcard()], Arc::new(|_msg: Message| {}));
        let producer = Arc::new(NullProducer::new(core));

        for seq in 0..100 {
            producer.enqueue(Message::new("x", StreamId::new("logs"), seq), None).await;
        }
        producer.control(PluginControl::StopProducer).unwrap();
        producer.produce().await;

        assert_eq!(producer.discarded(), 100);
        assert_eq!(producer.state(), PluginState::Stopped);
    }
}
