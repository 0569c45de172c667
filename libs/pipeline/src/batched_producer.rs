use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use fanout_api::{
    BatchedWriter, BoxFuture, FormatterChain, Message, PluginControl, PluginError, PluginState,
    Producer, StreamId,
};

use crate::DeliveryError;
use crate::assembly::Validator;
use crate::batch::{FlushReport, MessageBatch};
use crate::batched::BatchedWriterAssembly;
use crate::config::BatchSettings;
use crate::producer::{PluginStateCell, ProducerCore, ProducerHandler};

// ═══════════════════════════════════════════════════════════════
//  SinkFactory
// ═══════════════════════════════════════════════════════════════

/// Открывает sink для batched producer'а (файл, сокет, консоль).
///
/// Called from the producer's worker only, so implementations may keep
/// mutable state (rotation counters and the like).
pub trait SinkFactory: Send + 'static {
    fn open(&mut self) -> Result<Box<dyn BatchedWriter>, DeliveryError>;

    /// Checked on every tick while a sink is attached.
    fn needs_rotation(&self, writer: &dyn BatchedWriter, age: Duration) -> bool {
        let _ = (writer, age);
        false
    }

    /// Called after a sink was closed for rotation (age, size or `Roll`),
    /// before the next `open`.
    fn rotated(&mut self) {}

    /// Acknowledgement check installed on the writer assembly.
    fn validator(&self) -> Option<Box<dyn Validator>> {
        None
    }
}

// ═══════════════════════════════════════════════════════════════
//  BatchedProducer
// ═══════════════════════════════════════════════════════════════

/// Producer over any [`SinkFactory`]: batches on ingress, flushes on tick,
/// threshold or command, reopens the sink lazily.
pub struct BatchedProducer<F: SinkFactory> {
    core: ProducerCore,
    batch: Arc<MessageBatch>,
    flush_count: usize,
    worker: Mutex<Option<BatchedWorker<F>>>,
}

impl<F: SinkFactory> BatchedProducer<F> {
    pub fn new(core: ProducerCore, settings: BatchSettings, formatters: FormatterChain, factory: F) -> Self {
        let core = core.with_shutdown_timeout(settings.shutdown_timeout);
        let mut assembly = BatchedWriterAssembly::new(settings, formatters, core.dropper().clone());

        let state = core.state_cell().clone();
        let name = core.name().to_string();
        assembly.assembly_mut().set_validator(factory.validator());
        assembly.assembly_mut().set_error_handler(move |err| {
            tracing::error!(producer = %name, error = %err, "sink write failed");
            state.block();
            false
        });

        let batch = assembly.batch().clone();
        let side = SinkSide { name: core.name().to_string(), assembly, factory, state: core.state_cell().clone() };
        let worker = BatchedWorker {
            side: Arc::new(Mutex::new(side)),
            batch: batch.clone(),
            tick: settings.timeout,
            shutdown_timeout: settings.shutdown_timeout,
        };

        Self { batch, flush_count: settings.flush_count, worker: Mutex::new(Some(worker)), core }
    }

    pub fn core(&self) -> &ProducerCore {
        &self.core
    }

    pub fn batch(&self) -> &Arc<MessageBatch> {
        &self.batch
    }
}

impl<F: SinkFactory> Producer for BatchedProducer<F> {
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

    fn enqueue(&self, msg: Message, timeout: Option<Duration>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.core.enqueue(&self.batch, msg, timeout).await
                && self.batch.reached_size_threshold(self.flush_count)
            {
                self.core.request_flush();
            }
        })
    }

    fn produce(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
            match worker {
                Some(mut worker) => self.core.run(&mut worker).await,
                None => tracing::warn!(producer = %self.core.name(), "produce called twice"),
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Worker
// ═══════════════════════════════════════════════════════════════

/// Control-loop side of a batched producer. Sink work (open, write, ack
/// wait, close) is handed to the blocking pool one operation at a time, so
/// a slow peer never stalls a runtime worker.
struct BatchedWorker<F> {
    side: Arc<Mutex<SinkSide<F>>>,
    batch: Arc<MessageBatch>,
    tick: Duration,
    shutdown_timeout: Duration,
}

impl<F: SinkFactory> BatchedWorker<F> {
    async fn blocking<R, Op>(&self, op: Op) -> Option<R>
    where
        R: Send + 'static,
        Op: FnOnce(&mut SinkSide<F>) -> R + Send + 'static,
    {
        let side = self.side.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut side = side.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut side)
        });
        match task.await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(error = %e, "sink operation aborted");
                None
            }
        }
    }
}

/// Всё, что трогает sink. Используется только из blocking pool.
struct SinkSide<F> {
    name: String,
    assembly: BatchedWriterAssembly,
    factory: F,
    state: Arc<PluginStateCell>,
}

impl<F: SinkFactory> SinkSide<F> {
    /// Make sure a usable sink is attached. A sink that reports itself
    /// inaccessible (file removed, peer gone) is closed and replaced.
    /// Open failure blocks the producer; the next flush tries again.
    fn ensure_writer(&mut self) {
        match self.assembly.writer() {
            Some(writer) if writer.is_accessible() => return,
            Some(writer) => {
                tracing::warn!(producer = %self.name, sink = writer.name(), "sink no longer accessible, reopening");
                self.assembly.unset_writer();
            }
            None => {}
        }
        match self.factory.open() {
            Ok(writer) => {
                tracing::info!(producer = %self.name, sink = writer.name(), "sink opened");
                self.assembly.set_writer(writer);
                self.state.unblock();
            }
            Err(e) => {
                if self.state.block() {
                    tracing::warn!(producer = %self.name, error = %e, "sink unavailable, producer blocked");
                } else {
                    tracing::debug!(producer = %self.name, error = %e, "sink still unavailable");
                }
            }
        }
    }

    fn rotate_if_needed(&mut self) {
        let due = match (self.assembly.writer(), self.assembly.writer_age()) {
            (Some(writer), Some(age)) => self.factory.needs_rotation(writer, age),
            _ => false,
        };
        if due {
            tracing::info!(producer = %self.name, "rotating sink");
            self.retire_writer();
        }
    }

    fn retire_writer(&mut self) {
        if self.assembly.has_writer() {
            self.assembly.unset_writer();
            self.factory.rotated();
        }
    }

    fn tick(&mut self) {
        self.rotate_if_needed();
        if !self.assembly.batch().is_empty() {
            self.ensure_writer();
        }
        self.assembly.flush_on_timeout();
    }

    fn flush(&mut self) {
        if !self.assembly.batch().is_empty() {
            self.ensure_writer();
        }
        self.assembly.flush();
    }

    fn close(&mut self, deadline: Instant) -> FlushReport {
        if !self.assembly.batch().is_empty() {
            self.ensure_writer();
        }
        self.assembly.finish_close(deadline)
    }
}

impl<F: SinkFactory> ProducerHandler for BatchedWorker<F> {
    fn tick_interval(&self) -> Duration {
        self.tick
    }

    fn on_tick(&mut self, _core: &ProducerCore) -> impl Future<Output = ()> + Send {
        async move {
            self.blocking(|side| side.tick()).await;
        }
    }

    fn on_flush(&mut self, _core: &ProducerCore) -> impl Future<Output = ()> + Send {
        async move {
            self.blocking(|side| side.flush()).await;
        }
    }

    /// Pending messages go to the sink opened by the next flush.
    fn on_roll(&mut self, core: &ProducerCore) -> impl Future<Output = ()> + Send {
        tracing::info!(producer = %core.name(), "roll requested");
        async move {
            self.blocking(|side| side.retire_writer()).await;
        }
    }

    fn close(&mut self, core: &ProducerCore) -> impl Future<Output = ()> + Send {
        async move {
            let deadline = self.batch.begin_close(self.shutdown_timeout).await;
            let Some(report) = self.blocking(move |side| side.close(deadline)).await else {
                return;
            };
            tracing::info!(
                producer = %core.name(),
                written = report.written,
                dropped = report.failed + report.dropped,
                "final drain complete"
            );
        }
    }
}
