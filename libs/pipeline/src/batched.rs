use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use fanout_api::{BatchedWriter, DropFn, FormatterChain};

use crate::assembly::{Degraded, WriterAssembly};
use crate::batch::{FlushReport, MessageBatch};
use crate::config::BatchSettings;

/// Batch + writer assembly + replaceable sink: the skeleton every batched
/// producer embeds.
///
/// The batch is shared (`Arc`) with the producer's ingress path; everything
/// else is owned by the producer's worker.
pub struct BatchedWriterAssembly {
    batch: Arc<MessageBatch>,
    assembly: WriterAssembly,
    created: Option<Instant>,
    settings: BatchSettings,
}

impl BatchedWriterAssembly {
    pub fn new(settings: BatchSettings, formatters: FormatterChain, fallback: DropFn) -> Self {
        Self {
            batch: Arc::new(MessageBatch::new(settings.max_count)),
            assembly: WriterAssembly::new(formatters, fallback),
            created: None,
            settings,
        }
    }

    pub fn batch(&self) -> &Arc<MessageBatch> {
        &self.batch
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Validator and error handler are configured through here.
    pub fn assembly_mut(&mut self) -> &mut WriterAssembly {
        &mut self.assembly
    }

    // ── Sink ──

    pub fn has_writer(&self) -> bool {
        self.assembly.has_writer()
    }

    pub fn writer(&self) -> Option<&dyn BatchedWriter> {
        self.assembly.writer()
    }

    /// Attach a sink and record its creation time.
    pub fn set_writer(&mut self, writer: Box<dyn BatchedWriter>) {
        self.assembly.set_writer(writer);
        self.created = Some(Instant::now());
    }

    /// Close and detach the current sink.
    pub fn unset_writer(&mut self) {
        self.assembly.close_writer();
        self.created = None;
    }

    /// Detach the current sink without closing it.
    pub fn get_writer_and_unset(&mut self) -> Option<Box<dyn BatchedWriter>> {
        self.created = None;
        self.assembly.take_writer()
    }

    /// Time since the current sink was attached.
    pub fn writer_age(&self) -> Option<Duration> {
        if !self.assembly.has_writer() {
            return None;
        }
        self.created.map(|t| t.elapsed())
    }

    // ── Flush ──

    /// Drain the batch into the sink, or down the degraded path when no
    /// sink is attached.
    pub fn flush(&mut self) -> Option<FlushReport> {
        let degraded = !self.assembly.has_writer();
        let report = if degraded {
            self.batch.flush(&mut Degraded(&mut self.assembly))
        } else {
            self.batch.flush(&mut self.assembly)
        }?;

        if degraded && report.total() > 0 {
            tracing::warn!(count = report.total(), "no sink attached, rerouted batch");
        } else if !report.is_clean() {
            tracing::warn!(
                written = report.written,
                failed = report.failed,
                dropped = report.dropped,
                "flush incomplete"
            );
        } else if report.written > 0 {
            tracing::debug!(written = report.written, "batch flushed");
        }
        if !self.assembly.has_writer() {
            self.created = None;
        }
        Some(report)
    }

    /// Periodic tick: flush once either the batch timeout elapsed or
    /// `flush_count` messages piled up since the last flush.
    pub fn flush_on_timeout(&mut self) -> Option<FlushReport> {
        let due = self.batch.reached_time_threshold(self.settings.timeout)
            || self.batch.reached_size_threshold(self.settings.flush_count);
        if !due {
            return None;
        }
        self.flush()
    }

    /// Close the batch with the shutdown timeout, then release the sink.
    pub async fn close(&mut self) -> FlushReport {
        let deadline = self.batch.begin_close(self.settings.shutdown_timeout).await;
        self.finish_close(deadline)
    }

    /// Drain the already closed batch until `deadline`, then release the
    /// sink. Blocks on sink I/O.
    pub fn finish_close(&mut self, deadline: Instant) -> FlushReport {
        let report = if self.assembly.has_writer() {
            self.batch.drain_closed(&mut self.assembly, deadline)
        } else {
            self.batch.drain_closed(&mut Degraded(&mut self.assembly), deadline)
        };

        let forced = self.batch.forced_drops();
        if forced > 0 {
            let timeout = self.settings.shutdown_timeout;
            tracing::warn!(forced, ?timeout, "shutdown deadline exceeded, messages force-dropped");
        }
        tracing::debug!(
            written = report.written,
            failed = report.failed,
            dropped = report.dropped,
            "batch closed"
        );

        self.unset_writer();
        report
    }
}
