use std::io::{self, Write};
use std::time::Duration;

use fanout_api::{BatchedWriter, DropFn, FormatterChain, Message, unescape};

use crate::DeliveryError;
use crate::batch::{Delivery, FlushTarget};

/// Decides whether a failed write still counts as delivered.
pub type ErrorHandler = Box<dyn FnMut(&DeliveryError) -> bool + Send>;

// ═══════════════════════════════════════════════════════════════
//  Validator
// ═══════════════════════════════════════════════════════════════

/// Проверка ответа sink'а после каждой записи.
pub trait Validator: Send {
    fn validate(&mut self, writer: &mut dyn BatchedWriter) -> Result<(), DeliveryError>;
}

impl<F> Validator for F
where
    F: FnMut(&mut dyn BatchedWriter) -> Result<(), DeliveryError> + Send,
{
    fn validate(&mut self, writer: &mut dyn BatchedWriter) -> Result<(), DeliveryError> {
        self(writer)
    }
}

/// Reads exactly `expected.len()` bytes from the sink and compares them.
///
/// The sink is responsible for bounding the read (socket read timeout);
/// `timeout` is only reported back when that bound is hit.
#[derive(Debug, Clone)]
pub struct Acknowledge {
    expected: Vec<u8>,
    timeout: Duration,
}

impl Acknowledge {
    pub fn new(expected: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        Self { expected: expected.into(), timeout }
    }

    /// Build from a config string, resolving `\n`, `\r`, `\t` escapes.
    /// An empty string disables acknowledgement.
    pub fn from_config(expected: &str, timeout: Duration) -> Option<Self> {
        if expected.is_empty() {
            return None;
        }
        Some(Self::new(unescape(expected), timeout))
    }

    pub fn expected(&self) -> &[u8] {
        &self.expected
    }
}

impl Validator for Acknowledge {
    fn validate(&mut self, writer: &mut dyn BatchedWriter) -> Result<(), DeliveryError> {
        let mut received = vec![0u8; self.expected.len()];
        match writer.read_response(&mut received) {
            Ok(()) if received == self.expected => Ok(()),
            Ok(()) => Err(DeliveryError::ValidationMismatch {
                expected: String::from_utf8_lossy(&self.expected).into_owned(),
                received: String::from_utf8_lossy(&received).into_owned(),
            }),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(DeliveryError::Timeout(self.timeout))
            }
            Err(e) => Err(DeliveryError::WriteFailure { sink: writer.name().to_string(), source: e }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  WriterAssembly
// ═══════════════════════════════════════════════════════════════

/// Формирует одну операцию "записать сообщение" из sink'а, цепочки
/// форматтеров, необязательного валидатора и обработчика ошибок.
///
/// Never retries a write itself. A failed write closes and discards the
/// sink; reopening is the owning producer's job.
pub struct WriterAssembly {
    writer: Option<Box<dyn BatchedWriter>>,
    formatters: FormatterChain,
    validator: Option<Box<dyn Validator>>,
    on_error: ErrorHandler,
    fallback: DropFn,
}

impl WriterAssembly {
    /// `fallback` receives messages taking the degraded path.
    pub fn new(formatters: FormatterChain, fallback: DropFn) -> Self {
        Self {
            writer: None,
            formatters,
            validator: None,
            on_error: Box::new(|err| {
                tracing::error!(error = %err, "write failed");
                false
            }),
            fallback,
        }
    }

    pub fn set_writer(&mut self, writer: Box<dyn BatchedWriter>) {
        self.writer = Some(writer);
    }

    pub fn take_writer(&mut self) -> Option<Box<dyn BatchedWriter>> {
        self.writer.take()
    }

    pub fn writer(&self) -> Option<&dyn BatchedWriter> {
        self.writer.as_deref()
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    pub fn set_validator(&mut self, validator: Option<Box<dyn Validator>>) {
        self.validator = validator;
    }

    pub fn set_error_handler(&mut self, handler: impl FnMut(&DeliveryError) -> bool + Send + 'static) {
        self.on_error = Box::new(handler);
    }

    /// Encode and write one message.
    ///
    /// A formatter failure reroutes the message (`Rerouted`) and is not a
    /// write failure. Any other failure goes to the error handler; when it
    /// returns `false` the sink is closed and the message is handed back.
    pub fn write(&mut self, msg: Message) -> Result<Delivery, Message> {
        let data = match self.formatters.apply(&msg) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    stream = %msg.stream(),
                    seq = msg.sequence(),
                    "format failed, rerouting message"
                );
                (self.fallback)(msg);
                return Ok(Delivery::Rerouted);
            }
        };

        let result = match self.writer.as_mut() {
            None => Err(DeliveryError::ResourceUnavailable("no sink attached".into())),
            Some(writer) => writer
                .write_all(&data)
                .map_err(|source| DeliveryError::WriteFailure {
                    sink: writer.name().to_string(),
                    source,
                })
                .and_then(|()| match self.validator.as_mut() {
                    Some(validator) => validator.validate(&mut **writer),
                    None => Ok(()),
                }),
        };

        match result {
            Ok(()) => Ok(Delivery::Written),
            Err(err) => self.fail(msg, err),
        }
    }

    fn fail(&mut self, msg: Message, err: DeliveryError) -> Result<Delivery, Message> {
        if (self.on_error)(&err) {
            return Ok(Delivery::Written);
        }
        self.close_writer();
        Err(msg)
    }

    /// Degraded path: format for side effects, then reroute instead of writing.
    pub fn flush(&mut self, msg: Message) {
        if let Err(e) = self.formatters.apply(&msg) {
            tracing::trace!(error = %e, seq = msg.sequence(), "format failed on drop path");
        }
        (self.fallback)(msg);
    }

    /// Close and discard the current sink, if any.
    pub fn close_writer(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close() {
                tracing::warn!(sink = writer.name(), error = %e, "closing sink failed");
            }
        }
    }
}

impl FlushTarget for WriterAssembly {
    fn write(&mut self, msg: Message) -> Result<Delivery, Message> {
        WriterAssembly::write(self, msg)
    }

    fn discard(&mut self, msg: Message) {
        self.flush(msg)
    }
}

/// Flush target that sends every message down the degraded path.
pub struct Degraded<'a>(pub &'a mut WriterAssembly);

impl FlushTarget for Degraded<'_> {
    fn write(&mut self, msg: Message) -> Result<Delivery, Message> {
        self.0.flush(msg);
        Ok(Delivery::Rerouted)
    }

    fn discard(&mut self, msg: Message) {
        self.0.flush(msg)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use fanout_api::{Formatter, PluginError, StreamId};

    use super::*;
    use crate::{FlushReport, MessageBatch};
    use crate::testing::{MemorySink, drop_collector, sequences};

    struct Newline;

    impl Formatter for Newline {
        fn format(&self, _msg: &Message, mut data: Vec<u8>) -> Result<Vec<u8>, PluginError> {
            data.push(b'\n');
            Ok(data)
        }
    }

    struct RejectOdd;

    impl Formatter for RejectOdd {
        fn format(&self, msg: &Message, data: Vec<u8>) -> Result<Vec<u8>, PluginError> {
            if msg.sequence() % 2 == 1 {
                return Err(PluginError::format_err("odd"));
            }
            Ok(data)
        }
    }

    fn msg(payload: &str, seq: u64) -> Message {
        Message::new(payload.to_string(), StreamId::new("test"), seq)
    }

    fn newline_chain() -> FormatterChain {
        FormatterChain::new(vec![Arc::new(Newline)])
    }

    #[tokio::test]
    async fn flushed_message_matches_formatter_output() {
        let (dropper, dropped) = drop_collector();
        let sink = MemorySink::default();
        let mut assembly = WriterAssembly::new(newline_chain(), dropper);
        assembly.set_writer(Box::new(sink.clone()));
        assembly.set_validator(Some(Box::new(|_w: &mut dyn BatchedWriter| Ok::<(), DeliveryError>(()))));

        let batch = MessageBatch::new(4);
        batch.try_append(msg("hello", 0)).unwrap();
        let report = batch.flush(&mut assembly).unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(sink.contents(), b"hello\n");
        assert!(dropped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_on_second_write_invalidates_sink() {
        let (dropper, dropped) = drop_collector();
        let sink = MemorySink::failing_on(2);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();

        let mut assembly = WriterAssembly::new(newline_chain(), dropper);
        assembly.set_writer(Box::new(sink.clone()));
        assembly.set_error_handler(move |err| {
            seen.lock().unwrap().push(err.to_string());
            false
        });

        let batch = MessageBatch::new(4);
        for (seq, payload) in ["one", "two", "three"].into_iter().enumerate() {
            batch.try_append(msg(payload, seq as u64 + 1)).unwrap();
        }
        let report = batch.flush(&mut assembly).unwrap();

        assert_eq!(sink.contents(), b"one\n");
        assert_eq!((report.written, report.failed, report.dropped), (1, 1, 1));
        assert_eq!(sequences(&dropped), vec![2, 3]);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(!assembly.has_writer());
        assert!(sink.is_closed());
    }

    #[test]
    fn handler_can_accept_a_failed_write() {
        let (dropper, dropped) = drop_collector();
        let sink = MemorySink::failing_on(1);
        let mut assembly = WriterAssembly::new(FormatterChain::default(), dropper);
        assembly.set_writer(Box::new(sink.clone()));
        assembly.set_error_handler(|_| true);

        assert!(assembly.write(msg("lost", 0)).is_ok());
        assert!(assembly.has_writer());
        assert!(dropped.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_sink_is_reported_as_unavailable() {
        let (dropper, _dropped) = drop_collector();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let seen = kinds.clone();
        let mut assembly = WriterAssembly::new(FormatterChain::default(), dropper);
        assembly.set_error_handler(move |err| {
            seen.lock().unwrap().push(matches!(err, DeliveryError::ResourceUnavailable(_)));
            false
        });

        let back = assembly.write(msg("x", 4)).unwrap_err();
        assert_eq!(back.sequence(), 4);
        assert_eq!(*kinds.lock().unwrap(), vec![true]);
    }

    #[test]
    fn format_error_reroutes_without_touching_sink() {
        let (dropper, dropped) = drop_collector();
        let sink = MemorySink::default();
        let mut assembly = WriterAssembly::new(FormatterChain::new(vec![Arc::new(RejectOdd)]), dropper);
        assembly.set_writer(Box::new(sink.clone()));

        assert!(matches!(assembly.write(msg("a", 0)), Ok(Delivery::Written)));
        assert!(matches!(assembly.write(msg("b", 1)), Ok(Delivery::Rerouted)));

        assert_eq!(sink.contents(), b"a");
        assert_eq!(sequences(&dropped), vec![1]);
        assert!(assembly.has_writer());
    }

    #[test]
    fn rerouted_messages_are_not_counted_as_written() {
        let (dropper, dropped) = drop_collector();
        let sink = MemorySink::default();
        let mut assembly = WriterAssembly::new(FormatterChain::new(vec![Arc::new(RejectOdd)]), dropper);
        assembly.set_writer(Box::new(sink.clone()));

        let batch = MessageBatch::new(8);
        for seq in 0..4 {
            batch.try_append(msg("m", seq)).unwrap();
        }
        let report = batch.flush(&mut assembly).unwrap();

        assert_eq!(report, FlushReport { written: 2, failed: 0, dropped: 2 });
        assert_eq!(sequences(&dropped), vec![1, 3]);
        assert_eq!(sink.contents(), b"mm");
    }

    #[test]
    fn acknowledgement_is_checked_after_each_write() {
        let (dropper, _dropped) = drop_collector();
        let mut assembly = WriterAssembly::new(FormatterChain::default(), dropper);
        assembly.set_writer(Box::new(MemorySink::responding(b"OK\n")));
        let ack = Acknowledge::from_config("OK\\n", Duration::from_secs(1)).unwrap();
        assembly.set_validator(Some(Box::new(ack)));

        assert!(assembly.write(msg("ping", 0)).is_ok());
        assert!(assembly.has_writer());
    }

    #[test]
    fn acknowledgement_mismatch_closes_sink() {
        let (dropper, _dropped) = drop_collector();
        let sink = MemorySink::responding(b"NO");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();
        let mut assembly = WriterAssembly::new(FormatterChain::default(), dropper);
        assembly.set_writer(Box::new(sink.clone()));
        assembly.set_validator(Some(Box::new(Acknowledge::new("OK", Duration::from_secs(1)))));
        assembly.set_error_handler(move |err| {
            seen.lock().unwrap().push(matches!(err, DeliveryError::ValidationMismatch { .. }));
            false
        });

        assert!(assembly.write(msg("ping", 0)).is_err());
        assert_eq!(*errors.lock().unwrap(), vec![true]);
        assert!(!assembly.has_writer());
        assert!(sink.is_closed());
    }

    #[test]
    fn missing_acknowledgement_times_out() {
        let mut ack = Acknowledge::new("OK", Duration::from_millis(250));
        let mut sink = MemorySink::default();
        assert!(matches!(ack.validate(&mut sink), Err(DeliveryError::Timeout(t)) if t == Duration::from_millis(250)));
    }

    #[test]
    fn empty_acknowledgement_disables_validation() {
        assert!(Acknowledge::from_config("", Duration::from_secs(1)).is_none());
        let ack = Acknowledge::from_config("OK\\r\\n", Duration::from_secs(1)).unwrap();
        assert_eq!(ack.expected(), b"OK\r\n");
    }

    #[test]
    fn degraded_target_reroutes_everything() {
        let (dropper, dropped) = drop_collector();
        let mut assembly = WriterAssembly::new(newline_chain(), dropper);
        let batch = MessageBatch::new(4);
        batch.try_append(msg("a", 0)).unwrap();
        batch.try_append(msg("b", 1)).unwrap();

        batch.flush(&mut Degraded(&mut assembly)).unwrap();
        assert_eq!(sequences(&dropped), vec![0, 1]);
    }
}
