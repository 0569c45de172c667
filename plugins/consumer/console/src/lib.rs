use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio_util::sync::CancellationToken;

use fanout_api::{
    BoxFuture, Consumer, ConsumerContext, Message, MessageRouter, PluginControl, PluginError, PluginState,
    SequenceGenerator, StreamId,
};
use fanout_pipeline::PluginStateCell;

/// Читает строки из `R` и публикует каждую как сообщение в свой stream.
///
/// Перевод строки (`\n` или `\r\n`) отрезается. Останавливается на EOF,
/// по `StopConsumer` или при отмене токена.
pub struct ConsoleConsumer<R> {
    name: String,
    stream: StreamId,
    drop_stream: StreamId,
    sequence: SequenceGenerator,
    state: PluginStateCell,
    cancel: CancellationToken,
    reader: Mutex<Option<R>>,
}

pub type StdinConsumer = ConsoleConsumer<BufReader<Stdin>>;

impl<R> ConsoleConsumer<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn with_reader(ctx: ConsumerContext, reader: R) -> Self {
        Self {
            name: ctx.name,
            stream: ctx.stream,
            drop_stream: ctx.drop_stream,
            sequence: SequenceGenerator::new(),
            state: PluginStateCell::new(),
            cancel: CancellationToken::new(),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Stop when `token` (typically the server's shutdown token) fires.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    async fn run(&self, router: Arc<dyn MessageRouter>) -> Result<(), PluginError> {
        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(reader) = reader else {
            return Err(PluginError::state(format!("consumer '{}' is already running", self.name)));
        };

        self.state.activate();
        tracing::info!(consumer = %self.name, stream = %self.stream, "console consumer started");

        let mut lines = reader.lines();
        let mut routed = 0u64;
        let mut result = Ok(());
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!(consumer = %self.name, "stop requested");
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let msg = Message::new(line, self.stream.clone(), self.sequence.next())
                            .with_drop_stream(self.drop_stream.clone());
                        router.route(msg).await;
                        routed += 1;
                    }
                    Ok(None) => {
                        tracing::info!(consumer = %self.name, "input closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(consumer = %self.name, error = %e, "read failed");
                        result = Err(PluginError::from(e).with_context(&self.name));
                        break;
                    }
                },
            }
        }

        self.state.begin_stop();
        self.state.finish();
        tracing::info!(consumer = %self.name, messages = routed, "console consumer stopped");
        result
    }
}

impl<R> Consumer for ConsoleConsumer<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> PluginState {
        self.state.get()
    }

    fn control(&self, command: PluginControl) -> Result<(), PluginError> {
        match command {
            PluginControl::StopConsumer => self.cancel.cancel(),
            other => tracing::debug!(consumer = %self.name, command = ?other, "command ignored"),
        }
        Ok(())
    }

    fn consume(&self, router: Arc<dyn MessageRouter>) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(self.run(router))
    }
}

// ════════════════════════════════════════════════════════════════
//  Plugin entry point
// ════════════════════════════════════════════════════════════════

pub fn create(ctx: ConsumerContext, _config: &serde_json::Value) -> Result<Arc<dyn Consumer>, PluginError> {
    let reader = BufReader::new(tokio::io::stdin());
    Ok(Arc::new(StdinConsumer::with_reader(ctx, reader)))
}
