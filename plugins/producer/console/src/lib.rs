use std::io::{self, Write};
use std::sync::Arc;

use fanout_api::{BatchedWriter, PluginError, Producer, parse_plugin_config_opt};
use fanout_pipeline::{BatchedProducer, DeliveryError, ProducerContext, SinkFactory};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Default, serde::Deserialize)]
struct ConsoleConfig {
    #[serde(default)]
    console: Target,
}

/// Sink over the process's stdout or stderr.
pub struct ConsoleWriter {
    target: Target,
    written: u64,
}

impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.target {
            Target::Stdout => io::stdout().lock().write(buf)?,
            Target::Stderr => io::stderr().lock().write(buf)?,
        };
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.target {
            Target::Stdout => io::stdout().flush(),
            Target::Stderr => io::stderr().flush(),
        }
    }
}

impl BatchedWriter for ConsoleWriter {
    fn name(&self) -> &str {
        match self.target {
            Target::Stdout => "stdout",
            Target::Stderr => "stderr",
        }
    }

    fn size(&self) -> u64 {
        self.written
    }

    fn is_accessible(&self) -> bool {
        true
    }
}

pub struct ConsoleSink {
    target: Target,
}

impl SinkFactory for ConsoleSink {
    fn open(&mut self) -> Result<Box<dyn BatchedWriter>, DeliveryError> {
        Ok(Box::new(ConsoleWriter { target: self.target, written: 0 }))
    }
}

pub fn create(ctx: ProducerContext, config: &serde_json::Value) -> Result<Arc<dyn Producer>, PluginError> {
    let cfg: ConsoleConfig = parse_plugin_config_opt(config)?;
    let sink = ConsoleSink { target: cfg.console };
    Ok(Arc::new(BatchedProducer::new(ctx.core, ctx.batch, ctx.formatters, sink)))
}
