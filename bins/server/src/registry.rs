use std::collections::BTreeMap;
use std::sync::Arc;

use fanout_api::{Consumer, ConsumerContext, Formatter, PluginError, Producer};
use fanout_pipeline::ProducerContext;

use crate::error::ServerError;

pub type FormatterFactory = fn(&serde_json::Value) -> Result<Arc<dyn Formatter>, PluginError>;
pub type ProducerFactory = fn(ProducerContext, &serde_json::Value) -> Result<Arc<dyn Producer>, PluginError>;
pub type ConsumerFactory = fn(ConsumerContext, &serde_json::Value) -> Result<Arc<dyn Consumer>, PluginError>;

/// Таблица регистрации: имя plugin'а из конфига → фабрика.
pub struct Registry {
    formatters: BTreeMap<&'static str, FormatterFactory>,
    producers: BTreeMap<&'static str, ProducerFactory>,
    consumers: BTreeMap<&'static str, ConsumerFactory>,
}

impl Registry {
    pub fn builtin() -> Self {
        let formatters: [(&'static str, FormatterFactory); 3] = [
            ("delimiter", fanout_format_delimiter::create),
            ("json", fanout_format_json::create),
            ("sequence", fanout_format_sequence::create),
        ];
        let producers: [(&'static str, ProducerFactory); 4] = [
            ("console", fanout_producer_console::create),
            ("file", fanout_producer_file::create),
            ("null", fanout_producer_null::create),
            ("socket", fanout_producer_socket::create),
        ];
        let consumers: [(&'static str, ConsumerFactory); 1] = [("console", fanout_consumer_console::create)];

        Self {
            formatters: formatters.into_iter().collect(),
            producers: producers.into_iter().collect(),
            consumers: consumers.into_iter().collect(),
        }
    }

    pub fn formatter(&self, name: &str) -> Result<FormatterFactory, ServerError> {
        lookup(&self.formatters, "formatter", name)
    }

    pub fn producer(&self, name: &str) -> Result<ProducerFactory, ServerError> {
        lookup(&self.producers, "producer", name)
    }

    pub fn consumer(&self, name: &str) -> Result<ConsumerFactory, ServerError> {
        lookup(&self.consumers, "consumer", name)
    }

    /// `(kind, name)` pairs in a stable order.
    pub fn entries(&self) -> Vec<(&'static str, &'static str)> {
        let consumers = self.consumers.keys().map(|n| ("consumer", *n));
        let producers = self.producers.keys().map(|n| ("producer", *n));
        let formatters = self.formatters.keys().map(|n| ("formatter", *n));
        consumers.chain(producers).chain(formatters).collect()
    }
}

fn lookup<F: Copy>(table: &BTreeMap<&'static str, F>, kind: &'static str, name: &str) -> Result<F, ServerError> {
    table.get(name).copied().ok_or_else(|| ServerError::UnknownPlugin { kind, name: name.to_string() })
}
