use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use fanout_api::{OverflowPolicy, StreamId};
use fanout_pipeline::BatchConfig;
use fanout_router::Distribution;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "fanout-server", about = "Мультиплексор потоков сообщений")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить сервер
    Serve(ServeArgs),
    /// Показать встроенные plugin'ы
    Plugins,
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "fanout.toml", env = "CONFIG_PATH")]
    pub config: String,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
    #[serde(default)]
    pub producers: Vec<ProducerConfig>,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Stream, куда уходят недоставленные сообщения.
    pub drop_stream: String,
    /// Ёмкость очереди drop stream'а.
    pub drop_buffer: usize,
    /// Сколько router ждёт место в batch'е producer'а. Нет — ждать, пока
    /// producer активен.
    pub enqueue_timeout_ms: Option<u64>,
    /// Запас сверх самого длинного shutdown_timeout producer'ов.
    pub shutdown_grace_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            drop_stream: StreamId::DROPPED.to_string(),
            drop_buffer: 8192,
            enqueue_timeout_ms: None,
            shutdown_grace_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConsumerConfig {
    pub name: String,
    pub plugin: String,
    pub stream: String,
    #[serde(default)]
    pub drop_stream: Option<String>,
    #[serde(default)]
    pub config: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
pub struct FormatterConfig {
    pub plugin: String,
    #[serde(default)]
    pub config: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProducerConfig {
    pub name: String,
    pub plugin: String,
    pub streams: Vec<String>,
    #[serde(default)]
    pub drop_stream: Option<String>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub formatters: Vec<FormatterConfig>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub config: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub distribution: Distribution,
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config { context: "read", detail: format!("'{path}': {e}") })?;
        Self::parse(&content).map_err(|e| match e {
            ServerError::Config { context, detail } => {
                ServerError::Config { context, detail: format!("'{path}': {detail}") }
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ServerError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ServerError::Config { context: "parse", detail: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ServerError> {
        if self.producers.is_empty() {
            return Err(ServerError::NoComponents("[[producers]]"));
        }
        if self.consumers.is_empty() {
            return Err(ServerError::NoComponents("[[consumers]]"));
        }
        if self.router.drop_stream.is_empty() {
            return Err(ServerError::Config { context: "router", detail: "drop_stream must not be empty".into() });
        }
        Ok(())
    }

    /// Longest drain any producer may take.
    pub fn max_shutdown_timeout_ms(&self) -> u64 {
        self.producers.iter().map(|p| p.batch.shutdown_timeout_ms).max().unwrap_or(0)
    }
}

/// Plugin table as JSON, the form every factory takes. A missing table is `null`.
pub fn config_json(value: &Option<toml::Value>) -> Result<serde_json::Value, ServerError> {
    match value {
        Some(v) => serde_json::to_value(v)
            .map_err(|e| ServerError::Config { context: "plugin config", detail: e.to_string() }),
        None => Ok(serde_json::Value::Null),
    }
}
