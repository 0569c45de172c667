use std::io;
use std::time::Duration;

use fanout_api::{Message, PluginError};

/// Ошибки доставки: batch, writer assembly, sink.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("batch is full")]
    Full,

    #[error("batch is closed")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("write to '{sink}' failed: {source}")]
    WriteFailure {
        sink: String,
        #[source]
        source: io::Error,
    },

    #[error("acknowledgement mismatch: expected {expected:?}, received {received:?}")]
    ValidationMismatch { expected: String, received: String },

    #[error("sink unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("format: {0}")]
    Format(#[from] PluginError),

    #[error("config: {0}")]
    Config(String),
}

/// Отказ в append: сообщение возвращается вызывающему для reroute.
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    #[error("batch is full")]
    Full(Message),

    #[error("batch is closed")]
    Closed(Message),
}

impl AppendError {
    pub fn into_message(self) -> Message {
        match self {
            AppendError::Full(msg) | AppendError::Closed(msg) => msg,
        }
    }

    pub fn as_delivery_error(&self) -> DeliveryError {
        match self {
            AppendError::Full(_) => DeliveryError::Full,
            AppendError::Closed(_) => DeliveryError::Closed,
        }
    }
}
