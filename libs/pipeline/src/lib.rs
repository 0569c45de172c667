//! Delivery core shared by every producer: bounded batching, the writer
//! assembly around a sink, and the producer lifecycle loop.

pub mod assembly;
pub mod batch;
pub mod batched;
pub mod batched_producer;
pub mod config;
pub mod context;
pub mod error;
pub mod producer;

#[cfg(test)]
mod testing;

pub use assembly::{Acknowledge, Degraded, ErrorHandler, Validator, WriterAssembly};
pub use batch::{Delivery, FlushReport, FlushTarget, MessageBatch};
pub use batched::BatchedWriterAssembly;
pub use batched_producer::{BatchedProducer, SinkFactory};
pub use config::{BatchConfig, BatchSettings};
pub use context::ProducerContext;
pub use error::{AppendError, DeliveryError};
pub use fanout_api::DropFn;
pub use producer::{PluginStateCell, ProducerCore, ProducerHandler};
