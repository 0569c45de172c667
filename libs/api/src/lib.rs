pub mod config;
pub mod error;
pub mod format;
pub mod message;
pub mod plugin;
pub mod util;
pub mod writer;

pub use config::{ConsumerContext, parse_plugin_config, parse_plugin_config_opt};
pub use error::{ErrorKind, PluginError};
pub use format::{Formatter, FormatterChain};
pub use message::{Message, SequenceGenerator, StreamId};
pub use plugin::{
    BoxFuture, Consumer, DropFn, MessageRouter, OverflowPolicy, PluginControl, PluginState, Producer,
};
pub use util::{date_from_ms, now_ms, unescape};
pub use writer::BatchedWriter;
