use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Message, PluginError, StreamId};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reroute hook for undeliverable messages. Must never block.
pub type DropFn = Arc<dyn Fn(Message) + Send + Sync>;

// ════════════════════════════════════════════════════════════════
//  Overflow Policy
// ════════════════════════════════════════════════════════════════

/// Стратегия поведения при переполнении batch'а producer'а.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Неблокирующий append: batch полон — сообщение уходит в drop stream.
    Drop,
    /// Ждать пока появится место, запрашивая flush (back-pressure).
    #[default]
    #[serde(alias = "backpressure")]
    BackPressure,
}

// ════════════════════════════════════════════════════════════════
//  Control & State
// ════════════════════════════════════════════════════════════════

/// Команды control-канала plugin'а.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginControl {
    /// Остановить consumer.
    StopConsumer,
    /// Остановить producer (graceful drain).
    StopProducer,
    /// Сбросить batch немедленно.
    Flush,
    /// Закрыть текущий sink и открыть новый (ротация файлов).
    Roll,
}

/// Lifecycle state of a plugin.
///
/// `Initializing → Active ⇄ Blocked → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PluginState {
    Initializing,
    Active,
    Blocked,
    Stopping,
    Stopped,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Initializing => f.write_str("initializing"),
            PluginState::Active => f.write_str("active"),
            PluginState::Blocked => f.write_str("blocked"),
            PluginState::Stopping => f.write_str("stopping"),
            PluginState::Stopped => f.write_str("stopped"),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Capability traits
// ════════════════════════════════════════════════════════════════

/// Producer — получает сообщения из подписанных stream'ов и доставляет
/// их в свой sink.
pub trait Producer: Send + Sync {
    fn name(&self) -> &str;

    /// Streams this producer is subscribed to.
    fn streams(&self) -> &[StreamId];

    fn state(&self) -> PluginState;

    fn is_active(&self) -> bool {
        self.state() == PluginState::Active
    }

    fn is_blocked(&self) -> bool {
        self.state() == PluginState::Blocked
    }

    /// Write-only access to the control channel. Fails if the producer is
    /// already gone or the channel is congested.
    fn control(&self, command: PluginControl) -> Result<(), PluginError>;

    /// Deliver one message to the producer's ingress. Never blocks longer
    /// than `timeout` when one is given; a stalled message is rerouted to
    /// its drop stream.
    fn enqueue(&self, msg: Message, timeout: Option<Duration>) -> BoxFuture<'_, ()>;

    /// Long-running worker. Resolves once the producer reached `Stopped`.
    fn produce(&self) -> BoxFuture<'_, ()>;
}

/// Consumer — источник сообщений (stdin, сокет, ...), публикующий их через
/// router.
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> PluginState;

    fn control(&self, command: PluginControl) -> Result<(), PluginError>;

    /// Run until the source is exhausted or a stop command arrives.
    fn consume(&self, router: Arc<dyn MessageRouter>) -> BoxFuture<'_, Result<(), PluginError>>;
}

/// Маршрутизация сообщений между consumer'ами и producer'ами.
pub trait MessageRouter: Send + Sync {
    /// Deliver to every producer subscribed to `msg.stream()`.
    fn route(&self, msg: Message) -> BoxFuture<'_, ()>;

    /// Reroute to the message's drop stream. Never blocks.
    fn drop_message(&self, msg: Message);
}
