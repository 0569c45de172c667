use std::time::Duration;

use serde::Deserialize;

use crate::DeliveryError;

// ═══════════════════════════════════════════════════════════════
//  Batch Config
// ═══════════════════════════════════════════════════════════════

/// Настройки batch'а producer'а (секция `[producers.batch]`).
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Максимум сообщений в batch'е до обязательного flush.
    #[serde(default = "default_max_count", alias = "BatchMaxCount")]
    pub max_count: usize,
    /// Порог flush по количеству. По умолчанию `max_count / 2`,
    /// ограничивается `max_count`.
    #[serde(default, alias = "BatchFlushCount")]
    pub flush_count: Option<usize>,
    /// Максимальное время между flush'ами, секунды.
    #[serde(default = "default_timeout_sec", alias = "BatchTimeoutSec")]
    pub timeout_sec: u64,
    /// Сколько ждать drain при остановке, миллисекунды.
    #[serde(default = "default_shutdown_timeout_ms", alias = "ShutdownTimeoutMs")]
    pub shutdown_timeout_ms: u64,
}

fn default_max_count() -> usize {
    8192
}
fn default_timeout_sec() -> u64 {
    5
}
fn default_shutdown_timeout_ms() -> u64 {
    1000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            flush_count: None,
            timeout_sec: default_timeout_sec(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Validated batch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_count: usize,
    pub flush_count: usize,
    pub timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl BatchConfig {
    /// Validate and apply defaults. A zero capacity or a zero batch timeout
    /// is fatal: the producer must never become active with it.
    pub fn resolve(&self) -> Result<BatchSettings, DeliveryError> {
        if self.max_count == 0 {
            return Err(DeliveryError::Config("batch max_count must be greater than 0".into()));
        }
        if self.timeout_sec == 0 {
            return Err(DeliveryError::Config("batch timeout_sec must be greater than 0".into()));
        }
        let flush_count = self
            .flush_count
            .unwrap_or(self.max_count / 2)
            .clamp(1, self.max_count);

        Ok(BatchSettings {
            max_count: self.max_count,
            flush_count,
            timeout: Duration::from_secs(self.timeout_sec),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        })
    }
}
