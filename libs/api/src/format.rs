use std::sync::Arc;

use crate::{Message, PluginError};

/// Formatter — преобразование сообщения в байты для sink'а.
///
/// Вызывается один раз на каждую запись (или на drop через деградированный
/// путь). Форматтеры в цепочке применяются в порядке конфигурации, каждый
/// получает результат предыдущего. Реализации должны быть stateless
/// относительно сообщений (счётчики/статистика допустимы).
pub trait Formatter: Send + Sync {
    /// Преобразовать данные. `data` на входе первого форматтера — payload.
    fn format(&self, msg: &Message, data: Vec<u8>) -> Result<Vec<u8>, PluginError>;
}

/// Упорядоченная цепочка форматтеров. Пустая цепочка отдаёт payload как есть.
#[derive(Clone, Default)]
pub struct FormatterChain {
    formatters: Vec<Arc<dyn Formatter>>,
}

impl FormatterChain {
    pub fn new(formatters: Vec<Arc<dyn Formatter>>) -> Self {
        Self { formatters }
    }

    pub fn push(&mut self, formatter: Arc<dyn Formatter>) {
        self.formatters.push(formatter);
    }

    pub fn len(&self) -> usize {
        self.formatters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formatters.is_empty()
    }

    /// Encode `msg` through every formatter in order.
    pub fn apply(&self, msg: &Message) -> Result<Vec<u8>, PluginError> {
        self.formatters
            .iter()
            .try_fold(msg.payload().to_vec(), |data, f| f.format(msg, data))
    }
}

impl std::fmt::Debug for FormatterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatterChain").field("len", &self.formatters.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamId;

    struct Suffix(&'static [u8]);

    impl Formatter for Suffix {
        fn format(&self, _msg: &Message, mut data: Vec<u8>) -> Result<Vec<u8>, PluginError> {
            data.extend_from_slice(self.0);
            Ok(data)
        }
    }

    struct Reject;

    impl Formatter for Reject {
        fn format(&self, _msg: &Message, _data: Vec<u8>) -> Result<Vec<u8>, PluginError> {
            Err(PluginError::format_err("rejected"))
        }
    }

    #[test]
    fn chain_applies_in_order() {
        let chain = FormatterChain::new(vec![Arc::new(Suffix(b"-a")), Arc::new(Suffix(b"-b"))]);
        let msg = Message::new("x", StreamId::new("s"), 0);
        assert_eq!(chain.apply(&msg).unwrap(), b"x-a-b");
    }

    #[test]
    fn empty_chain_is_identity() {
        let msg = Message::new("raw", StreamId::new("s"), 0);
        assert_eq!(FormatterChain::default().apply(&msg).unwrap(), b"raw");
    }

    #[test]
    fn chain_stops_on_error() {
        let chain = FormatterChain::new(vec![Arc::new(Reject), Arc::new(Suffix(b"!"))]);
        let msg = Message::new("x", StreamId::new("s"), 0);
        let err = chain.apply(&msg).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }
}
