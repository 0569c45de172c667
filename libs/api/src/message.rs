use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::util::now_ms;

// ════════════════════════════════════════════════════════════════
//  StreamId
// ════════════════════════════════════════════════════════════════

/// Имя потока (stream), связывающего consumer'ы с producer'ами.
///
/// Клонирование дешёвое — внутри `Arc<str>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Arc<str>);

impl StreamId {
    /// Поток по умолчанию для сообщений, которые не удалось доставить.
    pub const DROPPED: &'static str = "_DROPPED_";
    /// Подписка на все потоки, кроме drop-потока.
    pub const WILDCARD: &'static str = "*";

    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn dropped() -> Self {
        Self::new(Self::DROPPED)
    }

    pub fn wildcard() -> Self {
        Self::new(Self::WILDCARD)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        &*self.0 == Self::WILDCARD
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({:?})", &*self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        if name.is_empty() {
            return Err(serde::de::Error::custom("stream name must not be empty"));
        }
        Ok(Self::from(name))
    }
}

// ════════════════════════════════════════════════════════════════
//  Message
// ════════════════════════════════════════════════════════════════

/// Единица данных, проходящая через pipeline.
///
/// Payload неизменяем (`Bytes`, reference-counted), так что broadcast
/// в несколько producer'ов не копирует данные.
#[derive(Clone, Debug)]
pub struct Message {
    payload: Bytes,
    stream: StreamId,
    origin: StreamId,
    drop_stream: StreamId,
    sequence: u64,
    ts_ms: i64,
}

impl Message {
    /// Create a message at ingress. The drop stream defaults to `_DROPPED_`.
    pub fn new(payload: impl Into<Bytes>, stream: StreamId, sequence: u64) -> Self {
        Self {
            payload: payload.into(),
            origin: stream.clone(),
            stream,
            drop_stream: StreamId::dropped(),
            sequence,
            ts_ms: now_ms(),
        }
    }

    pub fn with_drop_stream(mut self, drop_stream: StreamId) -> Self {
        self.drop_stream = drop_stream;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Stream the message is currently routed on.
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Stream the message entered the system on. Survives reroutes.
    pub fn origin(&self) -> &StreamId {
        &self.origin
    }

    pub fn drop_stream(&self) -> &StreamId {
        &self.drop_stream
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn ts_ms(&self) -> i64 {
        self.ts_ms
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// True once the message travels on its own drop stream.
    /// Such a message must not be rerouted again.
    pub fn is_dropped(&self) -> bool {
        self.stream == self.drop_stream
    }

    /// Reroute to the drop stream. Returns `None` if the message is already
    /// on it (a second drop discards).
    pub fn into_dropped(mut self) -> Option<Self> {
        if self.is_dropped() {
            return None;
        }
        self.stream = self.drop_stream.clone();
        Some(self)
    }
}

// ════════════════════════════════════════════════════════════════
//  SequenceGenerator
// ════════════════════════════════════════════════════════════════

/// Монотонно возрастающие номера сообщений, выдаваемые на ingress.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_message_is_not_rerouted_twice() {
        let msg = Message::new("payload", StreamId::new("logs"), 7)
            .with_drop_stream(StreamId::new("retry"));

        let dropped = msg.into_dropped().unwrap();
        assert_eq!(dropped.stream().as_str(), "retry");
        assert_eq!(dropped.origin().as_str(), "logs");
        assert_eq!(dropped.sequence(), 7);
        assert!(dropped.into_dropped().is_none());
    }

    #[test]
    fn sequence_is_monotonic() {
        let seq = SequenceGenerator::new();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }

    #[test]
    fn empty_stream_name_is_rejected() {
        let res: Result<StreamId, _> = serde_json::from_str("\"\"");
        assert!(res.is_err());
        let ok: StreamId = serde_json::from_str("\"console\"").unwrap();
        assert_eq!(ok, StreamId::new("console"));
    }
}
