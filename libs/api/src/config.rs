use serde::de::DeserializeOwned;

use crate::{PluginError, StreamId};

/// Десериализовать конфиг плагина из его таблицы в конфигурации сервера.
pub fn parse_plugin_config<T: DeserializeOwned>(config: &serde_json::Value) -> Result<T, PluginError> {
    T::deserialize(config).map_err(|e| PluginError::config(format!("invalid plugin config: {e}")))
}

/// Десериализовать опциональный конфиг плагина.
/// Возвращает `T::default()` если таблица отсутствует или пуста.
pub fn parse_plugin_config_opt<T: Default + DeserializeOwned>(
    config: &serde_json::Value,
) -> Result<T, PluginError> {
    match config {
        serde_json::Value::Null => Ok(T::default()),
        serde_json::Value::Object(map) if map.is_empty() => Ok(T::default()),
        other => parse_plugin_config(other),
    }
}

/// What a consumer factory gets besides its plugin table.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    pub name: String,
    /// Stream every ingested message is published on.
    pub stream: StreamId,
    pub drop_stream: StreamId,
}
