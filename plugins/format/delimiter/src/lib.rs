use std::sync::Arc;

use fanout_api::{Formatter, Message, PluginError, parse_plugin_config_opt, unescape};

/// Дописывает разделитель после каждого сообщения (по умолчанию `\n`).
pub struct DelimiterFormatter {
    delimiter: Vec<u8>,
}

impl DelimiterFormatter {
    pub fn new(delimiter: &str) -> Self {
        Self { delimiter: unescape(delimiter).into_bytes() }
    }
}

impl Formatter for DelimiterFormatter {
    fn format(&self, _msg: &Message, mut data: Vec<u8>) -> Result<Vec<u8>, PluginError> {
        data.extend_from_slice(&self.delimiter);
        Ok(data)
    }
}

#[derive(serde::Deserialize)]
struct DelimiterConfig {
    /// Escapes `\n`, `\r`, `\t` are resolved.
    #[serde(default = "default_delimiter")]
    delimiter: String,
}

impl Default for DelimiterConfig {
    fn default() -> Self {
        Self { delimiter: default_delimiter() }
    }
}

fn default_delimiter() -> String {
    "\n".into()
}

pub fn create(config: &serde_json::Value) -> Result<Arc<dyn Formatter>, PluginError> {
    let cfg: DelimiterConfig = parse_plugin_config_opt(config)?;
    Ok(Arc::new(DelimiterFormatter::new(&cfg.delimiter)))
}
