use std::io::Write;
use std::sync::Arc;

use fanout_api::{Formatter, Message, PluginError, parse_plugin_config_opt, unescape};

/// Prefixes `<seq><separator>`.
pub struct SequenceFormatter {
    separator: String,
}

impl Formatter for SequenceFormatter {
    fn format(&self, msg: &Message, data: Vec<u8>) -> Result<Vec<u8>, PluginError> {
        let mut out = Vec::with_capacity(data.len() + self.separator.len() + 20);
        write!(out, "{}{}", msg.sequence(), self.separator)?;
        out.extend_from_slice(&data);
        Ok(out)
    }
}

#[derive(serde::Deserialize)]
struct SequenceConfig {
    #[serde(default = "default_separator")]
    separator: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self { separator: default_separator() }
    }
}

fn default_separator() -> String {
    ":".into()
}

pub fn create(config: &serde_json::Value) -> Result<Arc<dyn Formatter>, PluginError> {
    let cfg: SequenceConfig = parse_plugin_config_opt(config)?;
    Ok(Arc::new(SequenceFormatter { separator: unescape(&cfg.separator) }))
}

#[cfg(test)]
mod tests {
    use fanout_api::StreamId;

    use super::*;

    #[test]
    fn prefixes_sequence_number() {
        let f = create(&serde_json::Value::Null).unwrap();
        let msg = Message::new("payload", StreamId::new("s"), 42);
        assert_eq!(f.format(&msg, msg.payload().to_vec()).unwrap(), b"42:payload");
    }

    #[test]
    fn custom_separator() {
        let f = create(&serde_json::json!({ "separator": "\\t" })).unwrap();
        let msg = Message::new("x", StreamId::new("s"), 0);
        assert_eq!(f.format(&msg, b"y".to_vec()).unwrap(), b"0\ty");
    }
}
