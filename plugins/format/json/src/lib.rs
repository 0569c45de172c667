use std::sync::Arc;

use serde::Serialize;

use fanout_api::{Formatter, Message, PluginError, parse_plugin_config_opt};

/// Оборачивает сообщение в JSON-конверт:
/// `{"stream","origin","seq","ts_ms","payload"}`.
pub struct JsonFormatter {
    raw_payload: bool,
}

#[derive(Serialize)]
struct Envelope<'a, P: Serialize> {
    stream: &'a str,
    origin: &'a str,
    seq: u64,
    ts_ms: i64,
    payload: P,
}

impl JsonFormatter {
    fn envelope<'a, P: Serialize>(msg: &'a Message, payload: P) -> Envelope<'a, P> {
        Envelope {
            stream: msg.stream().as_str(),
            origin: msg.origin().as_str(),
            seq: msg.sequence(),
            ts_ms: msg.ts_ms(),
            payload,
        }
    }
}

impl Formatter for JsonFormatter {
    fn format(&self, msg: &Message, data: Vec<u8>) -> Result<Vec<u8>, PluginError> {
        if self.raw_payload {
            let value: serde_json::Value = serde_json::from_slice(&data)?;
            return Ok(serde_json::to_vec(&Self::envelope(msg, value))?);
        }
        let text = std::str::from_utf8(&data)?;
        Ok(serde_json::to_vec(&Self::envelope(msg, text))?)
    }
}

#[derive(Default, serde::Deserialize)]
struct JsonConfig {
    /// Embed the payload as a JSON value instead of a string. Payloads that
    /// are not valid JSON are rerouted.
    #[serde(default)]
    raw_payload: bool,
}

pub fn create(config: &serde_json::Value) -> Result<Arc<dyn Formatter>, PluginError> {
    let cfg: JsonConfig = parse_plugin_config_opt(config)?;
    Ok(Arc::new(JsonFormatter { raw_payload: cfg.raw_payload }))
}
