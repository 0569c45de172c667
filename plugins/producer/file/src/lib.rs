mod config;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use fanout_api::{PluginError, Producer, parse_plugin_config};
use fanout_pipeline::{BatchedProducer, ProducerContext};

use config::FileProducerConfig;
pub use sink::{FileSink, FileWriter};

// ════════════════════════════════════════════════════════════════
//  Plugin entry point
// ════════════════════════════════════════════════════════════════

pub fn create(ctx: ProducerContext, config: &serde_json::Value) -> Result<Arc<dyn Producer>, PluginError> {
    let cfg: FileProducerConfig = parse_plugin_config(config)?;
    if cfg.path.is_empty() {
        return Err(PluginError::config("file producer: path must not be empty"));
    }

    let sink = FileSink::new(&cfg.path, cfg.create_dirs)
        .with_rotate_size(cfg.rotate_size_mb.map(|mb| mb * 1024 * 1024))
        .with_rotate_age(cfg.rotate_age_sec.map(Duration::from_secs));
    Ok(Arc::new(BatchedProducer::new(ctx.core, ctx.batch, ctx.formatters, sink)))
}
