use fanout_api::PluginError;
use fanout_pipeline::DeliveryError;
use fanout_router::RouterError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("no {0} configured")]
    NoComponents(&'static str),

    #[error("unknown {kind} plugin '{name}'")]
    UnknownPlugin { kind: &'static str, name: String },

    #[error("{component} '{name}': {source}")]
    Plugin {
        component: &'static str,
        name: String,
        #[source]
        source: PluginError,
    },

    #[error("producer '{name}': {source}")]
    Batch {
        name: String,
        #[source]
        source: DeliveryError,
    },

    #[error("router: {0}")]
    Router(#[from] RouterError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
