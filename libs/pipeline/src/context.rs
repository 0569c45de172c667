use fanout_api::FormatterChain;

use crate::config::BatchSettings;
use crate::producer::ProducerCore;

/// Everything a producer factory gets besides its plugin table: the
/// prepared core (name, streams, drop path, overflow policy), validated
/// batch settings and the formatter chain.
pub struct ProducerContext {
    pub core: ProducerCore,
    pub batch: BatchSettings,
    pub formatters: FormatterChain,
}
