mod endpoint;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use fanout_api::{PluginError, Producer, parse_plugin_config_opt};
use fanout_pipeline::{Acknowledge, BatchedProducer, ProducerContext};

pub use endpoint::Endpoint;
pub use sink::{SocketSink, SocketWriter};

// ════════════════════════════════════════════════════════════════
//  Configuration
// ════════════════════════════════════════════════════════════════

#[derive(serde::Deserialize)]
#[serde(default)]
struct SocketConfig {
    /// `host:port` или `unix:///path`.
    address: String,
    /// Ожидаемый ответ peer'а на каждое сообщение. Пусто — без подтверждений (UDP).
    acknowledge: String,
    /// Сколько ждать подтверждения, миллисекунды.
    ack_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self { address: ":5880".into(), acknowledge: String::new(), ack_timeout_ms: 2000 }
    }
}

// ════════════════════════════════════════════════════════════════
//  Plugin entry point
// ════════════════════════════════════════════════════════════════

pub fn create(ctx: ProducerContext, config: &serde_json::Value) -> Result<Arc<dyn Producer>, PluginError> {
    let cfg: SocketConfig = parse_plugin_config_opt(config)?;
    let timeout = Duration::from_millis(cfg.ack_timeout_ms.max(1));
    let acknowledge = Acknowledge::from_config(&cfg.acknowledge, timeout);
    let endpoint = Endpoint::parse(&cfg.address, acknowledge.is_some())?;

    tracing::info!(
        producer = %ctx.core.name(),
        endpoint = %endpoint,
        acknowledged = acknowledge.is_some(),
        "socket producer configured"
    );
    let sink = SocketSink::new(endpoint, acknowledge, timeout);
    Ok(Arc::new(BatchedProducer::new(ctx.core, ctx.batch, ctx.formatters, sink)))
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread;

    use fanout_api::{FormatterChain, Message, PluginControl, PluginState, StreamId};
    use fanout_pipeline::{BatchSettings, ProducerCore};

    use super::*;

    fn context(dropped: Arc<Mutex<Vec<Message>>>) -> ProducerContext {
        let dropper = Arc::new(move |msg: Message| dropped.lock().unwrap().push(msg));
        ProducerContext {
            core: ProducerCore::new("socket", vec![StreamId::new("logs")], dropper),
            batch: BatchSettings {
                max_count: 16,
                flush_count: 8,
                timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(2),
            },
            formatters: FormatterChain::default(),
        }
    }

    #[test]
    fn defaults_to_udp_on_localhost() {
        let cfg: SocketConfig = parse_plugin_config_opt(&serde_json::Value::Null).unwrap();
        let ep = Endpoint::parse(&cfg.address, !cfg.acknowledge.is_empty()).unwrap();
        assert_eq!(ep, Endpoint::Udp("localhost:5880".into()));
        assert_eq!(cfg.ack_timeout_ms, 2000);
    }

    #[test]
    fn bad_address_fails_creation() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let err = create(context(dropped), &serde_json::json!({ "address": "nowhere" })).err().unwrap();
        assert_eq!(err.kind(), fanout_api::ErrorKind::Config);
    }

    #[tokio::test]
    async fn acknowledged_delivery_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reply = stream.try_clone().unwrap();
            let mut lines = Vec::new();
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                reply.write_all(b"OK\n").unwrap();
                lines.push(line);
            }
            lines
        });

        let dropped = Arc::new(Mutex::new(Vec::new()));
        let config = serde_json::json!({ "address": addr, "acknowledge": "OK\\n" });
        let producer = create(context(dropped.clone()), &config).unwrap();
        let task = {
            let producer = producer.clone();
            tokio::spawn(async move { producer.produce().await })
        };
        while producer.state() != PluginState::Active {
            tokio::task::yield_now().await;
        }

        for seq in 0..3 {
            producer.enqueue(Message::new(format!("line {seq}\n"), StreamId::new("logs"), seq), None).await;
        }
        producer.control(PluginControl::StopProducer).unwrap();
        task.await.unwrap();

        assert_eq!(peer.join().unwrap(), vec!["line 0", "line 1", "line 2"]);
        assert!(dropped.lock().unwrap().is_empty());
        assert_eq!(producer.state(), PluginState::Stopped);
    }

    #[tokio::test]
    async fn pending_acknowledgement_does_not_stall_the_runtime() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let _ = stream.read_to_end(&mut received);
            received
        });

        let dropped = Arc::new(Mutex::new(Vec::new()));
        let config = serde_json::json!({ "address": addr, "acknowledge": "OK\\n", "ack_timeout_ms": 1500 });
        let producer = create(context(dropped.clone()), &config).unwrap();
        let task = {
            let producer = producer.clone();
            tokio::spawn(async move { producer.produce().await })
        };
        while producer.state() != PluginState::Active {
            tokio::task::yield_now().await;
        }

        producer.enqueue(Message::new("silent\n", StreamId::new("logs"), 0), None).await;
        producer.control(PluginControl::Flush).unwrap();

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(500), "runtime stalled for {:?}", started.elapsed());
        assert_eq!(producer.state(), PluginState::Active);

        let blocked = tokio::time::timeout(Duration::from_secs(5), async {
            while producer.state() != PluginState::Blocked {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(blocked.is_ok());
        assert_eq!(dropped.lock().unwrap().len(), 1);

        producer.control(PluginControl::StopProducer).unwrap();
        task.await.unwrap();
        assert_eq!(peer.join().unwrap(), b"silent\n");
    }
}
