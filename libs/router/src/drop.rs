use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use fanout_api::{DropFn, Message};

/// Create the bounded drop queue. The sender side is handed to producers
/// before the router exists; the router's drop loop owns the receiver.
pub fn drop_queue(capacity: usize) -> (DropSender, DropReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DropSender { tx, discarded: Arc::new(AtomicU64::new(0)) }, DropReceiver { rx })
}

/// Non-blocking entry into the drop queue.
#[derive(Clone)]
pub struct DropSender {
    tx: mpsc::Sender<Message>,
    discarded: Arc<AtomicU64>,
}

impl DropSender {
    /// Reroute `msg` to its drop stream. A message already on its drop
    /// stream, or one that finds the queue full, is discarded.
    pub fn send(&self, msg: Message) {
        let Some(msg) = msg.into_dropped() else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("message already on its drop stream, discarded");
            return;
        };
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(stream = %msg.stream(), origin = %msg.origin(), "drop queue full, message discarded");
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(stream = %msg.stream(), "drop queue closed, message discarded");
            }
        }
    }

    /// The same sender as a [`DropFn`] for producers.
    pub fn dropper(&self) -> DropFn {
        let sender = self.clone();
        Arc::new(move |msg| sender.send(msg))
    }

    /// Messages lost for good.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

pub struct DropReceiver {
    pub(crate) rx: mpsc::Receiver<Message>,
}

impl DropReceiver {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use fanout_api::StreamId;

    use super::*;

    #[tokio::test]
    async fn reroutes_once_then_discards() {
        let (tx, mut rx) = drop_queue(4);
        tx.send(Message::new("x", StreamId::new("logs"), 1));

        let dropped = rx.recv().await.unwrap();
        assert_eq!(dropped.stream().as_str(), StreamId::DROPPED);
        assert_eq!(dropped.origin().as_str(), "logs");

        tx.send(dropped);
        assert_eq!(tx.discarded(), 1);
        assert!(rx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_never_blocks() {
        let (tx, _rx) = drop_queue(1);
        let dropper = tx.dropper();
        for seq in 0..3 {
            dropper(Message::new("x", StreamId::new("logs"), seq));
        }
        assert_eq!(tx.discarded(), 2);
    }
}
