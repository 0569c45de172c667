//! Bounded, concurrency-safe message buffer shared by every producer.
//!
//! Appenders (router tasks) and the single flush path (producer loop) only
//! meet inside a short critical section: a flush takes a snapshot of the
//! queued messages and writes them with the lock released, so new appends
//! proceed while the snapshot is being written.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use fanout_api::Message;

use crate::{AppendError, DeliveryError};

/// Upper bound for one wait inside [`MessageBatch::append_retry`] before the
/// producer state is polled again.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════
//  FlushTarget
// ═══════════════════════════════════════════════════════════════

/// What became of a message the flush target accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Written,
    /// Sent to the drop path instead of the sink (formatter rejected it).
    Rerouted,
}

/// Receiver of a flush snapshot.
pub trait FlushTarget {
    /// Write one message. Handing the message back marks it as failed and
    /// ends the write sequence for the rest of the snapshot.
    fn write(&mut self, msg: Message) -> Result<Delivery, Message>;

    /// Account for a message that will not be written: a failed write,
    /// the remainder of a snapshot after a failure, or a forced drop.
    fn discard(&mut self, msg: Message);
}

impl<W, D> FlushTarget for (W, D)
where
    W: FnMut(Message) -> Result<(), Message>,
    D: FnMut(Message),
{
    fn write(&mut self, msg: Message) -> Result<Delivery, Message> {
        (self.0)(msg).map(|()| Delivery::Written)
    }

    fn discard(&mut self, msg: Message) {
        (self.1)(msg)
    }
}

/// Outcome of one flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Accepted by [`FlushTarget::write`].
    pub written: usize,
    /// Rejected by the write path (handed back or panicked).
    pub failed: usize,
    /// Not written: rerouted by the target, rest of a snapshot after a
    /// failure, or past the deadline.
    pub dropped: usize,
}

impl FlushReport {
    pub fn total(&self) -> usize {
        self.written + self.failed + self.dropped
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.dropped == 0
    }
}

// ═══════════════════════════════════════════════════════════════
//  MessageBatch
// ═══════════════════════════════════════════════════════════════

struct State {
    queue: VecDeque<Message>,
    closed: bool,
    flushing: bool,
    since_flush: usize,
    last_flush: Instant,
    forced_drops: u64,
}

/// Fixed-capacity FIFO of messages with flush thresholds.
pub struct MessageBatch {
    capacity: usize,
    state: Mutex<State>,
    /// Woken when room appears or the batch is closed.
    space: Notify,
    /// Woken when an in-flight flush completes.
    flushed: Notify,
}

impl std::fmt::Debug for MessageBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MessageBatch")
            .field("capacity", &self.capacity)
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .field("flushing", &state.flushing)
            .finish()
    }
}

impl MessageBatch {
    /// `capacity` must be non-zero; [`crate::BatchConfig::resolve`] enforces it.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(65536)),
                closed: false,
                flushing: false,
                since_flush: 0,
                last_flush: Instant::now(),
                forced_drops: 0,
            }),
            space: Notify::new(),
            flushed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Messages discarded because a shutdown deadline was exceeded.
    pub fn forced_drops(&self) -> u64 {
        self.lock().forced_drops
    }

    // ── Append ──

    /// Non-blocking append.
    pub fn try_append(&self, msg: Message) -> Result<(), AppendError> {
        let mut state = self.lock();
        if state.closed {
            return Err(AppendError::Closed(msg));
        }
        if state.queue.len() >= self.capacity {
            return Err(AppendError::Full(msg));
        }
        state.queue.push_back(msg);
        state.since_flush += 1;
        Ok(())
    }

    /// Append, waiting for room while the batch is full. Fails only with
    /// `Closed`.
    pub async fn append(&self, mut msg: Message) -> Result<(), AppendError> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_append(msg) {
                Err(AppendError::Full(m)) => {
                    msg = m;
                    space.await;
                }
                other => return other,
            }
        }
    }

    /// Append with the shared backpressure policy.
    ///
    /// While the batch is full and `is_active` holds, `try_flush` is asked to
    /// make room and the call waits for it. Once `is_active` turns false, or
    /// the batch is closed, the message goes to `on_drop` exactly once.
    /// Returns whether the message was buffered.
    pub async fn append_retry<F, A, D>(
        &self,
        mut msg: Message,
        mut try_flush: F,
        is_active: A,
        on_drop: D,
    ) -> bool
    where
        F: FnMut(),
        A: Fn() -> bool,
        D: FnOnce(Message),
    {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_append(msg) {
                Ok(()) => return true,
                Err(AppendError::Closed(m)) => {
                    on_drop(m);
                    return false;
                }
                Err(AppendError::Full(m)) => {
                    if !is_active() {
                        on_drop(m);
                        return false;
                    }
                    msg = m;
                    try_flush();
                    let _ = tokio::time::timeout(RETRY_INTERVAL, space).await;
                }
            }
        }
    }

    // ── Thresholds ──

    /// At least `count` messages were appended since the last flush.
    /// A count of zero behaves like one.
    pub fn reached_size_threshold(&self, count: usize) -> bool {
        self.lock().since_flush >= count.max(1)
    }

    /// At least `timeout` elapsed since the last flush, regardless of content.
    pub fn reached_time_threshold(&self, timeout: Duration) -> bool {
        let last = self.lock().last_flush;
        Instant::now().saturating_duration_since(last) >= timeout
    }

    // ── Flush ──

    /// Write every buffered message to `target` in arrival order.
    ///
    /// Returns `None` if another flush is still in flight.
    pub fn flush<T: FlushTarget + ?Sized>(&self, target: &mut T) -> Option<FlushReport> {
        self.flush_until(target, None)
    }

    /// Like [`flush`](Self::flush), but messages still unwritten at
    /// `deadline` are discarded and counted as forced drops.
    pub fn flush_until<T: FlushTarget + ?Sized>(
        &self,
        target: &mut T,
        deadline: Option<Instant>,
    ) -> Option<FlushReport> {
        let snapshot: Vec<Message> = {
            let mut state = self.lock();
            if state.flushing {
                return None;
            }
            state.flushing = true;
            state.since_flush = 0;
            state.last_flush = Instant::now();
            state.queue.drain(..).collect()
        };
        self.space.notify_waiters();

        let _in_flight = InFlight(self);
        let mut report = FlushReport::default();
        let mut messages = snapshot.into_iter();

        while let Some(msg) = messages.next() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                target.discard(msg);
                report.dropped += 1;
                report.dropped += discard_all(target, &mut messages);
                self.lock().forced_drops += report.dropped as u64;
                break;
            }

            let retained = msg.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| target.write(msg))) {
                Ok(Ok(Delivery::Written)) => report.written += 1,
                Ok(Ok(Delivery::Rerouted)) => report.dropped += 1,
                Ok(Err(failed)) => {
                    report.failed += 1;
                    target.discard(failed);
                    report.dropped += discard_all(target, &mut messages);
                    break;
                }
                Err(_) => {
                    tracing::error!(seq = retained.sequence(), "write path panicked, discarding rest of the batch");
                    report.failed += 1;
                    target.discard(retained);
                    report.dropped += discard_all(target, &mut messages);
                    break;
                }
            }
        }

        Some(report)
    }

    /// Discard everything buffered without writing, even while another
    /// flush is in flight.
    pub fn force_drop<T: FlushTarget + ?Sized>(&self, target: &mut T) -> usize {
        let pending: Vec<Message> = {
            let mut state = self.lock();
            let pending: Vec<Message> = state.queue.drain(..).collect();
            state.forced_drops += pending.len() as u64;
            pending
        };
        self.space.notify_waiters();

        let count = pending.len();
        for msg in pending {
            target.discard(msg);
        }
        if count > 0 {
            tracing::warn!(count, "force-dropped buffered messages");
        }
        count
    }

    // ── Shutdown ──

    /// Refuse further appends and wake blocked appenders so they see `Closed`.
    pub fn mark_closed(&self) {
        self.lock().closed = true;
        self.space.notify_waiters();
    }

    /// Close the batch and drain it into `target`, waiting at most `timeout`
    /// for an in-flight flush and for the drain itself. Whatever is left at
    /// the deadline is discarded through `target`.
    pub async fn close<T: FlushTarget + Send + ?Sized>(
        &self,
        target: &mut T,
        timeout: Duration,
    ) -> FlushReport {
        let deadline = self.begin_close(timeout).await;
        self.drain_closed(target, deadline)
    }

    /// First half of [`close`](Self::close): refuse appends and wait for an
    /// in-flight flush. Returns the drain deadline.
    pub async fn begin_close(&self, timeout: Duration) -> Instant {
        let deadline = Instant::now() + timeout;
        self.mark_closed();

        if let Err(e) = self.wait_for_flush_until(deadline, timeout).await {
            tracing::warn!(error = %e, "in-flight flush did not finish before shutdown deadline");
        }
        deadline
    }

    /// Second half of [`close`](Self::close). Synchronous, so a blocking sink
    /// can run it off the runtime.
    pub fn drain_closed<T: FlushTarget + ?Sized>(&self, target: &mut T, deadline: Instant) -> FlushReport {
        match self.flush_until(target, Some(deadline)) {
            Some(report) => report,
            None => {
                let dropped = self.force_drop(target);
                FlushReport { dropped, ..Default::default() }
            }
        }
    }

    /// Wait until no flush is in flight.
    pub async fn wait_for_flush(&self, timeout: Duration) -> Result<(), DeliveryError> {
        self.wait_for_flush_until(Instant::now() + timeout, timeout).await
    }

    async fn wait_for_flush_until(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        loop {
            let done = self.flushed.notified();
            tokio::pin!(done);
            done.as_mut().enable();

            if !self.lock().flushing {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, done).await.is_err() {
                return Err(DeliveryError::Timeout(timeout));
            }
        }
    }
}

/// Clears the in-flight flag when a flush ends, including by unwinding.
struct InFlight<'a>(&'a MessageBatch);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().flushing = false;
        self.0.flushed.notify_waiters();
    }
}

fn discard_all<T: FlushTarget + ?Sized>(
    target: &mut T,
    rest: &mut impl Iterator<Item = Message>,
) -> usize {
    let mut count = 0;
    for msg in rest {
        target.discard(msg);
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fanout_api::StreamId;

    use super::*;

    fn msg(seq: u64) -> Message {
        Message::new(format!("m{seq}"), StreamId::new("test"), seq)
    }

    /// Collects written and discarded sequence numbers.
    #[derive(Default)]
    struct Recorder {
        written: Vec<u64>,
        discarded: Vec<u64>,
        fail_on: Option<u64>,
    }

    impl FlushTarget for Recorder {
        fn write(&mut self, msg: Message) -> Result<Delivery, Message> {
            if self.fail_on == Some(msg.sequence()) {
                return Err(msg);
            }
            self.written.push(msg.sequence());
            Ok(Delivery::Written)
        }

        fn discard(&mut self, msg: Message) {
            self.discarded.push(msg.sequence());
        }
    }

    #[tokio::test]
    async fn flush_preserves_append_order() {
        let batch = MessageBatch::new(16);
        for i in 0..10 {
            batch.try_append(msg(i)).unwrap();
        }

        let mut rec = Recorder::default();
        let report = batch.flush(&mut rec).unwrap();

        assert_eq!(rec.written, (0..10).collect::<Vec<_>>());
        assert_eq!(report, FlushReport { written: 10, failed: 0, dropped: 0 });
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn full_batch_rejects_without_blocking() {
        let batch = MessageBatch::new(2);
        batch.try_append(msg(0)).unwrap();
        batch.try_append(msg(1)).unwrap();

        let err = batch.try_append(msg(2)).unwrap_err();
        assert!(matches!(err.as_delivery_error(), DeliveryError::Full));
        assert_eq!(err.into_message().sequence(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn thresholds_reset_after_flush() {
        let batch = MessageBatch::new(4);
        for i in 0..3 {
            batch.try_append(msg(i)).unwrap();
        }
        assert!(batch.reached_size_threshold(2));
        assert!(!batch.reached_time_threshold(Duration::from_secs(5)));

        let mut rec = Recorder::default();
        let report = batch.flush(&mut rec).unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(rec.written, vec![0, 1, 2]);
        assert!(batch.is_empty());
        assert!(!batch.reached_size_threshold(2));
        assert!(!batch.reached_size_threshold(1));
    }

    #[tokio::test(start_paused = true)]
    async fn time_threshold_ignores_message_count() {
        let batch = MessageBatch::new(4);
        assert!(!batch.reached_time_threshold(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(batch.reached_time_threshold(Duration::from_secs(5)));
        assert!(batch.is_empty());

        let mut rec = Recorder::default();
        batch.flush(&mut rec).unwrap();
        assert!(!batch.reached_time_threshold(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn failed_write_accounts_for_the_rest() {
        let batch = MessageBatch::new(4);
        for i in 1..=3 {
            batch.try_append(msg(i)).unwrap();
        }

        let mut rec = Recorder { fail_on: Some(2), ..Default::default() };
        let report = batch.flush(&mut rec).unwrap();

        assert_eq!(rec.written, vec![1]);
        assert_eq!(rec.discarded, vec![2, 3]);
        assert_eq!(report, FlushReport { written: 1, failed: 1, dropped: 1 });
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn panicking_writer_does_not_lose_the_remainder() {
        let batch = MessageBatch::new(4);
        for i in 0..4 {
            batch.try_append(msg(i)).unwrap();
        }

        let mut discarded = Vec::new();
        let mut target = (
            |m: Message| -> Result<(), Message> {
                if m.sequence() == 1 {
                    panic!("sink exploded");
                }
                Ok(())
            },
            |m: Message| discarded.push(m.sequence()),
        );
        let report = batch.flush(&mut target).unwrap();

        assert_eq!(report, FlushReport { written: 1, failed: 1, dropped: 2 });
        assert_eq!(discarded, vec![1, 2, 3]);

        // The in-flight flag was released by the unwinding flush.
        batch.try_append(msg(9)).unwrap();
        assert!(batch.flush(&mut Recorder::default()).is_some());
    }

    #[tokio::test]
    async fn close_rejects_later_appends() {
        let batch = MessageBatch::new(4);
        batch.try_append(msg(0)).unwrap();

        let mut rec = Recorder::default();
        let report = batch.close(&mut rec, Duration::from_secs(1)).await;
        assert_eq!(report.written, 1);
        assert!(batch.is_empty());
        assert_eq!(batch.forced_drops(), 0);

        for i in 1..4 {
            let err = batch.try_append(msg(i)).unwrap_err();
            assert!(matches!(err, AppendError::Closed(_)));
        }
        assert!(matches!(batch.append(msg(5)).await, Err(AppendError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn close_with_zero_timeout_force_drops_everything() {
        let batch = MessageBatch::new(16);
        for i in 0..10 {
            batch.try_append(msg(i)).unwrap();
        }

        let mut rec = Recorder::default();
        let report = batch.close(&mut rec, Duration::ZERO).await;

        assert!(rec.written.is_empty());
        assert_eq!(rec.discarded, (0..10).collect::<Vec<_>>());
        assert_eq!(report.dropped, 10);
        assert_eq!(batch.forced_drops(), 10);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn blocked_append_resumes_after_flush() {
        let batch = Arc::new(MessageBatch::new(1));
        batch.try_append(msg(0)).unwrap();

        let appender = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.append(msg(1)).await })
        };
        tokio::task::yield_now().await;
        assert!(!appender.is_finished());

        let mut rec = Recorder::default();
        batch.flush(&mut rec).unwrap();

        appender.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(rec.written, vec![0]);
    }

    #[tokio::test]
    async fn blocked_append_fails_when_closed() {
        let batch = Arc::new(MessageBatch::new(1));
        batch.try_append(msg(0)).unwrap();

        let appender = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.append(msg(1)).await })
        };
        tokio::task::yield_now().await;
        batch.mark_closed();

        let res = appender.await.unwrap();
        assert!(matches!(res, Err(AppendError::Closed(m)) if m.sequence() == 1));
    }

    #[tokio::test]
    async fn append_retry_drops_once_when_inactive() {
        let batch = MessageBatch::new(1);
        batch.try_append(msg(0)).unwrap();

        let flushes = AtomicUsize::new(0);
        let mut dropped = Vec::new();
        for seq in 1..=3 {
            let buffered = batch
                .append_retry(
                    msg(seq),
                    || {
                        flushes.fetch_add(1, Ordering::Relaxed);
                    },
                    || false,
                    |m| dropped.push(m.sequence()),
                )
                .await;
            assert!(!buffered);
        }

        assert_eq!(dropped, vec![1, 2, 3]);
        assert_eq!(flushes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn append_retry_flushes_to_make_room() {
        let batch = Arc::new(MessageBatch::new(1));
        batch.try_append(msg(0)).unwrap();

        let flusher = batch.clone();
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        let buffered = batch
            .append_retry(
                msg(1),
                move || {
                    let sink = sink.clone();
                    let mut target = (
                        move |m: Message| -> Result<(), Message> {
                            sink.lock().unwrap().push(m.sequence());
                            Ok(())
                        },
                        |_m: Message| {},
                    );
                    flusher.flush(&mut target);
                },
                || true,
                |_m| panic!("must not drop while active"),
            )
            .await;

        assert!(buffered);
        assert_eq!(*written.lock().unwrap(), vec![0]);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appenders_and_flushes_keep_every_message_once() {
        const APPENDERS: u64 = 4;
        const PER_TASK: u64 = 500;
        let total = (APPENDERS * PER_TASK) as usize;
        let batch = Arc::new(MessageBatch::new(64));

        let appenders: Vec<_> = (0..APPENDERS)
            .map(|id| {
                let batch = batch.clone();
                tokio::spawn(async move {
                    for i in 0..PER_TASK {
                        batch.append(msg(id * 10_000 + i)).await.unwrap();
                        if i % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();

        let flusher = {
            let batch = batch.clone();
            tokio::spawn(async move {
                let mut rec = Recorder::default();
                let mut flushes = 0;
                while rec.written.len() < total {
                    if batch.flush(&mut rec).is_some() {
                        flushes += 1;
                    }
                    tokio::task::yield_now().await;
                }
                (rec, flushes)
            })
        };

        for appender in appenders {
            appender.await.unwrap();
        }
        let (rec, flushes) = flusher.await.unwrap();

        assert!(flushes > 1);
        assert!(rec.discarded.is_empty());
        assert!(batch.is_empty());

        let mut seen = rec.written.clone();
        seen.sort_unstable();
        seen.dedup();
        let mut expected: Vec<u64> =
            (0..APPENDERS).flat_map(|id| (0..PER_TASK).map(move |i| id * 10_000 + i)).collect();
        expected.sort_unstable();
        assert_eq!(rec.written.len(), total);
        assert_eq!(seen, expected);

        for id in 0..APPENDERS {
            let own: Vec<u64> = rec.written.iter().copied().filter(|seq| seq / 10_000 == id).collect();
            assert_eq!(own, (0..PER_TASK).map(|i| id * 10_000 + i).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn concurrent_flush_is_skipped_and_awaitable() {
        let batch = Arc::new(MessageBatch::new(4));
        batch.try_append(msg(0)).unwrap();

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let worker = {
            let batch = batch.clone();
            std::thread::spawn(move || {
                let mut target = (
                    move |_m: Message| -> Result<(), Message> {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    },
                    |_m: Message| {},
                );
                batch.flush(&mut target)
            })
        };
        entered_rx.recv().unwrap();

        assert!(batch.flush(&mut Recorder::default()).is_none());
        assert!(matches!(
            batch.wait_for_flush(Duration::from_millis(20)).await,
            Err(DeliveryError::Timeout(_))
        ));

        release_tx.send(()).unwrap();
        batch.wait_for_flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(worker.join().unwrap().unwrap().written, 1);
    }
}
