use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use fanout_api::{DropFn, Message, OverflowPolicy, PluginControl, PluginError, PluginState, StreamId};

use crate::batch::MessageBatch;

/// Control commands buffered before `control` reports congestion.
const CONTROL_CAPACITY: usize = 8;

// ═══════════════════════════════════════════════════════════════
//  PluginStateCell
// ═══════════════════════════════════════════════════════════════

/// Observable lifecycle state with guarded transitions.
///
/// `Initializing → Active ⇄ Blocked → Stopping → Stopped`. Every transition
/// method returns whether it changed the state.
#[derive(Debug)]
pub struct PluginStateCell {
    tx: watch::Sender<PluginState>,
}

impl Default for PluginStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginStateCell {
    pub fn new() -> Self {
        Self { tx: watch::Sender::new(PluginState::Initializing) }
    }

    pub fn get(&self) -> PluginState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PluginState> {
        self.tx.subscribe()
    }

    fn transition(&self, from: &[PluginState], to: PluginState) -> bool {
        self.tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub fn activate(&self) -> bool {
        self.transition(&[PluginState::Initializing], PluginState::Active)
    }

    /// Sink unusable. Only an active plugin can become blocked.
    pub fn block(&self) -> bool {
        self.transition(&[PluginState::Active], PluginState::Blocked)
    }

    pub fn unblock(&self) -> bool {
        self.transition(&[PluginState::Blocked], PluginState::Active)
    }

    pub fn begin_stop(&self) -> bool {
        self.transition(
            &[PluginState::Initializing, PluginState::Active, PluginState::Blocked],
            PluginState::Stopping,
        )
    }

    pub fn finish(&self) -> bool {
        self.tx.send_if_modified(|state| {
            let changed = *state != PluginState::Stopped;
            *state = PluginState::Stopped;
            changed
        })
    }

    /// Resolve once the state is at least `target` in lifecycle order.
    pub async fn wait_for(&self, target: PluginState) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state >= target).await;
    }
}

// ═══════════════════════════════════════════════════════════════
//  ProducerHandler
// ═══════════════════════════════════════════════════════════════

/// Per-producer behavior driven by [`ProducerCore::run`].
///
/// Every hook is awaited by the control loop. Blocking sink I/O belongs on
/// the blocking pool, not inline in a hook.
pub trait ProducerHandler: Send {
    /// Period of the flush tick.
    fn tick_interval(&self) -> Duration;

    fn on_tick(&mut self, core: &ProducerCore) -> impl Future<Output = ()> + Send;

    /// Explicit flush request (control command or backpressure).
    fn on_flush(&mut self, core: &ProducerCore) -> impl Future<Output = ()> + Send;

    /// Sink rotation request. Defaults to a plain flush.
    fn on_roll(&mut self, core: &ProducerCore) -> impl Future<Output = ()> + Send {
        self.on_flush(core)
    }

    /// Final drain. Runs in `Stopping`; must respect the shutdown timeout.
    fn close(&mut self, core: &ProducerCore) -> impl Future<Output = ()> + Send;
}

// ═══════════════════════════════════════════════════════════════
//  ProducerCore
// ═══════════════════════════════════════════════════════════════

/// Общая часть всех producer'ов: состояние, control-канал, политика
/// переполнения и drop-путь. Конкретный producer держит `ProducerCore`
/// полем и делегирует ему.
pub struct ProducerCore {
    name: String,
    streams: Vec<StreamId>,
    state: Arc<PluginStateCell>,
    control_tx: mpsc::Sender<PluginControl>,
    control_rx: Mutex<Option<mpsc::Receiver<PluginControl>>>,
    cancel: CancellationToken,
    overflow: OverflowPolicy,
    shutdown_timeout: Duration,
    dropper: DropFn,
}

impl ProducerCore {
    pub fn new(name: impl Into<String>, streams: Vec<StreamId>, dropper: DropFn) -> Self {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        Self {
            name: name.into(),
            streams,
            state: Arc::new(PluginStateCell::new()),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            cancel: CancellationToken::new(),
            overflow: OverflowPolicy::default(),
            shutdown_timeout: Duration::from_secs(1),
            dropper,
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Tie the producer to an outer cancellation scope.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn streams(&self) -> &[StreamId] {
        &self.streams
    }

    pub fn state(&self) -> PluginState {
        self.state.get()
    }

    pub fn state_cell(&self) -> &Arc<PluginStateCell> {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state() == PluginState::Active
    }

    pub fn is_blocked(&self) -> bool {
        self.state() == PluginState::Blocked
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn dropper(&self) -> &DropFn {
        &self.dropper
    }

    // ── Control ──

    /// Write side of the control channel.
    ///
    /// A stop command always gets through: if the channel is congested the
    /// cancellation token is used instead.
    pub fn control(&self, command: PluginControl) -> Result<(), PluginError> {
        match self.control_tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(PluginControl::StopProducer)) => {
                self.cancel.cancel();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                Err(PluginError::state(format!("{}: control channel congested, {cmd:?} rejected", self.name)))
            }
            Err(mpsc::error::TrySendError::Closed(cmd)) => {
                Err(PluginError::state(format!("{}: producer stopped, {cmd:?} rejected", self.name)))
            }
        }
    }

    /// Ask the loop for a flush. A congested channel already holds one.
    pub fn request_flush(&self) {
        let _ = self.control_tx.try_send(PluginControl::Flush);
    }

    /// Cancel the control loop without going through the channel.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    // ── Ingress ──

    /// Reroute an undeliverable message to its drop stream.
    pub fn drop_message(&self, msg: Message) {
        tracing::debug!(producer = %self.name, stream = %msg.stream(), seq = msg.sequence(), "message dropped");
        (self.dropper)(msg);
    }

    /// Append to `batch` according to the overflow policy.
    ///
    /// `Drop` never waits. `BackPressure` requests flushes while the batch is
    /// full and gives up once the producer leaves `Active` or `timeout`
    /// expires. Returns whether the message was buffered.
    pub async fn enqueue(&self, batch: &MessageBatch, msg: Message, timeout: Option<Duration>) -> bool {
        match self.overflow {
            OverflowPolicy::Drop => match batch.try_append(msg) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(producer = %self.name, reason = %e, "batch rejected message");
                    self.drop_message(e.into_message());
                    false
                }
            },
            OverflowPolicy::BackPressure => {
                let deadline = timeout.map(|t| Instant::now() + t);
                batch
                    .append_retry(
                        msg,
                        || self.request_flush(),
                        || self.is_active() && deadline.is_none_or(|d| Instant::now() < d),
                        |m| {
                            tracing::warn!(producer = %self.name, state = %self.state(), "backpressure gave up");
                            self.drop_message(m);
                        },
                    )
                    .await
            }
        }
    }

    // ── Control loop ──

    fn take_control(&self) -> Option<mpsc::Receiver<PluginControl>> {
        self.control_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Event loop with three wake sources: cancellation, control command,
    /// flush tick. Returns after the handler's `close` once `Stopped`.
    pub async fn run<H: ProducerHandler>(&self, handler: &mut H) {
        let Some(mut control) = self.take_control() else {
            tracing::warn!(producer = %self.name, "control loop already started");
            return;
        };

        if !self.state.activate() {
            tracing::warn!(producer = %self.name, state = %self.state(), "producer not startable");
            self.state.finish();
            return;
        }
        tracing::info!(producer = %self.name, streams = ?self.streams, "producer started");

        let mut ticker = tokio::time::interval(handler.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = control.recv() => match cmd {
                    Some(PluginControl::StopProducer) | None => break,
                    Some(PluginControl::Flush) => handler.on_flush(self).await,
                    Some(PluginControl::Roll) => handler.on_roll(self).await,
                    Some(PluginControl::StopConsumer) => {
                        tracing::debug!(producer = %self.name, "ignoring consumer stop command");
                    }
                },
                _ = ticker.tick() => handler.on_tick(self).await,
            }
        }

        self.state.begin_stop();
        tracing::info!(producer = %self.name, "producer stopping");
        handler.close(self).await;
        control.close();
        self.state.finish();
        tracing::info!(producer = %self.name, "producer stopped");
    }
}
