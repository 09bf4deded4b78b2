//! Controller engine
//!
//! The shared machinery every concrete backend composes (never inherits):
//! the state vector behind a lock, the event hub, the bounded submission
//! queue, per-instruction lifecycle tracking, character-counting flow
//! control toward the device buffer, cancellation fan-out, and the error
//! latch.
//!
//! The engine is passive: a backend's IO task drains it with
//! [`next_ready`] and reports device progress back through
//! [`on_ack`]/[`on_executing`]/[`on_executed`]/[`on_instruction_error`].
//! Hooks and completions are always dispatched after internal locks are
//! released, so hook bundles may call back into the engine.
//!
//! [`next_ready`]: ControllerEngine::next_ready
//! [`on_ack`]: ControllerEngine::on_ack
//! [`on_executing`]: ControllerEngine::on_executing
//! [`on_executed`]: ControllerEngine::on_executed
//! [`on_instruction_error`]: ControllerEngine::on_instruction_error

use cnclink_core::lifecycle::dispatch_stage;
use cnclink_core::{
    ControllerError, EventHub, InstructionSource, InstructionStage, LifecycleTracker,
    MachineState, Result, SendItem, StatusSnapshot,
};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify, Semaphore};
use uuid::Uuid;

/// Engine tuning
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Maximum instructions outstanding (queued plus in flight); submission
    /// suspends beyond this
    pub queue_capacity: usize,
    /// Size of the device's receive buffer in characters, for flow control
    pub device_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            device_buffer_size: 128,
        }
    }
}

/// One instruction somewhere between submission and its terminal event
struct InFlight {
    id: Uuid,
    text: String,
    /// Characters this line occupies in the device buffer (incl. newline)
    cost: usize,
    tracker: LifecycleTracker,
    completion: Option<oneshot::Sender<Result<()>>>,
    /// Held until the terminal event; releasing it frees a queue slot
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl InFlight {
    /// Resolve the submitter's completion future
    fn complete(&mut self, result: Result<()>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

/// A line the writer should transmit now
#[derive(Debug, Clone)]
pub struct OutgoingLine {
    /// Instruction id
    pub id: Uuid,
    /// Raw text, no terminator
    pub text: String,
}

/// Completion future for one submitted instruction
pub struct SubmitHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<()>>,
}

impl SubmitHandle {
    /// Id of the submitted instruction
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the terminal event
    pub async fn executed(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without a verdict: the record was discarded
            Err(_) => Err(ControllerError::Cancelled),
        }
    }

    /// Non-blocking check for the terminal event
    pub fn try_result(&mut self) -> Option<Result<()>> {
        use tokio::sync::oneshot::error::TryRecvError;
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(ControllerError::Cancelled)),
        }
    }
}

/// The composed controller core
///
/// Owns the state vector, event hub, and instruction queues for one device
/// connection. See the module docs for the division of labour between the
/// engine and a backend's IO task.
pub struct ControllerEngine {
    state: RwLock<MachineState>,
    events: EventHub,
    /// Accepted, not yet transmitted
    queue: Mutex<VecDeque<InFlight>>,
    /// Transmitted, awaiting their terminal event
    in_flight: Mutex<VecDeque<InFlight>>,
    slots: Arc<Semaphore>,
    device_buffer_size: usize,
    /// Characters currently occupying the device receive buffer
    buffered_chars: AtomicUsize,
    jog_outstanding: AtomicBool,
    /// Wakes `wait_sync` waiters
    sync_notify: Notify,
    /// Wakes the backend IO task
    work_notify: Notify,
}

impl ControllerEngine {
    /// Create an engine with a fresh state vector and event hub
    pub fn new(config: EngineConfig) -> Self {
        Self {
            state: RwLock::new(MachineState::new()),
            events: EventHub::new(),
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(VecDeque::new()),
            slots: Arc::new(Semaphore::new(config.queue_capacity.max(1))),
            device_buffer_size: config.device_buffer_size.max(1),
            buffered_chars: AtomicUsize::new(0),
            jog_outstanding: AtomicBool::new(false),
            sync_notify: Notify::new(),
            work_notify: Notify::new(),
        }
    }

    /// The controller-wide event hub
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Read the state vector
    pub fn with_state<R>(&self, f: impl FnOnce(&MachineState) -> R) -> R {
        f(&self.state.read())
    }

    /// Commit a batch of state mutations
    ///
    /// Publishes exactly one `status_update` per committed batch and wakes
    /// waiters whose conditions may have changed.
    pub fn update_state(&self, f: impl FnOnce(&mut MachineState)) {
        let snapshot = {
            let mut state = self.state.write();
            f(&mut state);
            StatusSnapshot::capture(&state)
        };
        self.events.publish_status(snapshot);
        self.sync_notify.notify_waiters();
        self.work_notify.notify_one();
    }

    /// Immutable snapshot of the state vector
    pub fn status(&self) -> StatusSnapshot {
        self.with_state(StatusSnapshot::capture)
    }

    /// The latched controller-level error, if any
    pub fn latched_error(&self) -> Option<ControllerError> {
        self.with_state(|s| s.error_data.clone())
    }

    /// Whether a feed hold is active
    pub fn is_held(&self) -> bool {
        self.with_state(|s| s.held)
    }

    /// Instructions accepted but not yet transmitted
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Instructions transmitted and awaiting their terminal event
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Id of the oldest in-flight instruction, if any
    pub fn front_in_flight_id(&self) -> Option<Uuid> {
        self.in_flight.lock().front().map(|r| r.id)
    }

    /// Whether nothing is queued, in flight, or moving
    pub fn is_idle(&self) -> bool {
        self.queued_len() == 0 && self.in_flight_len() == 0 && self.with_state(|s| !s.moving)
    }

    /// Suspend until the engine may have work for the IO task
    pub async fn work_available(&self) {
        self.work_notify.notified().await;
    }

    /// Wake the IO task for work the engine cannot see (e.g. a pending jog)
    pub fn notify_work(&self) {
        self.work_notify.notify_one();
    }

    /// Submit one item to the transmit queue
    ///
    /// Suspends while the queue is at capacity (backpressure). The `queued`
    /// lifecycle event fires synchronously before this returns. Fails
    /// immediately with the latched error when the controller is alarmed.
    pub async fn submit(&self, item: SendItem) -> Result<SubmitHandle> {
        if let Some(err) = self.latched_error() {
            return Err(err);
        }

        let (id, text, hooks) = match item {
            SendItem::Line(text) => (Uuid::new_v4(), text, None),
            SendItem::Instruction(instr) => instr.into_parts(),
        };

        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ControllerError::Cancelled)?;

        // The latch may have been set while we waited for a slot.
        if let Some(err) = self.latched_error() {
            return Err(err);
        }

        let mut tracker = LifecycleTracker::new(hooks);
        let dispatch = tracker.hooks();
        let entered = tracker.advance(InstructionStage::Queued);
        if let Some(hooks) = dispatch {
            for stage in entered {
                dispatch_stage(hooks.as_ref(), stage);
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        let cost = text.len() + 1;
        tracing::trace!(%id, text = %text, "queued");
        self.queue.lock().push_back(InFlight {
            id,
            text,
            cost,
            tracker,
            completion: Some(done_tx),
            _permit: permit,
        });
        self.work_notify.notify_one();

        Ok(SubmitHandle { id, rx: done_rx })
    }

    /// Pop the next line the device has room for
    ///
    /// Returns `None` while held, alarmed, the queue is empty, or the device
    /// buffer cannot take the front line yet. Fires the `sent` lifecycle
    /// event and the `sent` broadcast for the popped line.
    pub fn next_ready(&self) -> Option<OutgoingLine> {
        if self.latched_error().is_some() || self.is_held() {
            return None;
        }

        let (out, hooks, entered) = {
            let mut queue = self.queue.lock();
            let cost = queue.front()?.cost;
            let buffered = self.buffered_chars.load(Ordering::SeqCst);
            // An oversized line goes out alone once the buffer is empty,
            // otherwise it could never be sent at all.
            if buffered > 0 && buffered + cost > self.device_buffer_size {
                return None;
            }
            let mut record = queue.pop_front()?;
            self.buffered_chars.fetch_add(cost, Ordering::SeqCst);
            let hooks = record.tracker.hooks();
            let entered = record.tracker.advance(InstructionStage::Sent);
            let out = OutgoingLine {
                id: record.id,
                text: record.text.clone(),
            };
            self.in_flight.lock().push_back(record);
            (out, hooks, entered)
        };

        if let Some(hooks) = hooks {
            for stage in entered {
                dispatch_stage(hooks.as_ref(), stage);
            }
        }
        self.events.publish_sent(&out.text);
        Some(out)
    }

    /// Device acknowledged receipt of the oldest unacknowledged line
    pub fn on_ack(&self) {
        let fired = {
            let mut in_flight = self.in_flight.lock();
            let Some(record) = in_flight
                .iter_mut()
                .find(|r| r.tracker.stage() < Some(InstructionStage::Ack))
            else {
                return;
            };
            let _ = self
                .buffered_chars
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(record.cost))
                });
            (record.tracker.hooks(), record.tracker.advance(InstructionStage::Ack))
        };
        if let Some(hooks) = fired.0 {
            for stage in fired.1 {
                dispatch_stage(hooks.as_ref(), stage);
            }
        }
        self.work_notify.notify_one();
    }

    /// Device started acting on the oldest line not yet executing
    pub fn on_executing(&self) {
        let fired = {
            let mut in_flight = self.in_flight.lock();
            let Some(record) = in_flight
                .iter_mut()
                .find(|r| r.tracker.stage() < Some(InstructionStage::Executing))
            else {
                return;
            };
            (
                record.tracker.hooks(),
                record.tracker.advance(InstructionStage::Executing),
            )
        };
        if let Some(hooks) = fired.0 {
            for stage in fired.1 {
                dispatch_stage(hooks.as_ref(), stage);
            }
        }
    }

    /// Device finished the oldest in-flight instruction
    ///
    /// Any skipped stages (`ack`, `executing`) are synthesized in order
    /// before the terminal `executed`.
    pub fn on_executed(&self) {
        // The record stays in the queue until its hooks have fired, so
        // `wait_sync` cannot observe an idle engine with events pending.
        let (hooks, entered, completion, id) = {
            let mut in_flight = self.in_flight.lock();
            let Some(record) = in_flight.front_mut() else {
                return;
            };
            self.reclaim_buffer(record);
            (
                record.tracker.hooks(),
                record.tracker.advance(InstructionStage::Executed),
                record.completion.take(),
                record.id,
            )
        };
        if let Some(hooks) = hooks {
            for stage in entered {
                dispatch_stage(hooks.as_ref(), stage);
            }
        }
        if let Some(tx) = completion {
            let _ = tx.send(Ok(()));
        }
        self.remove_front(id);
        self.sync_notify.notify_waiters();
        self.work_notify.notify_one();
    }

    /// Device rejected or failed the oldest in-flight instruction
    ///
    /// Terminates only that instruction; the queue keeps flowing. Use
    /// [`fatal`] for controller-level failures.
    ///
    /// [`fatal`]: ControllerEngine::fatal
    pub fn on_instruction_error(&self, error: ControllerError) {
        let (hooks, completion, id) = {
            let mut in_flight = self.in_flight.lock();
            let Some(record) = in_flight.front_mut() else {
                return;
            };
            tracing::debug!(id = %record.id, kind = %error.kind(), "instruction failed");
            self.reclaim_buffer(record);
            (
                record.tracker.fail(),
                record.completion.take(),
                record.id,
            )
        };
        if let Some(hooks) = hooks {
            hooks.on_error(&error);
        }
        if let Some(tx) = completion {
            let _ = tx.send(Err(error));
        }
        self.remove_front(id);

        // Stream-error fan-out: while a program stream is running, one
        // failing instruction cancels everything queued behind it.
        if self.with_state(|s| s.program_running) {
            self.cancel();
        }

        self.sync_notify.notify_waiters();
        self.work_notify.notify_one();
    }

    /// Abort everything outstanding
    ///
    /// Every queued and in-flight instruction terminates with `cancelled`,
    /// the hold is released, and motion is marked stopped. Idempotent: with
    /// nothing outstanding and no hold this is a no-op.
    pub fn cancel(&self) {
        let drained = self.drain_outstanding();
        self.jog_outstanding.store(false, Ordering::SeqCst);
        self.fail_all(drained, &ControllerError::Cancelled);

        if self.with_state(|s| s.held || s.moving) {
            self.update_state(|s| {
                s.held = false;
                s.moving = false;
            });
        }
        self.sync_notify.notify_waiters();
        self.work_notify.notify_one();
    }

    /// Latch a controller-level failure
    ///
    /// Sets the error latch (forcing `ready` off), cancels everything
    /// outstanding (which also drops any hold), and emits exactly one
    /// controller-level `error` broadcast. Later fatals while latched are
    /// ignored.
    pub fn fatal(&self, error: ControllerError) {
        let snapshot = {
            let mut state = self.state.write();
            if state.error() {
                return;
            }
            tracing::error!(kind = %error.kind(), "controller fault: {}", error);
            state.set_error(error.clone());
            StatusSnapshot::capture(&state)
        };
        self.events.publish_status(snapshot);

        self.cancel();

        self.events.publish_error(error);
        self.sync_notify.notify_waiters();
        self.work_notify.notify_one();
    }

    /// Release the error latch
    pub fn clear_latch(&self) {
        if self.latched_error().is_some() {
            self.update_state(|s| s.clear_error());
        }
    }

    /// Engine side of a feed hold: stop handing out lines
    pub fn hold(&self) {
        if !self.is_held() {
            self.update_state(|s| s.held = true);
        }
    }

    /// Release the engine side of a feed hold
    pub fn resume(&self) {
        if self.is_held() {
            self.update_state(|s| s.held = false);
        }
    }

    /// Claim the single outstanding-jog slot
    ///
    /// Returns false when a jog is already outstanding; the caller must then
    /// ignore the request silently.
    pub fn try_begin_jog(&self) -> bool {
        !self.jog_outstanding.swap(true, Ordering::SeqCst)
    }

    /// Release the outstanding-jog slot
    pub fn end_jog(&self) {
        self.jog_outstanding.store(false, Ordering::SeqCst);
    }

    /// Wait until the queue is drained, everything sent is terminal, and
    /// motion has stopped
    ///
    /// Never discards unsent items. Fails with the latched error when the
    /// controller alarms while waiting.
    pub async fn wait_sync(&self) -> Result<()> {
        loop {
            let notified = self.sync_notify.notified();
            if let Some(err) = self.latched_error() {
                return Err(err);
            }
            if self.is_idle() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Feed a whole source through the queue
    ///
    /// Pulls the next item only after queue capacity frees up, so
    /// backpressure reaches the source. Resolves when every item executed;
    /// fails with the first error, cancelling the remainder.
    pub async fn send_stream(&self, source: &mut dyn InstructionSource) -> Result<()> {
        self.update_state(|s| s.program_running = true);
        let result = self.run_stream(source).await;
        self.update_state(|s| s.program_running = false);
        result
    }

    async fn run_stream(&self, source: &mut dyn InstructionSource) -> Result<()> {
        let mut handles: VecDeque<SubmitHandle> = VecDeque::new();
        let mut first_error: Option<ControllerError> = None;

        'feed: loop {
            // Reap finished items as we go; completions arrive in FIFO
            // order, so only the front can be ready.
            while let Some(front) = handles.front_mut() {
                match front.try_result() {
                    Some(Ok(())) => {
                        handles.pop_front();
                    }
                    Some(Err(err)) => {
                        first_error = Some(err);
                        handles.pop_front();
                        break 'feed;
                    }
                    None => break,
                }
            }

            match source.next_item().await {
                Ok(Some(item)) => match self.submit(item).await {
                    Ok(handle) => handles.push_back(handle),
                    Err(err) => {
                        first_error = Some(err);
                        break 'feed;
                    }
                },
                Ok(None) => break 'feed,
                Err(err) => {
                    first_error = Some(err);
                    break 'feed;
                }
            }
        }

        if first_error.is_none() {
            while let Some(handle) = handles.pop_front() {
                if let Err(err) = handle.executed().await {
                    first_error = Some(err);
                    break;
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => {
                // Stream-error fan-out: everything still outstanding is
                // cancelled, and the stream fails with the first error.
                self.cancel();
                while let Some(handle) = handles.pop_front() {
                    let _ = handle.executed().await;
                }
                Err(err)
            }
        }
    }

    fn drain_outstanding(&self) -> Vec<InFlight> {
        let mut drained: Vec<InFlight> = self.queue.lock().drain(..).collect();
        drained.extend(self.in_flight.lock().drain(..));
        self.buffered_chars.store(0, Ordering::SeqCst);
        drained
    }

    fn fail_all(&self, records: Vec<InFlight>, error: &ControllerError) {
        for mut record in records {
            let hooks = record.tracker.fail();
            record.complete(Err(error.clone()));
            if let Some(hooks) = hooks {
                hooks.on_error(error);
            }
        }
    }

    /// Drop the front in-flight record, but only if it is still the one the
    /// caller finished (a concurrent cancel may have drained it already).
    fn remove_front(&self, id: Uuid) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.front().map(|r| r.id) == Some(id) {
            in_flight.pop_front();
        }
    }

    fn reclaim_buffer(&self, record: &InFlight) {
        // Lines that never got an ack still occupy the flow-control budget.
        if record.tracker.stage() < Some(InstructionStage::Ack) {
            let _ = self
                .buffered_chars
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(record.cost))
                });
        }
    }
}

impl std::fmt::Debug for ControllerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerEngine")
            .field("queued", &self.queued_len())
            .field("in_flight", &self.in_flight_len())
            .field(
                "buffered_chars",
                &self.buffered_chars.load(Ordering::SeqCst),
            )
            .finish()
    }
}
