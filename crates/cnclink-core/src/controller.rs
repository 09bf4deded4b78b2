//! The controller contract
//!
//! [`Controller`] is the polymorphic interface a concrete firmware backend
//! implements and everything upstream consumes. The contract fixes the
//! semantics of connection management, submission, synchronisation, the
//! real-time verbs, motion primitives, and status snapshots; backends supply
//! the device protocol behind them.
//!
//! A backend that cannot support an operation must return
//! [`Unsupported`](crate::error::ControllerError::Unsupported), never
//! silently ignore the call.

use crate::error::Result;
use crate::event_bus::EventHub;
use crate::gcode::{GcodeInstruction, SendItem};
use crate::machine::status::StatusSnapshot;
use crate::machine::PartialPosition;
use crate::stream::{FileSource, InstructionSource};
use async_trait::async_trait;
use std::path::Path;

/// Abstract CNC controller
///
/// One instance owns one device connection and its mirrored state vector.
/// All methods take `&self`: the real-time verbs must remain callable while
/// a motion future is pending on the same instance.
///
/// # Ordering
///
/// Instructions submitted to the same controller reach the device in
/// submission order. Real-time verbs bypass that order and act immediately.
/// Concurrent submission during [`wait_sync`] is undefined for the caller
/// but must never corrupt internal state.
///
/// [`wait_sync`]: Controller::wait_sync
#[async_trait]
pub trait Controller: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Open the transport and drive the backend handshake
    ///
    /// While `retry` is true, connection failures are retried with backoff
    /// until the device answers or the caller drops the future. Emits
    /// `connected` once the transport is open and `ready` once the device
    /// reports idle and un-alarmed.
    async fn init_connection(&self, retry: bool) -> Result<()>;

    /// Forcibly re-initialise the device
    ///
    /// Invalidates every in-flight instruction with a terminal `cancelled`
    /// error, resets the state vector, then re-drives the handshake.
    async fn reset(&self) -> Result<()>;

    /// Attempt to clear a latched alarm
    ///
    /// On success the error latch is released; if the device refuses, fails
    /// with a `machine_error`.
    async fn clear_error(&self) -> Result<()>;

    /// Enqueue a raw textual line (no trailing newline) for transmission
    ///
    /// Returns as soon as the line is queued; progress is observable through
    /// the event hub. No lifecycle hooks fire for raw lines.
    async fn send_line(&self, line: &str) -> Result<()>;

    /// Enqueue a structured instruction
    ///
    /// If the instruction carries a hook bundle, lifecycle events fire in
    /// order as it progresses.
    async fn send_gcode(&self, instruction: GcodeInstruction) -> Result<()>;

    /// Dispatch helper: tagged instructions go to [`send_gcode`], raw lines
    /// to [`send_line`]
    ///
    /// [`send_gcode`]: Controller::send_gcode
    /// [`send_line`]: Controller::send_line
    async fn send(&self, item: SendItem) -> Result<()> {
        match item {
            SendItem::Line(line) => self.send_line(&line).await,
            SendItem::Instruction(instruction) => self.send_gcode(instruction).await,
        }
    }

    /// Consume a source, feeding every item through the submission queue
    ///
    /// Applies backpressure: items are pulled only as queue capacity frees
    /// up. Resolves when every item has executed. Fails with the first
    /// item's error, after which the remaining items are cancelled.
    async fn send_stream(&self, source: &mut dyn InstructionSource) -> Result<()>;

    /// Stream a UTF-8 text file line by line
    ///
    /// Trailing newlines are stripped; a final line without one is still
    /// sent, and empty lines pass through unchanged.
    async fn send_file(&self, path: &Path) -> Result<()> {
        let mut source = FileSource::open(path).await?;
        self.send_stream(&mut source).await
    }

    /// Wait until the controller is fully caught up with the device
    ///
    /// Completes when the transmit queue is drained, every sent instruction
    /// reached a terminal event, and motion has stopped. Unsent items are
    /// never discarded. Once it returns, the state vector is coherent with
    /// the device until the next submission.
    async fn wait_sync(&self) -> Result<()>;

    /// Feed hold: pause in-flight motion, retain the queue
    fn hold(&self) -> Result<()>;

    /// Release a feed hold
    fn resume(&self) -> Result<()>;

    /// Abort current operations
    ///
    /// Every in-flight instruction terminates with `cancelled`, queued items
    /// are flushed (also `cancelled`), motion stops, and any hold is
    /// released. Idempotent.
    fn cancel(&self) -> Result<()>;

    /// Nudge one axis by a signed increment, bypassing the queue
    ///
    /// At most one real-time jog may be outstanding; while one is, further
    /// calls are silently ignored.
    fn real_time_move(&self, axis: usize, increment: f64) -> Result<()>;

    /// Linear move; absent components hold their axis
    ///
    /// Resolves when motion completes and the machine is stopped. Rejects
    /// with `cancelled` if [`cancel`] is invoked first. Must not run
    /// concurrently with other motion-producing calls.
    ///
    /// [`cancel`]: Controller::cancel
    async fn move_to(&self, target: PartialPosition, feed: Option<f64>) -> Result<()>;

    /// Home the given axes (default: every homable axis)
    ///
    /// Updates the per-axis homed flags on completion.
    async fn home(&self, axes: Option<Vec<usize>>) -> Result<()>;

    /// Move toward `target` until the probe trips
    ///
    /// Resolves with the machine position at the trip and leaves the machine
    /// parked there. Fails with `probe_end` if the target is reached without
    /// a trip, `probe_initial_state` if the probe is already tripped on
    /// entry, or `probe_not_tripped` for a device-reported refusal.
    async fn probe(&self, target: PartialPosition, feed: Option<f64>) -> Result<Vec<f64>>;

    /// Immutable snapshot of the mirrored state
    fn status(&self) -> StatusSnapshot;

    /// The controller's event hub
    fn events(&self) -> &EventHub;
}
