//! Instruction lifecycle bus
//!
//! Every instruction that carries a hook bundle observes an ordered sequence
//! of lifecycle events:
//!
//! `queued → sent → ack → executing → executed`
//!
//! or a terminal `error` at any point before `executed`. Each event fires at
//! most once and the terminal event exactly once. A backend that cannot
//! observe a transition distinctly advances the tracker past it and the
//! skipped events are synthesized in order.
//!
//! Hooks are invoked synchronously from the controller's execution context
//! and must return quickly; they must not block or re-enter the controller's
//! submission path.

use crate::error::ControllerError;
use std::sync::Arc;

/// Ordered lifecycle stages of an in-flight instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstructionStage {
    /// Accepted into the transmit queue
    Queued,
    /// Bytes left the host for the device
    Sent,
    /// Device acknowledged receipt
    Ack,
    /// Device started acting on the instruction
    Executing,
    /// Completed
    Executed,
}

impl InstructionStage {
    /// Every stage, in lifecycle order
    pub const ALL: [InstructionStage; 5] = [
        InstructionStage::Queued,
        InstructionStage::Sent,
        InstructionStage::Ack,
        InstructionStage::Executing,
        InstructionStage::Executed,
    ];
}

impl std::fmt::Display for InstructionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Sent => write!(f, "sent"),
            Self::Ack => write!(f, "ack"),
            Self::Executing => write!(f, "executing"),
            Self::Executed => write!(f, "executed"),
        }
    }
}

/// Per-instruction receiver of lifecycle events (the hook bundle)
///
/// Implementations are shared between the submitter and the controller for
/// the instruction's flight and released on the terminal event. All methods
/// have empty defaults so a bundle only implements what it cares about.
pub trait InstructionHooks: Send + Sync {
    /// Instruction accepted into the transmit queue
    fn on_queued(&self) {}

    /// Instruction transmitted to the device
    fn on_sent(&self) {}

    /// Device acknowledged receipt
    fn on_ack(&self) {}

    /// Device started acting on the instruction
    fn on_executing(&self) {}

    /// Instruction completed
    fn on_executed(&self) {}

    /// Terminal failure; no further events follow
    fn on_error(&self, _error: &ControllerError) {}
}

/// Deliver one stage event to a hook bundle
pub fn dispatch_stage(hooks: &dyn InstructionHooks, stage: InstructionStage) {
    match stage {
        InstructionStage::Queued => hooks.on_queued(),
        InstructionStage::Sent => hooks.on_sent(),
        InstructionStage::Ack => hooks.on_ack(),
        InstructionStage::Executing => hooks.on_executing(),
        InstructionStage::Executed => hooks.on_executed(),
    }
}

/// Tracks the lifecycle of one instruction and enforces the bus rules
///
/// The tracker separates deciding which events fire (under the owner's lock)
/// from delivering them (after the lock is released): [`advance`] and
/// [`fail`] only mutate bookkeeping and hand back what to dispatch.
///
/// [`advance`]: LifecycleTracker::advance
/// [`fail`]: LifecycleTracker::fail
#[derive(Clone)]
pub struct LifecycleTracker {
    hooks: Option<Arc<dyn InstructionHooks>>,
    stage: Option<InstructionStage>,
    failed: bool,
}

impl LifecycleTracker {
    /// Create a tracker, optionally bound to a hook bundle
    pub fn new(hooks: Option<Arc<dyn InstructionHooks>>) -> Self {
        Self {
            hooks,
            stage: None,
            failed: false,
        }
    }

    /// Current stage, if any event fired yet
    pub fn stage(&self) -> Option<InstructionStage> {
        self.stage
    }

    /// Whether a terminal event (`executed` or `error`) already fired
    pub fn is_terminal(&self) -> bool {
        self.failed || self.stage == Some(InstructionStage::Executed)
    }

    /// The hook bundle, if still held
    pub fn hooks(&self) -> Option<Arc<dyn InstructionHooks>> {
        self.hooks.clone()
    }

    /// Advance to `target`, returning every newly entered stage in order
    ///
    /// Skipped intermediate stages are included so the caller can synthesize
    /// them. Stages already passed yield nothing, as does any call after a
    /// terminal event. Reaching `Executed` releases the hook bundle.
    pub fn advance(&mut self, target: InstructionStage) -> Vec<InstructionStage> {
        if self.is_terminal() {
            return Vec::new();
        }
        let entered: Vec<InstructionStage> = InstructionStage::ALL
            .iter()
            .copied()
            .filter(|s| Some(*s) > self.stage && *s <= target)
            .collect();
        if !entered.is_empty() {
            self.stage = Some(target);
        }
        if self.stage == Some(InstructionStage::Executed) {
            self.hooks = None;
        }
        entered
    }

    /// Record the terminal error
    ///
    /// Returns the hook bundle to notify if this is the first terminal event;
    /// the bundle is released either way.
    pub fn fail(&mut self) -> Option<Arc<dyn InstructionHooks>> {
        if self.is_terminal() {
            return None;
        }
        self.failed = true;
        self.hooks.take()
    }
}

impl std::fmt::Debug for LifecycleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleTracker")
            .field("stage", &self.stage)
            .field("failed", &self.failed)
            .field("has_hooks", &self.hooks.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl InstructionHooks for Recorder {
        fn on_queued(&self) {
            self.events.lock().push("queued".into());
        }
        fn on_sent(&self) {
            self.events.lock().push("sent".into());
        }
        fn on_ack(&self) {
            self.events.lock().push("ack".into());
        }
        fn on_executing(&self) {
            self.events.lock().push("executing".into());
        }
        fn on_executed(&self) {
            self.events.lock().push("executed".into());
        }
        fn on_error(&self, error: &ControllerError) {
            self.events.lock().push(format!("error:{}", error.kind()));
        }
    }

    fn drive(tracker: &mut LifecycleTracker, target: InstructionStage) {
        let hooks = tracker.hooks();
        for stage in tracker.advance(target) {
            if let Some(h) = &hooks {
                dispatch_stage(h.as_ref(), stage);
            }
        }
    }

    #[test]
    fn full_lifecycle_in_order() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker = LifecycleTracker::new(Some(recorder.clone()));
        for stage in InstructionStage::ALL {
            drive(&mut tracker, stage);
        }
        assert_eq!(
            recorder.events(),
            vec!["queued", "sent", "ack", "executing", "executed"]
        );
        assert!(tracker.is_terminal());
        assert!(tracker.hooks().is_none());
    }

    #[test]
    fn skipped_stages_are_synthesized() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker = LifecycleTracker::new(Some(recorder.clone()));
        drive(&mut tracker, InstructionStage::Queued);
        drive(&mut tracker, InstructionStage::Executed);
        assert_eq!(
            recorder.events(),
            vec!["queued", "sent", "ack", "executing", "executed"]
        );
    }

    #[test]
    fn repeated_advance_fires_at_most_once() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker = LifecycleTracker::new(Some(recorder.clone()));
        drive(&mut tracker, InstructionStage::Ack);
        drive(&mut tracker, InstructionStage::Ack);
        drive(&mut tracker, InstructionStage::Sent);
        assert_eq!(recorder.events(), vec!["queued", "sent", "ack"]);
    }

    #[test]
    fn error_is_terminal_and_exclusive() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker = LifecycleTracker::new(Some(recorder.clone()));
        drive(&mut tracker, InstructionStage::Sent);

        if let Some(h) = tracker.fail() {
            h.on_error(&ControllerError::Cancelled);
        }
        assert!(tracker.is_terminal());

        // Nothing fires after the terminal error, and a second failure is
        // swallowed.
        drive(&mut tracker, InstructionStage::Executed);
        assert!(tracker.fail().is_none());
        assert_eq!(recorder.events(), vec!["queued", "sent", "error:cancelled"]);
    }

    #[test]
    fn error_after_executed_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker = LifecycleTracker::new(Some(recorder.clone()));
        drive(&mut tracker, InstructionStage::Executed);
        assert!(tracker.fail().is_none());
        assert_eq!(recorder.events().last().map(String::as_str), Some("executed"));
    }

    #[test]
    fn tracker_without_hooks_still_tracks() {
        let mut tracker = LifecycleTracker::new(None);
        assert_eq!(
            tracker.advance(InstructionStage::Ack),
            vec![
                InstructionStage::Queued,
                InstructionStage::Sent,
                InstructionStage::Ack
            ]
        );
        assert!(!tracker.is_terminal());
        assert!(tracker.fail().is_none());
        assert!(tracker.is_terminal());
    }

    proptest! {
        /// Any interleaving of advances and one failure keeps the bus rules:
        /// monotone order, at most one firing per stage, one terminal event.
        #[test]
        fn bus_rules_hold_for_arbitrary_sequences(
            targets in proptest::collection::vec(0usize..5, 1..12),
            fail_at in proptest::option::of(0usize..12),
        ) {
            let recorder = Arc::new(Recorder::default());
            let mut tracker = LifecycleTracker::new(Some(recorder.clone()));

            for (i, &t) in targets.iter().enumerate() {
                if Some(i) == fail_at {
                    if let Some(h) = tracker.fail() {
                        h.on_error(&ControllerError::Cancelled);
                    }
                }
                drive(&mut tracker, InstructionStage::ALL[t]);
            }

            let events = recorder.events();
            let stage_names = ["queued", "sent", "ack", "executing", "executed"];
            let mut last_rank: Option<usize> = None;
            let mut terminals = 0usize;
            for event in &events {
                if event.starts_with("error:") {
                    terminals += 1;
                    prop_assert_eq!(event, events.last().unwrap());
                    continue;
                }
                let rank = stage_names.iter().position(|n| n == event).unwrap();
                if let Some(prev) = last_rank {
                    prop_assert!(rank > prev);
                }
                last_rank = Some(rank);
                if rank == 4 {
                    terminals += 1;
                }
            }
            prop_assert!(terminals <= 1);
        }
    }
}
