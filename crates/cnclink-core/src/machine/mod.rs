//! Mirrored machine state
//!
//! This module provides:
//! - The state vector ([`MachineState`]): the single source of truth for the
//!   kinematic and modal state mirrored from the device
//! - The coordinate resolver: pure work-coordinate arithmetic over the vector
//! - Immutable status snapshots for upstream consumers

pub mod coords;
pub mod status;

use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine coordinate units (millimeters or inches)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    /// Millimeters (metric)
    Mm,
    /// Inches (imperial)
    In,
}

impl Units {
    /// Convert a value from one unit to another
    pub fn convert(value: f64, from: Units, to: Units) -> f64 {
        match (from, to) {
            (Units::Mm, Units::In) => value / 25.4,
            (Units::In, Units::Mm) => value * 25.4,
            _ => value,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::Mm => write!(f, "mm"),
            Units::In => write!(f, "in"),
        }
    }
}

/// Coolant output state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coolant {
    /// All coolant off
    Off,
    /// Mist coolant (M7)
    Mist,
    /// Flood coolant (M8)
    Flood,
    /// Both mist and flood
    Both,
}

impl Coolant {
    /// Combine with a newly enabled output
    pub fn with_mist(self) -> Self {
        match self {
            Coolant::Off | Coolant::Mist => Coolant::Mist,
            Coolant::Flood | Coolant::Both => Coolant::Both,
        }
    }

    /// Combine with a newly enabled flood output
    pub fn with_flood(self) -> Self {
        match self {
            Coolant::Off | Coolant::Flood => Coolant::Flood,
            Coolant::Mist | Coolant::Both => Coolant::Both,
        }
    }
}

/// Spindle rotation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpindleDirection {
    /// Clockwise (M3)
    Cw,
    /// Counter-clockwise (M4)
    Ccw,
}

impl SpindleDirection {
    /// Signed representation: +1 clockwise, -1 counter-clockwise
    pub fn sign(&self) -> i8 {
        match self {
            SpindleDirection::Cw => 1,
            SpindleDirection::Ccw => -1,
        }
    }
}

/// A partial position: per-axis optional target values
///
/// `None` for an axis means "hold this axis". The vector is indexed in axis
/// order and may be shorter than the machine's axis count; missing trailing
/// axes are held.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialPosition(pub Vec<Option<f64>>);

impl PartialPosition {
    /// Create an empty partial position (no axes set)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from explicit per-axis values
    pub fn from_axes(axes: Vec<Option<f64>>) -> Self {
        Self(axes)
    }

    /// Create a three-axis partial position
    pub fn xyz(x: Option<f64>, y: Option<f64>, z: Option<f64>) -> Self {
        Self(vec![x, y, z])
    }

    /// Set a single axis, growing the vector as needed
    pub fn with_axis(mut self, index: usize, value: f64) -> Self {
        if self.0.len() <= index {
            self.0.resize(index + 1, None);
        }
        self.0[index] = Some(value);
        self
    }

    /// Value for one axis, if set
    pub fn get(&self, index: usize) -> Option<f64> {
        self.0.get(index).copied().flatten()
    }

    /// The raw per-axis values
    pub fn axes(&self) -> &[Option<f64>] {
        &self.0
    }

    /// Count of axes that are set
    pub fn axis_count(&self) -> usize {
        self.0.iter().filter(|a| a.is_some()).count()
    }

    /// Whether no axis is set
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|a| a.is_none())
    }

    /// Resolve against a current position: set axes move, absent axes hold
    pub fn apply_to(&self, current: &[f64]) -> Vec<f64> {
        current
            .iter()
            .enumerate()
            .map(|(i, &cur)| self.get(i).unwrap_or(cur))
            .collect()
    }
}

/// The state vector: mirrored machine state
///
/// Owned and mutated exclusively by the controller that holds the device
/// connection; everyone else sees immutable snapshots. All per-axis vectors
/// have length `axis_labels.len()`.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    /// Connection established, handshake done, and not alarmed
    pub ready: bool,
    /// Ordered axis names; entries unique
    pub axis_labels: Vec<char>,
    /// Per-axis mask of axes the machine actually uses
    pub used_axes: Vec<bool>,
    /// Per-axis mask of axes that can be homed
    pub homable_axes: Vec<bool>,
    /// Machine-coordinate position
    pub mpos: Vec<f64>,
    /// Index of the active work coordinate system; `None` means raw machine
    /// coordinates
    pub active_coord_sys: Option<usize>,
    /// Stored per-system offset vectors (entries may be shorter than the axis
    /// count; missing components are zero)
    pub coord_sys_offsets: Vec<Vec<f64>>,
    /// Transient offset vector (G92 style)
    pub offset: Vec<f64>,
    /// Whether the transient offset applies
    pub offset_enabled: bool,
    /// Two stored machine positions (home-return slots 0 and 1)
    pub stored_positions: [Vec<f64>; 2],
    /// Per-axis homed flags
    pub homed: Vec<bool>,
    /// Feed hold active
    pub held: bool,
    /// Active units
    pub units: Units,
    /// Last commanded feed rate
    pub feed: f64,
    /// Incremental positioning mode active
    pub incremental: bool,
    /// Motion in progress
    pub moving: bool,
    /// Coolant output state
    pub coolant: Coolant,
    /// Spindle running
    pub spindle: bool,
    /// Spindle rotation direction
    pub spindle_direction: SpindleDirection,
    /// Last known spindle speed in RPM, if reported
    pub spindle_speed: Option<f64>,
    /// Inverse-time feed mode active
    pub inverse_feed: bool,
    /// Last line number reported executed
    pub line: u64,
    /// Latched error detail; present iff the controller is alarmed
    pub error_data: Option<ControllerError>,
    /// A program stream is actively being consumed
    pub program_running: bool,
}

impl MachineState {
    /// Create a state vector initialised to defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of axes
    pub fn axis_count(&self) -> usize {
        self.axis_labels.len()
    }

    /// Whether an error is latched
    pub fn error(&self) -> bool {
        self.error_data.is_some()
    }

    /// Re-initialise every field to its default
    ///
    /// Called on construction, reconnect, and reset.
    pub fn reset_state(&mut self) {
        *self = Self::default();
    }

    /// Latch an error; forces `ready` off
    pub fn set_error(&mut self, err: ControllerError) {
        self.error_data = Some(err);
        self.ready = false;
    }

    /// Clear a latched error
    pub fn clear_error(&mut self) {
        self.error_data = None;
    }

    /// Label for an axis index, if it exists
    pub fn axis_label(&self, index: usize) -> Option<char> {
        self.axis_labels.get(index).copied()
    }

    /// Index for an axis label, if present
    pub fn axis_index(&self, label: char) -> Option<usize> {
        self.axis_labels
            .iter()
            .position(|&l| l.eq_ignore_ascii_case(&label))
    }
}

impl Default for MachineState {
    fn default() -> Self {
        let axes = 3;
        Self {
            ready: false,
            axis_labels: vec!['x', 'y', 'z'],
            used_axes: vec![true; axes],
            homable_axes: vec![true; axes],
            mpos: vec![0.0; axes],
            active_coord_sys: Some(0),
            coord_sys_offsets: vec![vec![0.0; axes]],
            offset: vec![0.0; axes],
            offset_enabled: false,
            stored_positions: [vec![0.0; axes], vec![0.0; axes]],
            homed: vec![false; axes],
            held: false,
            units: Units::Mm,
            feed: 0.0,
            incremental: false,
            moving: false,
            coolant: Coolant::Off,
            spindle: false,
            spindle_direction: SpindleDirection::Cw,
            spindle_speed: None,
            inverse_feed: false,
            line: 0,
            error_data: None,
            program_running: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let state = MachineState::default();
        let n = state.axis_count();
        assert_eq!(n, 3);
        assert_eq!(state.axis_labels, vec!['x', 'y', 'z']);
        assert_eq!(state.mpos.len(), n);
        assert_eq!(state.used_axes.len(), n);
        assert_eq!(state.homable_axes.len(), n);
        assert_eq!(state.homed.len(), n);
        assert_eq!(state.offset.len(), n);
        assert_eq!(state.active_coord_sys, Some(0));
        assert_eq!(state.coord_sys_offsets.len(), 1);
        assert_eq!(state.units, Units::Mm);
        assert!(!state.ready);
        assert!(!state.error());
        assert!(!state.moving);
    }

    #[test]
    fn reset_state_is_idempotent() {
        let mut a = MachineState::default();
        a.mpos = vec![1.0, 2.0, 3.0];
        a.held = true;
        a.set_error(ControllerError::comm("lost"));
        a.reset_state();

        let mut b = MachineState::default();
        b.reset_state();
        b.reset_state();

        assert_eq!(a, b);
    }

    #[test]
    fn error_latch_forces_not_ready() {
        let mut state = MachineState::default();
        state.ready = true;
        state.set_error(ControllerError::SafetyInterlock);
        assert!(state.error());
        assert!(!state.ready);
        assert!(state.error_data.is_some());

        state.clear_error();
        assert!(!state.error());
        assert!(state.error_data.is_none());
    }

    #[test]
    fn axis_lookup_ignores_case() {
        let state = MachineState::default();
        assert_eq!(state.axis_index('X'), Some(0));
        assert_eq!(state.axis_index('z'), Some(2));
        assert_eq!(state.axis_index('a'), None);
        assert_eq!(state.axis_label(1), Some('y'));
        assert_eq!(state.axis_label(7), None);
    }

    #[test]
    fn partial_position_applies_and_holds() {
        let target = PartialPosition::xyz(Some(5.0), None, Some(-2.0));
        assert_eq!(target.apply_to(&[0.0, 7.0, 1.0]), vec![5.0, 7.0, -2.0]);
        assert_eq!(target.axis_count(), 2);
        assert!(!target.is_empty());

        let short = PartialPosition::from_axes(vec![Some(1.0)]);
        assert_eq!(short.apply_to(&[0.0, 0.0, 0.0]), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn partial_position_with_axis_grows() {
        let target = PartialPosition::new().with_axis(2, 4.5);
        assert_eq!(target.axes(), &[None, None, Some(4.5)]);
        assert_eq!(target.get(2), Some(4.5));
        assert_eq!(target.get(9), None);
    }

    #[test]
    fn coolant_combination() {
        assert_eq!(Coolant::Off.with_mist(), Coolant::Mist);
        assert_eq!(Coolant::Mist.with_flood(), Coolant::Both);
        assert_eq!(Coolant::Both.with_mist(), Coolant::Both);
    }
}
