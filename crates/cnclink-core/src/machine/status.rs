//! Immutable status snapshots
//!
//! [`StatusSnapshot`] is the stable schema handed to upstream consumers
//! (serialized camelCase on the wire). A snapshot is captured atomically from
//! one state vector, so the derived `pos` and `mpos_offset` are always
//! consistent with the `mpos` they were computed from.

use super::{Coolant, MachineState, Units};
use crate::error::ControllerError;
use serde::{Deserialize, Serialize};

/// A point-in-time projection of the state vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Connection established and not alarmed
    pub ready: bool,
    /// Ordered axis names
    pub axis_labels: Vec<char>,
    /// Per-axis used mask
    pub used_axes: Vec<bool>,
    /// Machine-coordinate position
    pub mpos: Vec<f64>,
    /// Derived work-coordinate position
    pub pos: Vec<f64>,
    /// Derived combined offset (`mpos - pos`)
    pub mpos_offset: Vec<f64>,
    /// Active work coordinate system index, if any
    pub active_coord_sys: Option<usize>,
    /// Transient offset vector
    pub offset: Vec<f64>,
    /// Whether the transient offset applies
    pub offset_enabled: bool,
    /// Stored machine positions (slots 0 and 1)
    pub stored_positions: [Vec<f64>; 2],
    /// Per-axis homed flags
    pub homed: Vec<bool>,
    /// Feed hold active
    pub held: bool,
    /// Active units
    pub units: Units,
    /// Last commanded feed rate
    pub feed: f64,
    /// Incremental positioning mode
    pub incremental: bool,
    /// Motion in progress
    pub moving: bool,
    /// Coolant state
    pub coolant: Coolant,
    /// Spindle running
    pub spindle: bool,
    /// Last line number reported executed
    pub line: u64,
    /// Error latched
    pub error: bool,
    /// Latched error detail; present iff `error`
    pub error_data: Option<ControllerError>,
    /// A program stream is actively being consumed
    pub program_running: bool,
}

impl StatusSnapshot {
    /// Capture a snapshot from a state vector
    ///
    /// `pos` and `mpos_offset` are computed from the same vector as `mpos`.
    pub fn capture(state: &MachineState) -> Self {
        let mpos_offset = state.effective_offsets();
        let pos = state.work_position();
        Self {
            ready: state.ready,
            axis_labels: state.axis_labels.clone(),
            used_axes: state.used_axes.clone(),
            mpos: state.mpos.clone(),
            pos,
            mpos_offset,
            active_coord_sys: state.active_coord_sys,
            offset: state.offset.clone(),
            offset_enabled: state.offset_enabled,
            stored_positions: state.stored_positions.clone(),
            homed: state.homed.clone(),
            held: state.held,
            units: state.units,
            feed: state.feed,
            incremental: state.incremental,
            moving: state.moving,
            coolant: state.coolant,
            spindle: state.spindle,
            line: state.line,
            error: state.error(),
            error_data: state.error_data.clone(),
            program_running: state.program_running,
        }
    }
}
