//! Virtual machine model
//!
//! [`VirtualDevice`] stands in for a physical motion controller: it accepts
//! lines into a bounded planner queue and executes them one at a time,
//! applying their effects to the engine's state vector. The interpreter
//! covers the dialect a hobby controller executes itself: linear moves,
//! modal units/distance/coordinate-system selection, transient offsets,
//! stored positions, probing, spindle/coolant M-codes, and homing.
//!
//! Faults are scriptable through [`VirtualDeviceConfig`] so tests can drive
//! probe failures, unlock refusals, soft-limit alarms, and flaky connections
//! deterministically.

use crate::engine::ControllerEngine;
use cnclink_core::{ControllerError, MachineState, Result, SpindleDirection, Units};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Behaviour knobs for the virtual device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualDeviceConfig {
    /// Lines the planner queue holds before the device stops accepting
    pub planner_depth: usize,
    /// Simulated execution time per line, in milliseconds
    pub exec_delay_ms: u64,
    /// Machine position at which the probe trips; `None` means the probe
    /// never trips
    pub probe_trip: Option<Vec<f64>>,
    /// Probe input already closed when a probe cycle starts
    pub probe_tripped_at_start: bool,
    /// Device refuses probe cycles outright
    pub refuse_probe: bool,
    /// Device refuses alarm unlock requests
    pub refuse_unlock: bool,
    /// Per-axis absolute travel limit; a commanded move beyond it raises an
    /// unrecoverable soft-limit alarm. `None` disables the check
    pub soft_limit: Option<Vec<f64>>,
    /// Device supports homing cycles
    pub supports_homing: bool,
    /// Number of connection attempts to refuse before accepting one
    pub connect_failures: usize,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            planner_depth: 4,
            exec_delay_ms: 0,
            probe_trip: None,
            probe_tripped_at_start: false,
            refuse_probe: false,
            refuse_unlock: false,
            soft_limit: None,
            supports_homing: true,
            connect_failures: 0,
        }
    }
}

/// In-process machine model executing a GRBL-like line dialect
pub struct VirtualDevice {
    config: VirtualDeviceConfig,
    /// Accepted lines awaiting execution, tagged with their instruction id
    queue: VecDeque<(Uuid, String)>,
    /// At most one pending real-time jog: (axis index, increment)
    pending_jog: Option<(usize, f64)>,
    connect_attempts: usize,
}

impl VirtualDevice {
    /// Create a device with the given behaviour
    pub fn new(config: VirtualDeviceConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            pending_jog: None,
            connect_attempts: 0,
        }
    }

    /// The device configuration
    pub fn config(&self) -> &VirtualDeviceConfig {
        &self.config
    }

    /// Attempt to establish the (virtual) connection
    pub fn try_connect(&mut self) -> Result<()> {
        if self.connect_attempts < self.config.connect_failures {
            self.connect_attempts += 1;
            return Err(ControllerError::comm("virtual device not answering"));
        }
        Ok(())
    }

    /// Whether the planner queue has room for another line
    pub fn can_accept(&self) -> bool {
        self.queue.len() < self.config.planner_depth
    }

    /// Accept a line into the planner queue
    pub fn accept(&mut self, id: Uuid, line: String) {
        self.queue.push_back((id, line));
    }

    /// Pop the next line to execute
    pub fn pop_next(&mut self) -> Option<(Uuid, String)> {
        self.queue.pop_front()
    }

    /// Whether the device refuses unlock requests
    pub fn refuses_unlock(&self) -> bool {
        self.config.refuse_unlock
    }

    /// Record a real-time jog request
    pub fn set_jog(&mut self, axis: usize, increment: f64) {
        self.pending_jog = Some((axis, increment));
    }

    /// Take the pending jog, if any
    pub fn take_jog(&mut self) -> Option<(usize, f64)> {
        self.pending_jog.take()
    }

    /// Flush the planner queue and any pending jog
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending_jog = None;
    }

    /// Device-side reset: everything queued is gone
    pub fn reset(&mut self) {
        self.clear();
    }

    /// Execute one line against the engine's state vector
    ///
    /// Commits every effect of the line as one state batch. Errors are
    /// instruction-local unless [`ControllerError::is_fatal`] says otherwise.
    pub fn execute(&mut self, line: &str, engine: &ControllerEngine) -> Result<()> {
        let mut result = Ok(());
        engine.update_state(|state| {
            result = self.apply(line, state);
        });
        result
    }

    fn apply(&mut self, line: &str, state: &mut MachineState) -> Result<()> {
        let line = strip_comments(line);
        let line = line.trim();
        if line.is_empty() {
            state.line += 1;
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix('$') {
            return self.apply_system(rest, state);
        }

        self.apply_gcode(line, state)
    }

    fn apply_system(&mut self, command: &str, state: &mut MachineState) -> Result<()> {
        if let Some(axes) = command.strip_prefix('H') {
            if !self.config.supports_homing {
                return Err(ControllerError::machine("homing not enabled"));
            }
            let requested: Vec<usize> = if axes.is_empty() {
                (0..state.axis_count()).collect()
            } else {
                axes.chars()
                    .filter_map(|c| state.axis_index(c))
                    .collect()
            };
            for i in requested {
                if state.homable_axes.get(i).copied().unwrap_or(false) {
                    state.mpos[i] = 0.0;
                    state.homed[i] = true;
                }
            }
            state.line += 1;
            return Ok(());
        }

        if command == "X" {
            if self.config.refuse_unlock {
                return Err(ControllerError::machine("unlock refused"));
            }
            state.line += 1;
            return Ok(());
        }

        if let Some(jog) = command.strip_prefix("J=") {
            return self.apply_jog_line(jog, state);
        }

        Err(ControllerError::machine(format!(
            "unsupported system command '${}'",
            command
        )))
    }

    /// `$J=` jog lines carry their own modal words and never touch the
    /// persistent modal state.
    fn apply_jog_line(&mut self, jog: &str, state: &mut MachineState) -> Result<()> {
        let words = parse_words(jog)?;
        let mut incremental = state.incremental;
        let mut targets: Vec<(usize, f64)> = Vec::new();
        for (letter, value) in words {
            match letter {
                'G' => match decimal_code(value) {
                    900 => incremental = false,
                    910 => incremental = true,
                    0 | 10 | 200 | 210 => {}
                    other => {
                        return Err(ControllerError::machine(format!(
                            "unsupported jog word G{}",
                            other as f64 / 10.0
                        )))
                    }
                },
                'F' => state.feed = value,
                letter => match state.axis_index(letter) {
                    Some(i) => targets.push((i, value)),
                    None => {
                        return Err(ControllerError::machine(format!(
                            "unknown jog axis '{}'",
                            letter
                        )))
                    }
                },
            }
        }
        let offsets = state.effective_offsets();
        for (i, value) in targets {
            state.mpos[i] = if incremental {
                state.mpos[i] + value
            } else {
                value + offsets[i]
            };
        }
        state.line += 1;
        Ok(())
    }

    fn apply_gcode(&mut self, line: &str, state: &mut MachineState) -> Result<()> {
        enum Motion {
            Rapid,
            Feed,
            Probe,
        }

        let words = parse_words(line)?;
        let mut motion: Option<Motion> = None;
        let mut set_offset = false;
        let mut clear_offset = false;
        let mut set_coord_data = false;
        let mut store_slot: Option<usize> = None;
        let mut goto_slot: Option<usize> = None;
        let mut l_word: Option<u32> = None;
        let mut p_word: Option<u32> = None;
        let mut axis_words: Vec<(usize, f64)> = Vec::new();

        for (letter, value) in words {
            match letter {
                'G' => match decimal_code(value) {
                    0 => motion = Some(Motion::Rapid),
                    10 => motion = Some(Motion::Feed),
                    40 => {} // dwell: nothing to simulate
                    100 => set_coord_data = true,
                    200 => state.units = Units::In,
                    210 => state.units = Units::Mm,
                    280 => goto_slot = Some(0),
                    281 => store_slot = Some(0),
                    300 => goto_slot = Some(1),
                    301 => store_slot = Some(1),
                    382 => motion = Some(Motion::Probe),
                    540..=590 => {
                        let code = decimal_code(value);
                        if code % 10 == 0 {
                            state.active_coord_sys = Some((code / 10 - 54) as usize);
                        } else {
                            return Err(ControllerError::machine(format!(
                                "unsupported gcode G{}",
                                value
                            )));
                        }
                    }
                    900 => state.incremental = false,
                    910 => state.incremental = true,
                    920 => set_offset = true,
                    921 => clear_offset = true,
                    930 => state.inverse_feed = true,
                    940 => state.inverse_feed = false,
                    _ => {
                        return Err(ControllerError::machine(format!(
                            "unsupported gcode G{}",
                            value
                        )))
                    }
                },
                'M' => match decimal_code(value) {
                    20 | 300 => {} // program end markers pass through
                    30 => {
                        state.spindle = true;
                        state.spindle_direction = SpindleDirection::Cw;
                    }
                    40 => {
                        state.spindle = true;
                        state.spindle_direction = SpindleDirection::Ccw;
                    }
                    50 => state.spindle = false,
                    70 => state.coolant = state.coolant.with_mist(),
                    80 => state.coolant = state.coolant.with_flood(),
                    90 => state.coolant = cnclink_core::Coolant::Off,
                    _ => {
                        return Err(ControllerError::machine(format!(
                            "unsupported mcode M{}",
                            value
                        )))
                    }
                },
                'F' => state.feed = value,
                'S' => state.spindle_speed = Some(value),
                'L' => l_word = Some(value as u32),
                'P' => p_word = Some(value as u32),
                letter => match state.axis_index(letter) {
                    Some(i) => axis_words.push((i, value)),
                    None => {
                        return Err(ControllerError::machine(format!(
                            "unknown word '{}{}'",
                            letter, value
                        )))
                    }
                },
            }
        }

        if clear_offset {
            state.offset = vec![0.0; state.axis_count()];
            state.offset_enabled = false;
        }

        if set_offset {
            // G92: bias the transient offset so the work position of each
            // given axis reads the given value.
            let n = state.axis_count();
            let mut system = vec![0.0; n];
            if let Some(active) = state.active_coord_sys {
                if let Some(sys) = state.coord_sys_offsets.get(active) {
                    for (i, slot) in system.iter_mut().enumerate() {
                        *slot = sys.get(i).copied().unwrap_or(0.0);
                    }
                }
            }
            if state.offset.len() < n {
                state.offset.resize(n, 0.0);
            }
            for &(i, value) in &axis_words {
                state.offset[i] = state.mpos[i] - system[i] - value;
            }
            state.offset_enabled = true;
        } else if set_coord_data {
            self.apply_coord_data(l_word, p_word, &axis_words, state)?;
        } else if let Some(slot) = store_slot {
            state.stored_positions[slot] = state.mpos.clone();
        } else if let Some(slot) = goto_slot {
            state.mpos = state.stored_positions[slot].clone();
            if state.mpos.len() < state.axis_count() {
                state.mpos.resize(state.axis_count(), 0.0);
            }
        } else {
            // Bare axis words run as a linear move, matching the modal
            // behaviour of the dialects this device imitates.
            let kind = match motion {
                Some(kind) => Some(kind),
                None if !axis_words.is_empty() => Some(Motion::Feed),
                None => None,
            };
            if let Some(kind) = kind {
                let offsets = state.effective_offsets();
                let mut target = state.mpos.clone();
                for &(i, value) in &axis_words {
                    target[i] = if state.incremental {
                        state.mpos[i] + value
                    } else {
                        value + offsets[i]
                    };
                }
                match kind {
                    Motion::Probe => return self.run_probe(target, state),
                    Motion::Rapid | Motion::Feed => {
                        // Soft limits alarm before any motion happens; the
                        // alarm is unrecoverable and latches the controller.
                        if let Some(limits) = &self.config.soft_limit {
                            for (i, value) in target.iter().enumerate() {
                                if let Some(limit) = limits.get(i) {
                                    if value.abs() > *limit {
                                        return Err(ControllerError::alarm(
                                            2,
                                            format!(
                                                "soft limit exceeded on {}",
                                                state.axis_label(i).unwrap_or('?')
                                            ),
                                        ));
                                    }
                                }
                            }
                        }
                        state.mpos = target;
                    }
                }
            }
        }

        state.line += 1;
        Ok(())
    }

    fn apply_coord_data(
        &self,
        l_word: Option<u32>,
        p_word: Option<u32>,
        axis_words: &[(usize, f64)],
        state: &mut MachineState,
    ) -> Result<()> {
        if l_word != Some(2) {
            return Err(ControllerError::machine("G10 requires L2"));
        }
        let index = match p_word {
            Some(0) | None => state.active_coord_sys.unwrap_or(0),
            Some(p @ 1..=9) => (p - 1) as usize,
            Some(p) => {
                return Err(ControllerError::machine(format!(
                    "coordinate system P{} out of range",
                    p
                )))
            }
        };
        if state.coord_sys_offsets.len() <= index {
            state
                .coord_sys_offsets
                .resize(index + 1, vec![0.0; state.axis_count()]);
        }
        let axis_count = state.axis_count();
        let entry = &mut state.coord_sys_offsets[index];
        if entry.len() < axis_count {
            entry.resize(axis_count, 0.0);
        }
        for &(i, value) in axis_words {
            entry[i] = value;
        }
        Ok(())
    }

    fn run_probe(&mut self, target: Vec<f64>, state: &mut MachineState) -> Result<()> {
        if self.config.probe_tripped_at_start {
            return Err(ControllerError::ProbeInitialState);
        }
        if self.config.refuse_probe {
            return Err(ControllerError::ProbeNotTripped);
        }
        match &self.config.probe_trip {
            Some(trip) => {
                let mut at = trip.clone();
                at.resize(state.axis_count(), 0.0);
                state.mpos = at;
                state.line += 1;
                Ok(())
            }
            None => {
                // Travel completes without contact; the machine is parked at
                // the commanded endpoint.
                state.mpos = target;
                Err(ControllerError::ProbeEnd)
            }
        }
    }
}

/// Strip `;` comments and parenthesised comments from a line
fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_parens = false;
    for c in line.chars() {
        match c {
            ';' if !in_parens => break,
            '(' => in_parens = true,
            ')' if in_parens => in_parens = false,
            c if !in_parens => out.push(c),
            _ => {}
        }
    }
    out
}

/// Split a line into letter/value words
fn parse_words(line: &str) -> Result<Vec<(char, f64)>> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(ControllerError::machine(format!(
                "unexpected character '{}'",
                c
            )));
        }
        let letter = c.to_ascii_uppercase();
        let mut number = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || next == '.' || next == '-' || next == '+' {
                number.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let value = number.parse::<f64>().map_err(|_| {
            ControllerError::machine(format!("malformed word '{}{}'", letter, number))
        })?;
        words.push((letter, value));
    }
    Ok(words)
}

/// G/M code scaled by ten so fractional codes compare exactly
/// (G38.2 -> 382, G92.1 -> 921)
fn decimal_code(value: f64) -> i64 {
    (value * 10.0).round() as i64
}
