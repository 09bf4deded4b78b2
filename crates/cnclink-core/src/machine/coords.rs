//! Coordinate resolver
//!
//! Pure, deterministic queries deriving work-coordinate positions from the
//! state vector. Offset vectors stored on the device may be shorter than the
//! axis count; missing components are treated as zero throughout.

use super::MachineState;

impl MachineState {
    /// Combined offset currently applied to machine coordinates
    ///
    /// Starts at zero for every axis, adds the active coordinate system's
    /// offset vector componentwise when one is active, then adds the
    /// transient offset when it is enabled. The result always has
    /// `axis_count()` components.
    pub fn effective_offsets(&self) -> Vec<f64> {
        let n = self.axis_count();
        let mut offsets = vec![0.0; n];

        if let Some(active) = self.active_coord_sys {
            if let Some(sys) = self.coord_sys_offsets.get(active) {
                for (i, slot) in offsets.iter_mut().enumerate() {
                    *slot += sys.get(i).copied().unwrap_or(0.0);
                }
            }
        }

        if self.offset_enabled {
            for (i, slot) in offsets.iter_mut().enumerate() {
                *slot += self.offset.get(i).copied().unwrap_or(0.0);
            }
        }

        offsets
    }

    /// Work-coordinate position: `mpos - effective_offsets` per axis
    pub fn work_position(&self) -> Vec<f64> {
        let offsets = self.effective_offsets();
        self.mpos
            .iter()
            .enumerate()
            .map(|(i, &m)| m - offsets.get(i).copied().unwrap_or(0.0))
            .collect()
    }

    /// Indices of used axes, in axis order
    pub fn used_axis_indices(&self) -> Vec<usize> {
        self.used_axes
            .iter()
            .enumerate()
            .filter(|(_, &used)| used)
            .map(|(i, _)| i)
            .collect()
    }

    /// Labels of used axes, in axis order
    pub fn used_axis_labels(&self) -> Vec<char> {
        self.used_axis_indices()
            .into_iter()
            .filter_map(|i| self.axis_label(i))
            .collect()
    }
}
