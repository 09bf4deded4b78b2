//! Device backends
//!
//! Each backend implements the [`Controller`] contract for one device
//! family by composing a [`ControllerEngine`] with its own IO task and
//! protocol handling. The virtual backend ships in-tree; firmware-dialect
//! backends (GRBL and friends) build on the same seam out of tree.
//!
//! [`Controller`]: cnclink_core::Controller
//! [`ControllerEngine`]: crate::engine::ControllerEngine

pub mod simulator;

pub use simulator::{SimConfig, SimController, VirtualDevice, VirtualDeviceConfig};
