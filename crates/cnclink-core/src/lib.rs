//! # cnclink Core
//!
//! Core types, traits, and events for the cnclink controller-abstraction
//! layer: the state vector mirrored from the device, the coordinate
//! resolver, the instruction lifecycle bus, the typed event hub, the error
//! taxonomy, and the [`Controller`] contract concrete backends implement.

pub mod controller;
pub mod error;
pub mod event_bus;
pub mod gcode;
pub mod lifecycle;
pub mod machine;
pub mod stream;

pub use controller::Controller;

pub use error::{ControllerError, ErrorKind, Result};

pub use event_bus::{EventHub, EventHubConfig};

pub use gcode::{GcodeInstruction, SendItem};

pub use lifecycle::{dispatch_stage, InstructionHooks, InstructionStage, LifecycleTracker};

pub use machine::{
    status::StatusSnapshot, Coolant, MachineState, PartialPosition, SpindleDirection, Units,
};

pub use stream::{ChannelSource, FileSource, InstructionSource, LinesSource};
