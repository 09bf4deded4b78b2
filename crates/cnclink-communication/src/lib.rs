#![allow(dead_code)]
//! # cnclink Communication
//!
//! Everything that touches a device: the line-oriented [`Transport`] seam
//! with its serial adapter, the [`ControllerEngine`] concrete backends
//! compose, and the virtual controller backend used for tests and demos.

pub mod communication;
pub mod engine;
pub mod firmware;

pub use communication::{
    serial::{list_ports, SerialPortInfo, SerialTransport},
    ConnectionParams, NoOpTransport, SerialParity, Transport,
};

pub use engine::{ControllerEngine, EngineConfig, OutgoingLine, SubmitHandle};

pub use firmware::{SimConfig, SimController, VirtualDevice, VirtualDeviceConfig};
