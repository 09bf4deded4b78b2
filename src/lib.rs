//! # cnclink
//!
//! A backend controller-abstraction layer for hobby CNC machines. One
//! controller instance owns a live connection to a motion controller,
//! mirrors the machine's kinematic and modal state, and mediates the flow of
//! G-code instructions between job logic and the device.
//!
//! ## Architecture
//!
//! The workspace is organised as two library crates plus this facade:
//!
//! 1. **cnclink-core** — state vector, coordinate resolver, instruction
//!    lifecycle bus, typed event hub, error taxonomy, and the [`Controller`]
//!    contract
//! 2. **cnclink-communication** — the transport seam with its serial
//!    adapter, the controller engine backends compose, and the virtual
//!    device backend
//! 3. **cnclink** — re-exports, logging setup, and a demo binary driving a
//!    virtual controller end to end

pub use cnclink_core::{
    dispatch_stage, ChannelSource, Controller, ControllerError, Coolant, ErrorKind, EventHub,
    EventHubConfig, FileSource, GcodeInstruction, InstructionHooks, InstructionSource,
    InstructionStage, LifecycleTracker, LinesSource, MachineState, PartialPosition, Result,
    SendItem, SpindleDirection, StatusSnapshot, Units,
};

pub use cnclink_communication::{
    list_ports, ConnectionParams, ControllerEngine, EngineConfig, NoOpTransport, OutgoingLine,
    SerialParity, SerialPortInfo, SerialTransport, SimConfig, SimController, SubmitHandle,
    Transport, VirtualDevice, VirtualDeviceConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with console output, `RUST_LOG` environment
/// variable support, and INFO as the default level.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
