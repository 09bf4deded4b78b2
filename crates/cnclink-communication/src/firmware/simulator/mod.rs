//! Virtual controller backend
//!
//! [`SimController`] implements the full [`Controller`] contract against an
//! in-process [`VirtualDevice`] instead of a serial port. It exists for the
//! test suite, for demos, and as the reference for how a firmware backend
//! composes the [`ControllerEngine`]: an IO task drains the engine in the
//! classic write/execute/jog phases while the contract methods submit work
//! and wait on completions.

pub mod device;

pub use device::{VirtualDevice, VirtualDeviceConfig};

use crate::engine::{ControllerEngine, EngineConfig};
use async_trait::async_trait;
use cnclink_core::{
    Controller, ControllerError, EventHub, GcodeInstruction, InstructionSource, PartialPosition,
    Result, SendItem, StatusSnapshot,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Greeting the virtual device prints after a reset
const GREETING: &str = "VDev 1.1 ['$' for help]";

/// Configuration for a virtual controller, stored verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Controller name for logs and events
    pub name: String,
    /// Virtual device behaviour
    pub device: VirtualDeviceConfig,
    /// Engine tuning
    pub engine: EngineConfig,
    /// Initial reconnect backoff in milliseconds
    pub retry_base_ms: u64,
    /// Reconnect backoff cap in milliseconds
    pub retry_cap_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "virtual".to_string(),
            device: VirtualDeviceConfig::default(),
            engine: EngineConfig::default(),
            retry_base_ms: 25,
            retry_cap_ms: 500,
        }
    }
}

/// Controller implementation backed by a [`VirtualDevice`]
pub struct SimController {
    config: SimConfig,
    engine: Arc<ControllerEngine>,
    device: Arc<Mutex<VirtualDevice>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    connected: AtomicBool,
}

impl SimController {
    /// Create a controller; the configuration value is stored verbatim
    pub fn new(config: SimConfig) -> Self {
        let engine = Arc::new(ControllerEngine::new(config.engine.clone()));
        let device = Arc::new(Mutex::new(VirtualDevice::new(config.device.clone())));
        Self {
            config,
            engine,
            device,
            io_task: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(false),
        }
    }

    /// The stored configuration
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// The composed engine
    ///
    /// Exposed for backend-style integration (and test harnesses that need
    /// to manipulate the state vector directly).
    pub fn engine(&self) -> &ControllerEngine {
        &self.engine
    }

    /// Latch a controller-level fault as if the device/transport raised it
    ///
    /// Simulator feature: lets tests drive `comm_error`, interlock, and
    /// limit scenarios deterministically.
    pub fn inject_fault(&self, error: ControllerError) {
        self.engine.fatal(error);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControllerError::comm("controller not connected"))
        }
    }

    fn start_io_loop(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
        let handle = tokio::spawn(io_loop(
            self.engine.clone(),
            self.device.clone(),
            self.shutdown.clone(),
            Duration::from_millis(self.config.device.exec_delay_ms),
        ));
        *self.io_task.lock() = Some(handle);
    }

    fn stop_io_loop(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.io_task.lock().take() {
            handle.abort();
        }
    }

    async fn connect_once(&self) -> Result<()> {
        self.device.lock().try_connect()?;

        // The state vector restarts from defaults on every (re)connect.
        self.engine.update_state(|s| s.reset_state());
        self.engine
            .events()
            .publish_connected(format!("sim:{}", self.config.name));
        self.engine.events().publish_received(GREETING);
        self.start_io_loop();
        self.connected.store(true, Ordering::SeqCst);

        // The virtual device comes up idle and un-alarmed.
        self.engine.update_state(|s| s.ready = true);
        self.engine.events().publish_ready();
        tracing::info!(name = %self.config.name, "virtual controller ready");
        Ok(())
    }

    fn format_motion(
        &self,
        command: &str,
        target: &PartialPosition,
        feed: Option<f64>,
    ) -> Result<String> {
        let labels = self.engine.with_state(|s| s.axis_labels.clone());
        let mut line = String::from(command);
        let mut any = false;
        for (i, value) in target.axes().iter().enumerate() {
            if let Some(v) = value {
                let label = labels.get(i).ok_or_else(|| {
                    ControllerError::machine(format!("no such axis index {}", i))
                })?;
                line.push(' ');
                line.push(label.to_ascii_uppercase());
                line.push_str(&format!("{:.3}", v));
                any = true;
            }
        }
        if !any {
            return Err(ControllerError::machine("no target axes given"));
        }
        if let Some(f) = feed {
            line.push_str(&format!(" F{:.3}", f));
        }
        Ok(line)
    }
}

#[async_trait]
impl Controller for SimController {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn init_connection(&self, retry: bool) -> Result<()> {
        self.stop_io_loop();
        // Anything still outstanding from a previous connection is dead.
        self.device.lock().clear();
        self.engine.cancel();
        let mut attempt: u32 = 0;
        loop {
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if !retry {
                        return Err(err);
                    }
                    let exp = self
                        .config
                        .retry_base_ms
                        .saturating_mul(1u64 << attempt.min(10));
                    let backoff = exp.min(self.config.retry_cap_ms);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff,
                        "connect failed: {}; retrying",
                        err
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    async fn reset(&self) -> Result<()> {
        self.ensure_connected()?;
        self.engine.cancel();
        self.device.lock().reset();

        // Soft-reset: fresh state vector, then the handshake replays.
        self.engine.update_state(|s| s.reset_state());
        self.engine.events().publish_received(GREETING);
        self.engine.update_state(|s| s.ready = true);
        self.engine.events().publish_ready();
        Ok(())
    }

    async fn clear_error(&self) -> Result<()> {
        self.ensure_connected()?;
        if self.device.lock().refuses_unlock() {
            return Err(ControllerError::machine_code(9, "unlock refused"));
        }
        self.engine.clear_latch();
        self.engine.update_state(|s| s.ready = true);
        Ok(())
    }

    async fn send_line(&self, line: &str) -> Result<()> {
        self.ensure_connected()?;
        self.engine
            .submit(SendItem::Line(line.to_string()))
            .await
            .map(|_| ())
    }

    async fn send_gcode(&self, instruction: GcodeInstruction) -> Result<()> {
        self.ensure_connected()?;
        self.engine
            .submit(SendItem::Instruction(instruction))
            .await
            .map(|_| ())
    }

    async fn send_stream(&self, source: &mut dyn InstructionSource) -> Result<()> {
        self.ensure_connected()?;
        self.engine.send_stream(source).await
    }

    async fn wait_sync(&self) -> Result<()> {
        self.engine.wait_sync().await
    }

    fn hold(&self) -> Result<()> {
        self.ensure_connected()?;
        self.engine.hold();
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.ensure_connected()?;
        self.engine.resume();
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        self.device.lock().clear();
        self.engine.cancel();
        Ok(())
    }

    fn real_time_move(&self, axis: usize, increment: f64) -> Result<()> {
        self.ensure_connected()?;
        if axis >= self.engine.with_state(|s| s.axis_count()) {
            return Err(ControllerError::machine(format!(
                "no such axis index {}",
                axis
            )));
        }
        if !self.engine.try_begin_jog() {
            // At most one outstanding nudge; extras are dropped without any
            // device interaction.
            return Ok(());
        }
        self.device.lock().set_jog(axis, increment);
        self.engine.notify_work();
        Ok(())
    }

    async fn move_to(&self, target: PartialPosition, feed: Option<f64>) -> Result<()> {
        self.ensure_connected()?;
        let command = if feed.is_some() { "G90 G1" } else { "G90 G0" };
        let line = self.format_motion(command, &target, feed)?;
        let handle = self.engine.submit(SendItem::Line(line)).await?;
        handle.executed().await?;
        self.engine.wait_sync().await
    }

    async fn home(&self, axes: Option<Vec<usize>>) -> Result<()> {
        self.ensure_connected()?;
        if !self.config.device.supports_homing {
            return Err(ControllerError::unsupported("home"));
        }
        let line = match axes {
            None => "$H".to_string(),
            Some(list) => {
                let mut line = String::from("$H");
                for index in list {
                    let label = self
                        .engine
                        .with_state(|s| s.axis_label(index))
                        .ok_or_else(|| {
                            ControllerError::machine(format!("no such axis index {}", index))
                        })?;
                    line.push(label.to_ascii_uppercase());
                }
                line
            }
        };
        let handle = self.engine.submit(SendItem::Line(line)).await?;
        handle.executed().await
    }

    async fn probe(&self, target: PartialPosition, feed: Option<f64>) -> Result<Vec<f64>> {
        self.ensure_connected()?;
        let line = self.format_motion("G38.2", &target, feed)?;
        let handle = self.engine.submit(SendItem::Line(line)).await?;
        handle.executed().await?;
        // Success leaves the machine parked at the trip position.
        Ok(self.engine.with_state(|s| s.mpos.clone()))
    }

    fn status(&self) -> StatusSnapshot {
        self.engine.status()
    }

    fn events(&self) -> &EventHub {
        self.engine.events()
    }
}

impl Drop for SimController {
    fn drop(&mut self) {
        self.stop_io_loop();
    }
}

/// Backend IO task: classic write/execute/jog phases against the device
async fn io_loop(
    engine: Arc<ControllerEngine>,
    device: Arc<Mutex<VirtualDevice>>,
    shutdown: Arc<AtomicBool>,
    exec_delay: Duration,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let mut progressed = false;

        // 1. WRITE PHASE: hand lines over while the planner has room. The
        // virtual device parses instantly, so each accepted line acks here.
        loop {
            if !device.lock().can_accept() {
                break;
            }
            let Some(out) = engine.next_ready() else { break };
            device.lock().accept(out.id, out.text);
            engine.events().publish_received("ok");
            engine.on_ack();
            progressed = true;
        }

        // 2. EXECUTE PHASE: one line per pass, paused under feed hold.
        if !engine.is_held() {
            let next = device.lock().pop_next();
            if let Some((id, line)) = next {
                engine.on_executing();
                if !exec_delay.is_zero() {
                    engine.update_state(|s| s.moving = true);
                    tokio::time::sleep(exec_delay).await;
                    engine.update_state(|s| s.moving = false);
                }
                // A cancel/reset may have discarded the instruction while it
                // "ran"; a stale line's effects must not land.
                if engine.front_in_flight_id() == Some(id) {
                    let result = device.lock().execute(&line, &engine);
                    match result {
                        Ok(()) => engine.on_executed(),
                        Err(err) if err.is_fatal() => engine.fatal(err),
                        Err(err) => {
                            engine
                                .events()
                                .publish_received(format!("error: {}", err));
                            engine.on_instruction_error(err);
                        }
                    }
                }
                progressed = true;
            }

            // 3. JOG PHASE: at most one pending nudge, applied out of band.
            let jog = device.lock().take_jog();
            if let Some((axis, increment)) = jog {
                engine.update_state(|s| {
                    if axis < s.mpos.len() {
                        s.mpos[axis] += increment;
                    }
                });
                engine.end_jog();
                progressed = true;
            }
        }

        if !progressed {
            tokio::select! {
                _ = engine.work_available() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_stored_verbatim() {
        let config = SimConfig {
            name: "bench-router".to_string(),
            retry_base_ms: 7,
            ..Default::default()
        };
        let controller = SimController::new(config.clone());
        assert_eq!(controller.config(), &config);
        assert_eq!(controller.name(), "bench-router");
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SimConfig {
            device: VirtualDeviceConfig {
                probe_trip: Some(vec![0.0, 0.0, -3.5]),
                planner_depth: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: SimConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[tokio::test]
    async fn operations_require_a_connection() {
        let controller = SimController::new(SimConfig::default());
        let err = controller.send_line("G0 X1").await.err().unwrap();
        assert_eq!(err.kind(), cnclink_core::ErrorKind::CommError);
        assert!(controller.hold().is_err());
    }

    #[tokio::test]
    async fn unsupported_homing_is_reported_not_ignored() {
        let controller = SimController::new(SimConfig {
            device: VirtualDeviceConfig {
                supports_homing: false,
                ..Default::default()
            },
            ..Default::default()
        });
        controller.init_connection(false).await.unwrap();
        let err = controller.home(None).await.err().unwrap();
        assert_eq!(err.kind(), cnclink_core::ErrorKind::Unsupported);
    }
}
