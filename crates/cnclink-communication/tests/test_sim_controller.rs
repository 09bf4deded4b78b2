use cnclink_communication::{SimConfig, SimController, VirtualDeviceConfig};
use cnclink_core::{
    Controller, ControllerError, ErrorKind, GcodeInstruction, InstructionHooks, PartialPosition,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Hook bundle that records every lifecycle event it sees
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl InstructionHooks for Recorder {
    fn on_queued(&self) {
        self.events.lock().unwrap().push("queued".into());
    }
    fn on_sent(&self) {
        self.events.lock().unwrap().push("sent".into());
    }
    fn on_ack(&self) {
        self.events.lock().unwrap().push("ack".into());
    }
    fn on_executing(&self) {
        self.events.lock().unwrap().push("executing".into());
    }
    fn on_executed(&self) {
        self.events.lock().unwrap().push("executed".into());
    }
    fn on_error(&self, error: &ControllerError) {
        self.events
            .lock()
            .unwrap()
            .push(format!("error:{}", error.kind()));
    }
}

async fn connected(config: SimConfig) -> SimController {
    let controller = SimController::new(config);
    controller.init_connection(false).await.unwrap();
    controller
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn connect_emits_connected_then_ready() {
    let controller = SimController::new(SimConfig::default());
    let mut connected_rx = controller.events().subscribe_connected();
    let mut ready_rx = controller.events().subscribe_ready();

    controller.init_connection(false).await.unwrap();

    assert!(connected_rx.try_recv().is_ok());
    assert!(ready_rx.try_recv().is_ok());
    let status = controller.status();
    assert!(status.ready);
    assert!(!status.error);
}

#[tokio::test]
async fn connect_retries_with_backoff() {
    let controller = SimController::new(SimConfig {
        device: VirtualDeviceConfig {
            connect_failures: 2,
            ..Default::default()
        },
        retry_base_ms: 5,
        retry_cap_ms: 20,
        ..Default::default()
    });
    controller.init_connection(true).await.unwrap();
    assert!(controller.status().ready);
}

#[tokio::test]
async fn connect_without_retry_surfaces_the_failure() {
    let controller = SimController::new(SimConfig {
        device: VirtualDeviceConfig {
            connect_failures: 1,
            ..Default::default()
        },
        ..Default::default()
    });
    let err = controller.init_connection(false).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::CommError);
    assert!(!controller.status().ready);
}

#[tokio::test]
async fn lifecycle_events_fire_in_order() {
    let controller = connected(SimConfig::default()).await;
    let recorder = Arc::new(Recorder::default());

    controller
        .send_gcode(
            GcodeInstruction::new("G0 X5").with_hooks(recorder.clone() as Arc<dyn InstructionHooks>),
        )
        .await
        .unwrap();
    controller.wait_sync().await.unwrap();

    assert_eq!(
        recorder.events(),
        vec!["queued", "sent", "ack", "executing", "executed"]
    );
}

#[tokio::test]
async fn cancel_fans_out_to_everything_queued() {
    let controller = connected(SimConfig::default()).await;
    controller.hold().unwrap();

    let recorders: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
    for (i, recorder) in recorders.iter().enumerate() {
        controller
            .send_gcode(
                GcodeInstruction::new(format!("G0 X{}", i))
                    .with_hooks(recorder.clone() as Arc<dyn InstructionHooks>),
            )
            .await
            .unwrap();
    }

    controller.cancel().unwrap();

    for recorder in &recorders {
        let events = recorder.events();
        let terminals = events.iter().filter(|e| e.starts_with("error:")).count();
        assert_eq!(terminals, 1, "exactly one terminal event: {:?}", events);
        assert!(events.contains(&"error:cancelled".to_string()));
        assert!(!events.contains(&"executed".to_string()));
    }

    let status = controller.status();
    assert!(!status.held);
    assert!(!status.moving);

    // Idempotent: nothing outstanding, so this changes nothing.
    controller.cancel().unwrap();
    assert!(!controller.status().held);
}

#[tokio::test]
async fn probe_without_trip_parks_at_endpoint() {
    let controller = connected(SimConfig::default()).await;
    let err = controller
        .probe(PartialPosition::xyz(None, None, Some(-10.0)), Some(50.0))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ProbeEnd);
    assert_eq!(controller.status().mpos[2], -10.0);
}

#[tokio::test]
async fn probe_resolves_with_trip_position() {
    let controller = connected(SimConfig {
        device: VirtualDeviceConfig {
            probe_trip: Some(vec![0.0, 0.0, -4.25]),
            ..Default::default()
        },
        ..Default::default()
    })
    .await;

    let tripped = controller
        .probe(PartialPosition::xyz(None, None, Some(-10.0)), Some(50.0))
        .await
        .unwrap();
    assert_eq!(tripped, vec![0.0, 0.0, -4.25]);
    // The machine stays parked where the probe tripped.
    assert_eq!(controller.status().mpos, tripped);
}

#[tokio::test]
async fn probe_failure_kinds() {
    let tripped_at_start = connected(SimConfig {
        device: VirtualDeviceConfig {
            probe_tripped_at_start: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let err = tripped_at_start
        .probe(PartialPosition::xyz(None, None, Some(-1.0)), None)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ProbeInitialState);

    let refusing = connected(SimConfig {
        device: VirtualDeviceConfig {
            refuse_probe: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let err = refusing
        .probe(PartialPosition::xyz(None, None, Some(-1.0)), None)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ProbeNotTripped);
}

#[tokio::test]
async fn fault_latches_error_and_cancels_in_flight() {
    let controller = connected(SimConfig::default()).await;
    let mut error_rx = controller.events().subscribe_error();
    controller.hold().unwrap();

    let recorder = Arc::new(Recorder::default());
    controller
        .send_gcode(
            GcodeInstruction::new("G0 X9").with_hooks(recorder.clone() as Arc<dyn InstructionHooks>),
        )
        .await
        .unwrap();

    controller.inject_fault(ControllerError::comm("serial line dropped"));

    let status = controller.status();
    assert!(status.error);
    assert!(!status.ready);
    assert_eq!(
        status.error_data.as_ref().map(|e| e.kind()),
        Some(ErrorKind::CommError)
    );

    // Exactly one controller-level error broadcast.
    assert_eq!(error_rx.try_recv().unwrap().kind(), ErrorKind::CommError);
    assert!(error_rx.try_recv().is_err());

    // The queued instruction was fanned out as cancelled.
    let events = recorder.events();
    assert!(events.contains(&"error:cancelled".to_string()));

    // Submissions are refused until the latch clears.
    let refused = controller.send_line("G0 X1").await.err().unwrap();
    assert_eq!(refused.kind(), ErrorKind::CommError);

    controller.clear_error().await.unwrap();
    let status = controller.status();
    assert!(!status.error);
    assert!(status.ready);
    controller.send_line("G0 X1").await.unwrap();
    controller.wait_sync().await.unwrap();
}

#[tokio::test]
async fn soft_limit_alarm_latches_the_controller() {
    let controller = connected(SimConfig {
        device: VirtualDeviceConfig {
            soft_limit: Some(vec![50.0, 50.0, 50.0]),
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let mut error_rx = controller.events().subscribe_error();

    // The commanded move trips the device's soft limit; the alarm latches
    // and the in-flight instruction is fanned out as cancelled.
    let err = controller
        .move_to(PartialPosition::xyz(Some(100.0), None, None), None)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let status = controller.status();
    assert!(status.error);
    assert!(!status.ready);
    assert_eq!(
        status.error_data.as_ref().map(|e| e.kind()),
        Some(ErrorKind::MachineError)
    );
    assert_eq!(status.mpos, vec![0.0, 0.0, 0.0]);

    let broadcast = error_rx.try_recv().unwrap();
    assert_eq!(broadcast.kind(), ErrorKind::MachineError);
    assert!(broadcast.is_fatal());
    assert!(error_rx.try_recv().is_err(), "only one error broadcast");

    // clear_error is the recovery path short of reset.
    controller.clear_error().await.unwrap();
    controller
        .move_to(PartialPosition::xyz(Some(25.0), None, None), None)
        .await
        .unwrap();
    assert_eq!(controller.status().mpos[0], 25.0);
}

#[tokio::test]
async fn clear_error_fails_when_device_refuses() {
    let controller = connected(SimConfig {
        device: VirtualDeviceConfig {
            refuse_unlock: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    controller.inject_fault(ControllerError::alarm(1, "hard alarm"));
    let err = controller.clear_error().await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::MachineError);
    assert!(controller.status().error);
}

#[tokio::test]
async fn reset_cancels_and_replays_the_handshake() {
    let controller = connected(SimConfig::default()).await;
    controller.hold().unwrap();

    let recorder = Arc::new(Recorder::default());
    controller
        .send_gcode(
            GcodeInstruction::new("G0 X3").with_hooks(recorder.clone() as Arc<dyn InstructionHooks>),
        )
        .await
        .unwrap();

    let mut ready_rx = controller.events().subscribe_ready();
    controller.reset().await.unwrap();

    assert!(recorder.events().contains(&"error:cancelled".to_string()));
    assert!(ready_rx.try_recv().is_ok());

    let status = controller.status();
    assert!(status.ready);
    assert!(!status.held);
    assert_eq!(status.mpos, vec![0.0, 0.0, 0.0]);
    assert_eq!(status.line, 0);
}

#[tokio::test]
async fn reset_recovers_from_a_latched_error() {
    let controller = connected(SimConfig::default()).await;
    controller.inject_fault(ControllerError::SafetyInterlock);
    assert!(controller.status().error);

    controller.reset().await.unwrap();
    let status = controller.status();
    assert!(!status.error);
    assert!(status.ready);
}

#[tokio::test]
async fn move_to_updates_position_and_feed() {
    let controller = connected(SimConfig::default()).await;
    controller
        .move_to(
            PartialPosition::xyz(Some(10.0), Some(20.0), None),
            Some(500.0),
        )
        .await
        .unwrap();

    let status = controller.status();
    assert_eq!(status.mpos, vec![10.0, 20.0, 0.0]);
    assert_eq!(status.pos, vec![10.0, 20.0, 0.0]);
    assert_eq!(status.feed, 500.0);
    assert!(!status.moving);
}

#[tokio::test]
async fn move_rejected_by_cancel() {
    let controller = Arc::new(connected(SimConfig {
        device: VirtualDeviceConfig {
            exec_delay_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    })
    .await);

    let mover = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .move_to(PartialPosition::xyz(Some(100.0), None, None), None)
                .await
        })
    };

    // Let the move reach the device, then abort it.
    wait_until(|| controller.status().moving).await;
    controller.cancel().unwrap();

    let result = mover.await.unwrap();
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Cancelled));
}

#[tokio::test]
async fn home_defaults_to_all_homable_axes() {
    let controller = connected(SimConfig::default()).await;
    controller
        .move_to(PartialPosition::xyz(Some(7.0), Some(7.0), Some(7.0)), None)
        .await
        .unwrap();

    controller.home(None).await.unwrap();
    let status = controller.status();
    assert_eq!(status.homed, vec![true, true, true]);
    assert_eq!(status.mpos, vec![0.0, 0.0, 0.0]);
}

#[tokio::test]
async fn home_selected_axes_only() {
    let controller = connected(SimConfig::default()).await;
    controller
        .move_to(PartialPosition::xyz(Some(5.0), Some(5.0), Some(5.0)), None)
        .await
        .unwrap();

    controller.home(Some(vec![2])).await.unwrap();
    let status = controller.status();
    assert_eq!(status.homed, vec![false, false, true]);
    assert_eq!(status.mpos, vec![5.0, 5.0, 0.0]);
}

#[tokio::test]
async fn real_time_jogs_coalesce() {
    let controller = connected(SimConfig::default()).await;
    controller.hold().unwrap();

    // Jogs are deferred while held, so the second call finds the first
    // still outstanding and is dropped.
    controller.real_time_move(0, 1.5).unwrap();
    controller.real_time_move(0, 99.0).unwrap();
    controller.resume().unwrap();

    wait_until(|| controller.status().mpos[0] != 0.0).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(controller.status().mpos[0], 1.5);

    // With the slot free again, the next nudge lands.
    controller.real_time_move(0, -0.5).unwrap();
    wait_until(|| controller.status().mpos[0] == 1.0).await;
}

#[tokio::test]
async fn hold_keeps_queue_and_resume_releases_it() {
    let controller = connected(SimConfig::default()).await;
    controller.hold().unwrap();
    controller.send_line("G0 X2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(controller.status().held);
    assert_eq!(controller.status().mpos[0], 0.0);

    controller.resume().unwrap();
    controller.wait_sync().await.unwrap();
    assert_eq!(controller.status().mpos[0], 2.0);
}

#[tokio::test]
async fn modal_state_tracks_executed_lines() {
    let controller = connected(SimConfig::default()).await;
    for line in [
        "G20",
        "G91",
        "G93",
        "M3 S12000",
        "M8",
        "G1 X5 F100",
        "G1 X5",
    ] {
        controller.send_line(line).await.unwrap();
    }
    controller.wait_sync().await.unwrap();

    let status = controller.status();
    assert_eq!(status.units, cnclink_core::Units::In);
    assert!(status.incremental);
    assert_eq!(status.mpos[0], 10.0);
    assert_eq!(status.feed, 100.0);
    assert!(status.spindle);
    assert_eq!(status.coolant, cnclink_core::Coolant::Flood);
    assert_eq!(status.line, 7);
}

#[tokio::test]
async fn coordinate_systems_and_transient_offsets() {
    let controller = connected(SimConfig::default()).await;
    for line in [
        "G10 L2 P2 X1 Y2 Z3", // program G55's offsets
        "G55",
        "G90 G0 X0 Y0 Z0", // work zero of G55 = machine (1,2,3)
        "G92 X10",         // make the current X read as 10
    ] {
        controller.send_line(line).await.unwrap();
    }
    controller.wait_sync().await.unwrap();

    let status = controller.status();
    assert_eq!(status.active_coord_sys, Some(1));
    assert_eq!(status.mpos, vec![1.0, 2.0, 3.0]);
    assert!(status.offset_enabled);
    // effective = G55 offset + transient; work X must now read 10
    assert_eq!(status.pos[0], 10.0);
    assert_eq!(status.pos[1], 0.0);
    assert_eq!(status.pos[2], 0.0);
}

#[tokio::test]
async fn stored_positions_round_trip() {
    let controller = connected(SimConfig::default()).await;
    for line in ["G0 X4 Y5 Z6", "G28.1", "G0 X0 Y0 Z0", "G28"] {
        controller.send_line(line).await.unwrap();
    }
    controller.wait_sync().await.unwrap();

    let status = controller.status();
    assert_eq!(status.stored_positions[0], vec![4.0, 5.0, 6.0]);
    assert_eq!(status.mpos, vec![4.0, 5.0, 6.0]);
}

#[tokio::test]
async fn snapshot_is_internally_consistent() {
    let controller = connected(SimConfig::default()).await;
    // Harness-style atomic mutation of the state vector.
    controller.engine().update_state(|s| {
        s.mpos = vec![5.0, 5.0, 5.0];
        s.coord_sys_offsets[0] = vec![1.0, 1.0, 1.0];
    });

    let status = controller.status();
    assert_eq!(status.mpos, vec![5.0, 5.0, 5.0]);
    assert_eq!(status.mpos_offset, vec![1.0, 1.0, 1.0]);
    assert_eq!(status.pos, vec![4.0, 4.0, 4.0]);
}

#[tokio::test]
async fn wait_sync_is_bounded_when_idle() {
    let controller = connected(SimConfig::default()).await;
    tokio::time::timeout(Duration::from_millis(250), controller.wait_sync())
        .await
        .expect("wait_sync must complete when idle")
        .unwrap();
}

#[tokio::test]
async fn device_errors_are_instruction_local() {
    let controller = connected(SimConfig::default()).await;
    let recorder = Arc::new(Recorder::default());
    controller
        .send_gcode(
            GcodeInstruction::new("$BOGUS")
                .with_hooks(recorder.clone() as Arc<dyn InstructionHooks>),
        )
        .await
        .unwrap();
    controller.wait_sync().await.unwrap();

    assert!(recorder
        .events()
        .contains(&"error:machine_error".to_string()));

    // The controller is not latched; later submissions run normally.
    let status = controller.status();
    assert!(!status.error);
    controller.send_line("G0 X1").await.unwrap();
    controller.wait_sync().await.unwrap();
    assert_eq!(controller.status().mpos[0], 1.0);
}
