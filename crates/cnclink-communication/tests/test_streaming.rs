use cnclink_communication::{SimConfig, SimController, EngineConfig};
use cnclink_core::{
    ChannelSource, Controller, ControllerError, ErrorKind, GcodeInstruction, InstructionHooks,
    LinesSource, SendItem,
};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

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

#[tokio::test]
async fn stream_executes_every_item_in_order() {
    let controller = connected(SimConfig::default()).await;
    let mut source = LinesSource::new(["G21", "G1 X5 F100", "G1 Y5"]);
    controller.send_stream(&mut source).await.unwrap();

    let status = controller.status();
    assert_eq!(status.mpos, vec![5.0, 5.0, 0.0]);
    assert_eq!(status.line, 3);
    assert!(!status.program_running);
}

#[tokio::test]
async fn stream_marks_the_program_running() {
    let controller = connected(SimConfig::default()).await;
    let mut status_rx = controller.events().subscribe_status();

    let mut source = LinesSource::new(["G0 X1", "G0 X2"]);
    controller.send_stream(&mut source).await.unwrap();

    let mut saw_running = false;
    while let Ok(snapshot) = status_rx.try_recv() {
        if snapshot.program_running {
            saw_running = true;
        }
    }
    assert!(saw_running);
    assert!(!controller.status().program_running);
}

#[tokio::test]
async fn stream_fails_with_first_error_and_cancels_the_rest() {
    let controller = connected(SimConfig::default()).await;
    let recorders: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();

    let items = vec![
        SendItem::Instruction(
            GcodeInstruction::new("G0 X1")
                .with_hooks(recorders[0].clone() as Arc<dyn InstructionHooks>),
        ),
        SendItem::Instruction(
            GcodeInstruction::new("$NOPE")
                .with_hooks(recorders[1].clone() as Arc<dyn InstructionHooks>),
        ),
        SendItem::Instruction(
            GcodeInstruction::new("G0 X2")
                .with_hooks(recorders[2].clone() as Arc<dyn InstructionHooks>),
        ),
    ];

    let mut source = LinesSource::from_items(items);
    let err = controller.send_stream(&mut source).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::MachineError);

    assert_eq!(recorders[0].events(), vec!["executed"]);
    assert_eq!(recorders[1].events(), vec!["error:machine_error"]);
    assert_eq!(recorders[2].events(), vec!["error:cancelled"]);

    // Instruction-local failure: the controller is not latched.
    let status = controller.status();
    assert!(!status.error);
    assert!(!status.program_running);
}

#[tokio::test]
async fn channel_stream_backpressures_the_producer() {
    let controller = Arc::new(
        connected(SimConfig {
            engine: EngineConfig {
                queue_capacity: 2,
                ..Default::default()
            },
            ..Default::default()
        })
        .await,
    );
    controller.hold().unwrap();

    let (tx, mut source) = ChannelSource::channel(1);
    let produced = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let producer = {
        let produced = produced.clone();
        tokio::spawn(async move {
            for i in 0..6 {
                tx.send(SendItem::Line(format!("G0 X{}", i))).await.unwrap();
                produced.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        })
    };

    let consumer = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let result = controller.send_stream(&mut source).await;
            result
        })
    };

    // Held queue + bounded channel: the producer cannot run ahead.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished(), "producer should be backpressured");
    assert!(produced.load(std::sync::atomic::Ordering::SeqCst) < 6);

    controller.resume().unwrap();
    producer.await.unwrap();
    consumer.await.unwrap().unwrap();
    assert_eq!(controller.status().mpos[0], 5.0);
}

#[tokio::test]
async fn send_file_streams_the_trailing_line() {
    let controller = connected(SimConfig::default()).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "G1 X1 F50\nG1 X2\n\nG1 X3").unwrap();

    controller.send_file(file.path()).await.unwrap();

    let status = controller.status();
    assert_eq!(status.mpos[0], 3.0);
    // Four lines streamed: the empty one and the newline-less tail included.
    assert_eq!(status.line, 4);
}

#[tokio::test]
async fn send_file_missing_path_fails() {
    let controller = connected(SimConfig::default()).await;
    let err = controller
        .send_file(std::path::Path::new("/no/such/job.nc"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::CommError);
}
