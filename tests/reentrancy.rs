mod common;

use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;

use capture_override::Core::EngineError;
use capture_override::Usecase::Structs::{
    CaptureRequest, ErrorCode, FrameworkResult, NotifyMessage, PipelineMessage,
};
use capture_override::Usecase::{CaptureEngine, EngineBuilder, EngineServices, ResultSink};
use common::{buffer, config, harness, init_logging, ScriptedExecutor};
use parking_lot::Mutex;
use serial_test::serial;

/// Dumps the engine from inside every notification callback.
#[derive(Default)]
struct DumpingSink {
    engine: Mutex<Weak<CaptureEngine>>,
    dumps: Mutex<Vec<String>>,
}

impl ResultSink for DumpingSink {
    fn deliver_result(&self, _result: FrameworkResult) {}

    fn deliver_message(&self, _message: NotifyMessage) {
        let Some(engine) = self.engine.lock().upgrade() else {
            return;
        };
        let mut out = Vec::new();
        engine.dump(&mut out).expect("same-thread dump re-enters the slot lock");
        self.dumps.lock().push(String::from_utf8_lossy(&out).into_owned());
    }
}

/// Parks the delivering thread until the test lets it go.
struct GateSink {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl ResultSink for GateSink {
    fn deliver_result(&self, _result: FrameworkResult) {}

    fn deliver_message(&self, _message: NotifyMessage) {
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv();
    }
}

#[test]
#[serial]
fn test_sink_may_reenter_engine() {
    init_logging();
    let sink = Arc::new(DumpingSink::default());
    let services = EngineServices::new(Arc::new(ScriptedExecutor::default()), sink.clone());
    let engine = Arc::new(
        EngineBuilder::new(services)
            .with_config(config(1))
            .build()
            .expect("build"),
    );
    *sink.engine.lock() = Arc::downgrade(&engine);

    let mut request = CaptureRequest::new(9).with_output(buffer(1));
    engine.submit(&mut request).expect("submit");
    engine.on_message(
        PipelineMessage::Shutter {
            frame_number: 0,
            timestamp_ns: 5,
        },
        0,
    );

    let dumps = sink.dumps.lock();
    assert_eq!(dumps.len(), 1);
    assert!(dumps[0].contains("internal      0"), "{}", dumps[0]);
}

#[test]
#[serial]
fn test_dump_is_busy_while_another_thread_delivers() {
    init_logging();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let sink = Arc::new(GateSink {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let services = EngineServices::new(Arc::new(ScriptedExecutor::default()), sink);
    let engine = EngineBuilder::new(services)
        .with_config(config(1))
        .build()
        .expect("build");

    let mut request = CaptureRequest::new(1).with_output(buffer(1));
    engine.submit(&mut request).expect("submit");

    thread::scope(|scope| {
        let delivering = scope.spawn(|| {
            engine.on_message(
                PipelineMessage::Shutter {
                    frame_number: 0,
                    timestamp_ns: 1,
                },
                0,
            )
        });

        entered_rx.recv().expect("sink entered");
        let mut out = Vec::new();
        assert!(matches!(engine.dump(&mut out), Err(EngineError::Busy)));
        release_tx.send(()).expect("release sink");
        delivering.join().expect("delivering thread");
    });

    let mut out = Vec::new();
    engine.dump(&mut out).expect("lock is free again");
}

#[test]
#[serial]
fn test_prepare_for_recovery_fails_pending_frames() {
    let h = harness(config(1));
    for frame in 1..=2 {
        let mut request = CaptureRequest::new(frame).with_output(buffer(1));
        h.engine.submit(&mut request).expect("submit");
    }

    h.engine.prepare_for_recovery();
    assert!(h.engine.is_bad_state());
    assert_eq!(h.sink.errors(1), vec![ErrorCode::Request]);
    assert_eq!(h.sink.errors(2), vec![ErrorCode::Request]);
    assert!(!h.engine.counters().is_started());

    let mut request = CaptureRequest::new(3).with_output(buffer(1));
    h.engine.submit(&mut request).expect("submit");
    assert_eq!(h.executor.submitted(), vec![0, 1]);
    assert_eq!(h.sink.errors(3), vec![ErrorCode::Request]);

    h.engine.on_message(PipelineMessage::TriggerRecovery, 0);
    assert_eq!(h.recovery.signals(), 1);
}
