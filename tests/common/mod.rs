#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use capture_override::Core::{
    ClientId, ClientKind, MetadataHandle, MetadataPool, MetadataStore, SubmitError, TagBuffer,
    TagId,
};
use capture_override::Usecase::Structs::{
    ErrorCode, FrameworkResult, NotifyMessage, PipelineRequest, SessionId, StreamBuffer,
};
use capture_override::Usecase::{
    CaptureEngine, EngineBuilder, EngineConfig, EngineServices, PipelineExecutor,
    RecoveryCoordinator, ResultSink,
};
use parking_lot::Mutex;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Result as seen by the caller, with metadata detached from the output pool.
#[derive(Clone, Debug)]
pub struct DeliveredResult {
    pub frame_number: u64,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
    pub metadata: Option<TagBuffer>,
    pub sparse: Option<bool>,
    pub partial_result: u32,
    pub buffer_return: bool,
}

#[derive(Clone, Debug)]
pub enum Event {
    Result(DeliveredResult),
    Message(NotifyMessage),
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn results(&self) -> Vec<DeliveredResult> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Result(result) => Some(result.clone()),
                Event::Message(_) => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<NotifyMessage> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Message(message) => Some(message.clone()),
                Event::Result(_) => None,
            })
            .collect()
    }

    pub fn errors(&self, frame: u64) -> Vec<ErrorCode> {
        self.messages()
            .iter()
            .filter(|m| m.frame_number() == frame)
            .filter_map(NotifyMessage::error_code)
            .collect()
    }

    pub fn shutter_frames(&self) -> Vec<u64> {
        self.messages()
            .iter()
            .filter_map(|m| match m {
                NotifyMessage::Shutter { frame_number, .. } => Some(*frame_number),
                NotifyMessage::Error { .. } => None,
            })
            .collect()
    }
}

impl ResultSink for RecordingSink {
    fn deliver_result(&self, result: FrameworkResult) {
        let buffer_return = result.is_buffer_return();
        let delivered = DeliveredResult {
            frame_number: result.frame_number,
            sparse: result.metadata.as_ref().map(|m| m.is_sparse()),
            metadata: result.metadata.as_ref().map(|m| m.to_tag_buffer()),
            output_buffers: result.output_buffers,
            input_buffer: result.input_buffer,
            partial_result: result.partial_result,
            buffer_return,
        };
        self.events.lock().push(Event::Result(delivered));
    }

    fn deliver_message(&self, message: NotifyMessage) {
        self.events.lock().push(Event::Message(message));
    }
}

/// Pipeline stand-in. Submissions succeed unless an outcome is queued.
#[derive(Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<Result<(), SubmitError>>>,
    submitted: Mutex<Vec<u64>>,
    staged: Mutex<Vec<Option<TagBuffer>>>,
    flushed: Mutex<Vec<SessionId>>,
    flush_delay: Mutex<Duration>,
    pool: Mutex<Option<Arc<MetadataPool>>>,
}

impl ScriptedExecutor {
    pub fn push_outcome(&self, outcome: Result<(), SubmitError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn set_flush_delay(&self, delay: Duration) {
        *self.flush_delay.lock() = delay;
    }

    /// Lets the executor read staged input metadata.
    pub fn attach_pool(&self, pool: Arc<MetadataPool>) {
        *self.pool.lock() = Some(pool);
    }

    /// Internal frame numbers seen by the pipeline.
    pub fn submitted(&self) -> Vec<u64> {
        self.submitted.lock().clone()
    }

    pub fn staged(&self) -> Vec<Option<TagBuffer>> {
        self.staged.lock().clone()
    }

    pub fn flushed(&self) -> Vec<SessionId> {
        self.flushed.lock().clone()
    }
}

impl PipelineExecutor for ScriptedExecutor {
    fn submit(&self, request: &PipelineRequest<'_>) -> Result<(), SubmitError> {
        self.submitted.lock().push(request.frame_number());

        let staged = match (request.input_metadata, self.pool.lock().as_ref()) {
            (Some(handle), Some(pool)) => pool
                .with_buffer(&handle, |store| {
                    let mut copy = TagBuffer::new();
                    copy.merge(store).map(|_| copy)
                })
                .ok()
                .and_then(Result::ok),
            _ => None,
        };
        self.staged.lock().push(staged);

        self.outcomes.lock().pop_front().unwrap_or(Ok(()))
    }

    fn flush_session(&self, session: SessionId) {
        let delay = *self.flush_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.flushed.lock().push(session);
    }
}

#[derive(Default)]
pub struct RecordingRecovery {
    signals: AtomicUsize,
    dumps: AtomicUsize,
}

impl RecordingRecovery {
    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }

    pub fn dumps(&self) -> usize {
        self.dumps.load(Ordering::SeqCst)
    }
}

impl RecoveryCoordinator for RecordingRecovery {
    fn signal_recovery(&self, _camera_id: u32) {
        self.signals.fetch_add(1, Ordering::SeqCst);
    }

    fn dump_debug_data(&self, _camera_id: u32) {
        self.dumps.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub engine: CaptureEngine,
    pub sink: Arc<RecordingSink>,
    pub executor: Arc<ScriptedExecutor>,
    pub recovery: Arc<RecordingRecovery>,
}

pub fn harness(config: EngineConfig) -> Harness {
    init_logging();
    let sink = Arc::new(RecordingSink::default());
    let executor = Arc::new(ScriptedExecutor::default());
    let recovery = Arc::new(RecordingRecovery::default());
    let services = EngineServices::new(executor.clone(), sink.clone())
        .with_recovery(recovery.clone());
    let engine = EngineBuilder::new(services)
        .with_config(config)
        .build()
        .expect("engine should build");
    Harness {
        engine,
        sink,
        executor,
        recovery,
    }
}

pub fn config(metadata_results: u32) -> EngineConfig {
    EngineConfig {
        metadata_results,
        fence_timeout_ms: 10,
        ..EngineConfig::default()
    }
}

/// Registers a pipeline-side metadata client on the engine's pool.
pub fn pipeline_client(engine: &CaptureEngine, partial_tags: &[TagId]) -> ClientId {
    engine
        .metadata_pool()
        .register_client(ClientKind::Exclusive, &[1, 2, 3], partial_tags, 8)
        .expect("client registration")
}

/// Rents a pool buffer filled with `entries`, as the pipeline would for a result.
pub fn pipeline_metadata(
    engine: &CaptureEngine,
    client: ClientId,
    frame: u64,
    entries: &[(TagId, &[u8])],
) -> MetadataHandle {
    let pool = engine.metadata_pool();
    let handle = pool.get(client, frame).expect("metadata buffer");
    pool.with_buffer_mut(&handle, |store| {
        for (tag, value) in entries {
            store.set(*tag, value).expect("set tag");
        }
    })
    .expect("buffer is valid");
    handle
}

pub fn buffer(stream: u32) -> StreamBuffer {
    StreamBuffer::new(stream, 0x1000 + stream as u64)
}
