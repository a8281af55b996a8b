// In demos/capture_loop.rs
use capture_override::Core::{ClientKind, MetadataStore, SubmitError};
use capture_override::Usecase::Structs::{
    CaptureRequest, CaptureResult, ErrorCode, FrameworkResult, NotifyMessage, PipelineMessage,
    PipelineRequest, SessionId, StreamBuffer, StreamKind,
};
use capture_override::Usecase::{EngineBuilder, EngineServices, PipelineExecutor, ResultSink};
use parking_lot::Mutex;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SESSION: SessionId = 0;
const PREVIEW: u32 = 0;
const STILL: u32 = 1;

/// Forwards submitted frames to the fake pipeline thread.
struct ChannelPipeline {
    queue: Mutex<Option<mpsc::Sender<(u64, Vec<StreamBuffer>)>>>,
}

impl ChannelPipeline {
    /// Lets the pipeline thread run out of work and exit.
    fn close(&self) {
        self.queue.lock().take();
    }
}

impl PipelineExecutor for ChannelPipeline {
    fn submit(&self, request: &PipelineRequest<'_>) -> Result<(), SubmitError> {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Err(SubmitError::Cancelled);
        };
        tx.send((request.frame_number(), request.request.output_buffers.clone()))
            .map_err(|_| SubmitError::Failed("pipeline thread is gone".to_string()))
    }

    fn flush_session(&self, session: SessionId) {
        println!("Pipeline: flushing session {}", session);
    }
}

#[derive(Default)]
struct CountingSink {
    results: AtomicU64,
    shutters: AtomicU64,
    errors: AtomicU64,
    last_shutter: AtomicU64,
}

impl ResultSink for CountingSink {
    fn deliver_result(&self, result: FrameworkResult) {
        self.results.fetch_add(1, Ordering::Relaxed);
        if let Some(metadata) = &result.metadata {
            log::trace!(
                "Frame {}: {} tag(s), partial {}",
                result.frame_number,
                metadata.count(),
                result.partial_result
            );
        }
    }

    fn deliver_message(&self, message: NotifyMessage) {
        match message {
            NotifyMessage::Shutter { frame_number, .. } => {
                let previous = self.last_shutter.swap(frame_number, Ordering::Relaxed);
                if frame_number < previous {
                    eprintln!("Shutter {} delivered after {}", frame_number, previous);
                }
                self.shutters.fetch_add(1, Ordering::Relaxed);
            }
            NotifyMessage::Error {
                frame_number, code, ..
            } => {
                println!("Frame {}: {:?} error", frame_number, code);
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_frames> [--auto-exit]", args[0]);
        std::process::exit(1);
    }
    let num_frames: u64 = args[1].parse()?;
    let auto_exit = args.get(2).map(|s| s == "--auto-exit").unwrap_or(false);

    let (tx, rx) = mpsc::channel();
    let sink = Arc::new(CountingSink::default());
    let executor = Arc::new(ChannelPipeline {
        queue: Mutex::new(Some(tx)),
    });
    let services = EngineServices::new(executor.clone(), sink.clone());
    let engine = Arc::new(
        EngineBuilder::new(services)
            .with_max_outstanding_requests(16)
            .with_metadata_results(2)
            .build()?,
    );
    engine.set_session(0, Some(SESSION))?;

    let client = engine
        .metadata_pool()
        .register_client(ClientKind::Exclusive, &[1, 2], &[1], 8)?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_for_handler = Arc::clone(&keep_running);

    // Handle Ctrl+C to stop submitting
    ctrlc::set_handler(move || {
        keep_running_for_handler.store(false, Ordering::SeqCst);
    })?;

    // Fake pipeline: shutter, partial, then buffers with final metadata
    let pipeline_engine = Arc::clone(&engine);
    let pipeline = std::thread::spawn(move || {
        let engine = pipeline_engine;
        let pool = Arc::clone(engine.metadata_pool());
        for (frame, outputs) in rx {
            engine.on_message(
                PipelineMessage::Shutter {
                    frame_number: frame,
                    timestamp_ns: frame * 33_000_000,
                },
                SESSION,
            );

            let mut result = CaptureResult::new(frame);
            for buffer in outputs {
                // Drop roughly one still buffer in twenty
                if buffer.stream == STILL && fastrand::u8(..20) == 0 {
                    engine.on_message(
                        PipelineMessage::Error {
                            frame_number: frame,
                            code: ErrorCode::Buffer,
                            stream: Some(STILL),
                        },
                        SESSION,
                    );
                } else {
                    result = result.with_output(buffer);
                }
            }

            for ordinal in 1..=2u32 {
                let Ok(handle) = pool.get(client, frame) else {
                    eprintln!("Pipeline: no metadata buffer for frame {}", frame);
                    break;
                };
                let _ = pool.with_buffer_mut(&handle, |store| {
                    store.set(1, &frame.to_le_bytes())?;
                    store.set(2, &ordinal.to_le_bytes())
                });
                if ordinal == 1 {
                    engine.on_result(CaptureResult::new(frame).with_metadata(handle, 1), SESSION);
                } else {
                    let full = std::mem::take(&mut result);
                    engine.on_result(full.with_metadata(handle, 2), SESSION);
                }
            }
        }
    });

    let start = Instant::now();
    let mut submitted = 0;
    for frame in 0..num_frames {
        if !keep_running.load(Ordering::SeqCst) {
            break;
        }
        let mut request = CaptureRequest::new(frame)
            .with_output(StreamBuffer::new(PREVIEW, 0x1000 + frame));
        if frame % 10 == 0 {
            request = request
                .with_output(
                    StreamBuffer::new(STILL, 0x8000 + frame).with_kind(StreamKind::Snapshot),
                )
                .with_zsl(true);
        }
        if let Err(e) = engine.submit(&mut request) {
            eprintln!("Failed to submit frame {}: {}", frame, e);
            continue;
        }
        submitted += 1;
        std::thread::sleep(Duration::from_micros(200));
    }

    // Let the pipeline drain before the final flush
    std::thread::sleep(Duration::from_millis(50));
    if !auto_exit {
        println!("Press Ctrl+C to flush and exit...");
        while keep_running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    engine.flush()?;
    let mut dump = Vec::new();
    engine.dump(&mut dump)?;
    print!("{}", String::from_utf8_lossy(&dump));

    println!(
        "Submitted {} frames in {:.2?}: {} results, {} shutters, {} errors",
        submitted,
        start.elapsed(),
        sink.results.load(Ordering::Relaxed),
        sink.shutters.load(Ordering::Relaxed),
        sink.errors.load(Ordering::Relaxed)
    );

    engine.destroy();
    executor.close();
    if pipeline.join().is_err() {
        eprintln!("Pipeline thread panicked");
    }
    Ok(())
}
