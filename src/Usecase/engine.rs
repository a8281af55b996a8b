//! Caller-facing surface of the override engine.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use log::{debug, error, info, trace, warn};
use parking_lot::{ReentrantMutex, RwLock};

use super::builder::EngineConfig;
use super::error_path::ErrorPathHandler;
use super::flush::{FlushCoordinator, FlushStatus};
use super::outbox::Outbox;
use super::reconciler::{PartialScheme, PartialStage, ResultReconciler, TranslatedMetadata};
use super::services::EngineServices;
use super::Slots::{FrameCounters, FrameSlotTable, RequestSlot};
use super::Structs::{
    CaptureRequest, CaptureResult, ErrorCode, PipelineMessage, PipelineRequest, SessionId,
};
use crate::Core::error::{EngineError, EngineResult, SubmitError};
use crate::Core::metadata::{
    ClientId, ClientKind, MetadataHandle, MetadataPool, MetadataStore, OutputMetadataPool,
};

/// Request/result virtualization engine for one camera.
///
/// All slot and counter state lives behind one re-entrant lock. Work produced under the lock
/// is collected and handed to the sink once the table borrow is released, so a sink may call
/// back into the engine from the delivering thread. Fence waits and errored-buffer returns
/// happen after the lock is fully released.
pub struct CaptureEngine {
    pub(crate) config: EngineConfig,
    pub(crate) services: EngineServices,
    pub(crate) metadata: Arc<MetadataPool>,
    pub(crate) output_metadata: OutputMetadataPool,
    pub(crate) input_client: Option<ClientId>,
    pub(crate) scheme: PartialScheme,
    pub(crate) slots: ReentrantMutex<RefCell<FrameSlotTable>>,
    pub(crate) sessions: RwLock<Vec<Option<SessionId>>>,
    pub(crate) flush: FlushCoordinator,
    pub(crate) bad_state: CachePadded<AtomicBool>,
    pub(crate) submitted: CachePadded<AtomicU64>,
}

impl CaptureEngine {
    pub(crate) fn new(
        config: EngineConfig,
        services: EngineServices,
        metadata: Arc<MetadataPool>,
    ) -> EngineResult<Self> {
        let input_client = if config.input_metadata_buffers > 0 {
            Some(metadata.register_client(
                ClientKind::Exclusive,
                &[],
                &[],
                config.input_metadata_buffers,
            )?)
        } else {
            None
        };

        let flush = FlushCoordinator::new(
            Arc::clone(&services.executor),
            config.parallel_flush,
            config.max_sessions,
            config.flush_timeout(),
        )?;

        info!(
            "Camera {}: engine ready ({} slots, {} metadata result(s), {} flush)",
            config.camera_id,
            config.max_outstanding_requests,
            config.metadata_results,
            if config.parallel_flush { "parallel" } else { "serial" }
        );

        Ok(Self {
            scheme: PartialScheme::new(config.metadata_results, config.partial_meta_support),
            slots: ReentrantMutex::new(RefCell::new(FrameSlotTable::new(
                config.max_outstanding_requests,
            ))),
            sessions: RwLock::new(vec![None; config.max_sessions]),
            output_metadata: OutputMetadataPool::new(config.output_metadata_capacity),
            bad_state: CachePadded::new(AtomicBool::new(false)),
            submitted: CachePadded::new(AtomicU64::new(0)),
            input_client,
            flush,
            metadata,
            services,
            config,
        })
    }

    /// Runs `f` on the slot table and delivers what it produced.
    fn locked<R>(&self, f: impl FnOnce(&mut FrameSlotTable, &mut Outbox) -> R) -> R {
        let mut outbox = Outbox::new();
        let guard = self.slots.lock();
        let value = {
            let mut table = guard.borrow_mut();
            f(&mut table, &mut outbox)
        };
        outbox.dispatch(self.services.sink.as_ref());
        drop(guard);

        if !outbox.is_empty() {
            outbox.finish(self.services.sink.as_ref(), self.config.fence_timeout());
        }
        value
    }

    /// Admits the request and forwards it to the pipeline.
    ///
    /// `request.frame_number` carries the internal number while the pipeline sees it and is
    /// restored before returning. In bad state the request is not forwarded; it is failed
    /// through the request error path and `Ok` is returned.
    pub fn submit(&self, request: &mut CaptureRequest) -> EngineResult<()> {
        let external = request.frame_number;
        let scheme = self.scheme;
        let internal = self.locked(|table, outbox| {
            let internal = table.admit(&*request, outbox);
            ResultReconciler::new(table, outbox, scheme).release_messages();
            internal
        });
        self.submitted.fetch_add(1, Ordering::Relaxed);

        if self.is_bad_state() {
            warn!(
                "Camera {}: bad state, failing frame {} without submitting",
                self.config.camera_id, external
            );
            self.fail_request(internal);
            return Ok(());
        }

        request.frame_number = internal;
        let staged = self.stage_settings(request, internal);
        let outcome = self.services.executor.submit(&PipelineRequest {
            request: &*request,
            input_metadata: staged,
        });
        request.frame_number = external;

        if let Some(handle) = staged {
            if let Err(e) = self.metadata.release(&handle) {
                debug!("Frame {}: staged settings already released: {}", external, e);
            }
        }

        match outcome {
            Ok(()) => {
                trace!("Frame {} submitted as internal {}", external, internal);
                Ok(())
            }
            Err(SubmitError::Timeout) => {
                error!(
                    "Camera {}: {}, entering bad state",
                    self.config.camera_id,
                    EngineError::SubmissionTimeout { frame: internal }
                );
                self.bad_state.store(true, Ordering::Release);
                self.services.recovery.signal_recovery(self.config.camera_id);
                self.fail_request(internal);
                Ok(())
            }
            Err(SubmitError::Cancelled) => {
                error!("Frame {} cancelled by a flush", external);
                self.fail_request(internal);
                Ok(())
            }
            Err(SubmitError::Failed(message)) => {
                error!("Frame {} rejected by the pipeline: {}", external, message);
                self.locked(|table, _| table.retire_silently(internal));
                Err(EngineError::Pipeline {
                    frame: external,
                    message,
                })
            }
        }
    }

    /// Copies request settings into the input metadata client.
    fn stage_settings(&self, request: &CaptureRequest, internal: u64) -> Option<MetadataHandle> {
        let (Some(client), Some(settings)) = (self.input_client, request.settings.as_ref()) else {
            return None;
        };

        let handle = match self.metadata.get(client, internal) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Frame {}: cannot stage settings: {}", request.frame_number, e);
                return None;
            }
        };
        match self
            .metadata
            .with_buffer_mut(&handle, |store| store.merge(settings))
        {
            Ok(Ok(())) => Some(handle),
            Ok(Err(e)) | Err(e) => {
                warn!("Frame {}: cannot stage settings: {}", request.frame_number, e);
                let _ = self.metadata.release(&handle);
                None
            }
        }
    }

    fn fail_request(&self, internal: u64) {
        let scheme = self.scheme;
        self.locked(|table, outbox| {
            ErrorPathHandler::new(table, outbox).request_error(internal);
            ResultReconciler::new(table, outbox, scheme).release_messages();
        });
    }

    /// Handles a result from `session`. The result's metadata reference is consumed.
    pub fn on_result(&self, result: CaptureResult, session: SessionId) {
        trace!(
            "Result for internal frame {} from session {}",
            result.frame_number,
            session
        );
        let translated = self.translate_metadata(&result);
        let scheme = self.scheme;
        self.locked(|table, outbox| {
            ResultReconciler::new(table, outbox, scheme).on_result(result, translated)
        });
    }

    /// Copies pool metadata into an output buffer. Runs before the slot lock is taken.
    fn translate_metadata(&self, result: &CaptureResult) -> Option<TranslatedMetadata> {
        let handle = result.metadata?;

        let translated = match self.scheme.stage_of(result.partial_result) {
            None => {
                debug!(
                    "Internal frame {}: ordinal {} carries no metadata",
                    result.frame_number, result.partial_result
                );
                None
            }
            Some(stage) => {
                let sparse = stage != PartialStage::Final;
                let partial_tags = if sparse {
                    self.metadata
                        .partial_tags(handle.client())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };

                let mut output = self.output_metadata.acquire(sparse);
                let copied = self.metadata.with_buffer(&handle, |store| {
                    if partial_tags.is_empty() {
                        output.merge(store)
                    } else {
                        store.filter_into(&partial_tags, &mut *output)
                    }
                });
                match copied {
                    Ok(Ok(())) => Some(TranslatedMetadata { stage, output }),
                    Ok(Err(e)) | Err(e) => {
                        warn!(
                            "Internal frame {}: metadata unreadable, delivering without it: {}",
                            result.frame_number, e
                        );
                        None
                    }
                }
            }
        };

        if let Err(e) = self.metadata.release(&handle) {
            debug!(
                "Internal frame {}: metadata release failed: {}",
                result.frame_number, e
            );
        }
        translated
    }

    /// Handles a notification from `session`.
    pub fn on_message(&self, message: PipelineMessage, session: SessionId) {
        let scheme = self.scheme;
        match message {
            PipelineMessage::Shutter {
                frame_number,
                timestamp_ns,
            } => self.locked(|table, outbox| {
                ResultReconciler::new(table, outbox, scheme).on_shutter(frame_number, timestamp_ns)
            }),
            PipelineMessage::Error {
                frame_number,
                code,
                stream,
            } => {
                self.locked(|table, outbox| {
                    let mut handler = ErrorPathHandler::new(table, outbox);
                    match (code, stream) {
                        (ErrorCode::Device, _) => handler.device_error(frame_number),
                        (ErrorCode::Request, _) | (ErrorCode::Buffer, None) => {
                            handler.request_error(frame_number)
                        }
                        (ErrorCode::Result, _) => handler.result_error(frame_number),
                        (ErrorCode::Buffer, Some(stream)) => {
                            handler.buffer_error(frame_number, stream)
                        }
                    };
                    ResultReconciler::new(table, outbox, scheme).release_messages();
                });
                if code == ErrorCode::Device {
                    self.dump_after_device_error(session);
                }
            }
            PipelineMessage::TriggerRecovery => {
                warn!(
                    "Camera {}: session {} requested recovery",
                    self.config.camera_id, session
                );
                self.services.recovery.signal_recovery(self.config.camera_id);
            }
        }
    }

    fn dump_after_device_error(&self, session: SessionId) {
        error!(
            "Camera {}: device error on session {}",
            self.config.camera_id, session
        );
        let mut text = Vec::new();
        match self.dump(&mut text) {
            Ok(()) => error!("{}", String::from_utf8_lossy(&text).trim_end()),
            Err(e) => warn!("Slot dump skipped: {}", e),
        }
        self.services.recovery.dump_debug_data(self.config.camera_id);
    }

    /// Flushes every active session, then errors everything still pending and resets the
    /// frame counters. Concurrent callers share one flush.
    pub fn flush(&self) -> EngineResult<()> {
        let sessions = self.active_sessions();
        self.flush.flush(&sessions, || self.delete_all_pending())
    }

    /// Errors frames up to `external_frame` that still hold buffers and moves past them.
    pub fn flush_up_to(&self, external_frame: u64) -> EngineResult<()> {
        let scheme = self.scheme;
        self.locked(|table, outbox| {
            let target = table
                .to_internal(external_frame)
                .ok_or(EngineError::UnknownFrame(external_frame))?;
            ErrorPathHandler::new(table, outbox).flush_up_to(target);
            ResultReconciler::new(table, outbox, scheme).release_messages();
            Ok(())
        })
    }

    fn delete_all_pending(&self) {
        self.locked(|table, outbox| {
            ErrorPathHandler::new(table, outbox).delete_all_pending();
        });
    }

    /// Writes a snapshot of in-flight slots. Never blocks: returns `Busy` on contention.
    pub fn dump(&self, out: &mut dyn io::Write) -> EngineResult<()> {
        let guard = self.slots.try_lock().ok_or(EngineError::Busy)?;
        let table = guard.try_borrow().map_err(|_| EngineError::Busy)?;
        writeln!(
            out,
            "camera {} bad_state={} flush={:?} submitted={}",
            self.config.camera_id,
            self.is_bad_state(),
            self.flush.status(),
            self.submitted.load(Ordering::Relaxed)
        )?;
        crate::Debug::StructDebug::dump_slot_table(&table, out)?;
        Ok(())
    }

    /// Binds or clears the session in slot `index`.
    pub fn set_session(&self, index: usize, session: Option<SessionId>) -> EngineResult<()> {
        let mut sessions = self.sessions.write();
        let count = sessions.len();
        let entry = sessions.get_mut(index).ok_or_else(|| {
            EngineError::invalid_config(
                "session_index",
                format!("{} is out of range ({} session slots)", index, count),
            )
        })?;
        *entry = session;
        Ok(())
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().iter().flatten().copied().collect()
    }

    /// Marks bad state and errors every pending frame ahead of an external recovery.
    pub fn prepare_for_recovery(&self) {
        warn!("Camera {}: preparing for recovery", self.config.camera_id);
        self.bad_state.store(true, Ordering::Release);
        self.delete_all_pending();
    }

    /// Called by the recovery owner once the pipeline is usable again.
    pub fn clear_bad_state(&self) {
        if self.bad_state.swap(false, Ordering::AcqRel) {
            info!("Camera {}: bad state cleared", self.config.camera_id);
        }
    }

    pub fn is_bad_state(&self) -> bool {
        self.bad_state.load(Ordering::Acquire)
    }

    /// Final flush. Afterwards every flush is rejected with `AlreadyFlushed`.
    pub fn destroy(&self) {
        if self.flush.status() == FlushStatus::HasFlushed {
            return;
        }
        let sessions = self.active_sessions();
        self.flush.teardown(&sessions, || self.delete_all_pending());
        if let Some(client) = self.input_client {
            if let Err(e) = self.metadata.unregister_client(client) {
                debug!("Input metadata client already gone: {}", e);
            }
        }
        info!("Camera {}: engine destroyed", self.config.camera_id);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheme(&self) -> PartialScheme {
        self.scheme
    }

    pub fn flush_status(&self) -> FlushStatus {
        self.flush.status()
    }

    pub fn flush_coordinator(&self) -> &FlushCoordinator {
        &self.flush
    }

    pub fn metadata_pool(&self) -> &Arc<MetadataPool> {
        &self.metadata
    }

    pub fn output_metadata_pool(&self) -> &OutputMetadataPool {
        &self.output_metadata
    }

    pub fn input_metadata_client(&self) -> Option<ClientId> {
        self.input_client
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> FrameCounters {
        let guard = self.slots.lock();
        let counters = *guard.borrow().counters();
        counters
    }

    /// Copy of the newest slot holding `external_frame`.
    pub fn inspect_frame(&self, external_frame: u64) -> Option<RequestSlot> {
        let guard = self.slots.lock();
        let table = guard.borrow();
        let internal = table.to_internal(external_frame)?;
        let slot = table.lookup(internal).cloned();
        slot
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}
