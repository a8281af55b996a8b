use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::engine::CaptureEngine;
use super::services::EngineServices;
use crate::Core::error::{EngineError, EngineResult};
use crate::Core::metadata::MetadataPool;

/// How intermediate metadata is split when two metadata results are configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialMetaSupport {
    /// Only the driver emits a partial.
    #[default]
    NoSupport,
    /// The override layer emits its own partial; no driver partial.
    Separate,
    /// Driver and override partials are merged into one result.
    Combined,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Slot table size.
    pub max_outstanding_requests: usize,
    /// Number of metadata results per frame (1..=3).
    pub metadata_results: u32,
    pub partial_meta_support: PartialMetaSupport,
    /// Session slots, and flush workers in parallel mode.
    pub max_sessions: usize,
    pub parallel_flush: bool,
    pub flush_timeout_ms: u64,
    /// Bound on each acquire-fence wait while erroring buffers.
    pub fence_timeout_ms: u64,
    /// Allow oldest-buffer eviction when a metadata client is full.
    pub reuse_metadata_buffers: bool,
    /// Buffers of the client used to stage request settings. 0 disables staging.
    pub input_metadata_buffers: usize,
    pub output_metadata_capacity: usize,
    pub camera_id: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_outstanding_requests: 64,
            metadata_results: 2,
            partial_meta_support: PartialMetaSupport::NoSupport,
            max_sessions: 4,
            parallel_flush: false,
            flush_timeout_ms: 1000,
            fence_timeout_ms: 500,
            reuse_metadata_buffers: true,
            input_metadata_buffers: 0,
            output_metadata_capacity: 16,
            camera_id: 0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_outstanding_requests == 0 {
            return Err(EngineError::invalid_config(
                "max_outstanding_requests",
                "must be greater than zero",
            ));
        }
        if !(1..=3).contains(&self.metadata_results) {
            return Err(EngineError::invalid_config(
                "metadata_results",
                format!("expected 1, 2 or 3, got {}", self.metadata_results),
            ));
        }
        if self.max_sessions == 0 {
            return Err(EngineError::invalid_config(
                "max_sessions",
                "must be greater than zero",
            ));
        }
        if self.parallel_flush && self.flush_timeout_ms < 2 {
            return Err(EngineError::invalid_config(
                "flush_timeout_ms",
                "parallel flush needs at least 2 ms to split into two waits",
            ));
        }
        Ok(())
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    services: EngineServices,
}

impl EngineBuilder {
    pub fn new(services: EngineServices) -> Self {
        Self {
            config: EngineConfig::default(),
            services,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_outstanding_requests(mut self, count: usize) -> Self {
        self.config.max_outstanding_requests = count;
        self
    }

    pub fn with_metadata_results(mut self, count: u32) -> Self {
        self.config.metadata_results = count;
        self
    }

    pub fn with_partial_meta_support(mut self, support: PartialMetaSupport) -> Self {
        self.config.partial_meta_support = support;
        self
    }

    pub fn with_max_sessions(mut self, count: usize) -> Self {
        self.config.max_sessions = count;
        self
    }

    pub fn with_parallel_flush(mut self, parallel: bool) -> Self {
        self.config.parallel_flush = parallel;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.config.flush_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.config.fence_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_metadata_reuse(mut self, reuse: bool) -> Self {
        self.config.reuse_metadata_buffers = reuse;
        self
    }

    pub fn with_input_metadata_buffers(mut self, count: usize) -> Self {
        self.config.input_metadata_buffers = count;
        self
    }

    pub fn with_output_metadata_capacity(mut self, capacity: usize) -> Self {
        self.config.output_metadata_capacity = capacity;
        self
    }

    pub fn with_camera_id(mut self, camera_id: u32) -> Self {
        self.config.camera_id = camera_id;
        self
    }

    pub fn build(self) -> EngineResult<CaptureEngine> {
        self.config.validate()?;
        let mut services = self.services;
        let reuse = self.config.reuse_metadata_buffers;
        let pool = services
            .metadata
            .take()
            .unwrap_or_else(|| Arc::new(MetadataPool::new(reuse)));
        CaptureEngine::new(self.config, services, pool)
    }
}
