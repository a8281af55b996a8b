// Module naming follows project convention (Usecase = per-camera request engine)
#[allow(non_snake_case)]
pub mod Usecase {
    pub mod builder;
    mod debug;
    pub mod engine;
    pub(crate) mod error_path;
    pub mod flush;
    pub(crate) mod outbox;
    pub mod reconciler;
    pub mod services;
    pub mod Slots {
        pub mod Slot;
        pub mod SlotTable;
        pub mod SlotTable_impl;
        pub use Slot::{
            CompletionCounters, MessageProgress, MetadataProgress, RequestSlot, SlotState,
        }; // re-export for stable path
        pub use SlotTable::{FrameCounters, FrameSlotTable};
    }
    pub mod Structs {
        pub mod Request_Structs;
        pub use Request_Structs::*; // re-export for stable path
    }

    pub use builder::{EngineBuilder, EngineConfig, PartialMetaSupport};
    pub use engine::CaptureEngine;
    pub use flush::{FlushCoordinator, FlushStatus};
    pub use reconciler::{PartialScheme, PartialStage};
    pub use services::{
        EngineServices, LogOnlyRecovery, PipelineExecutor, RecoveryCoordinator, ResultSink,
    };
}

#[allow(non_snake_case)]
pub mod Core {
    pub mod error;
    pub mod fence;
    pub mod metadata;
    pub use error::{EngineError, EngineResult, SubmitError};
    pub use metadata::{
        ClientId, ClientKind, MetadataHandle, MetadataPool, MetadataStore, OutputMetadata,
        OutputMetadataPool, TagBuffer, TagId, MAX_SHARED_BUFFERS,
    };
}

#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}
