// Weaver Library
// Exports core modules for use by both the host process and the CLI binary

pub mod archive;
pub mod bus;
pub mod config;
pub mod host;
pub mod lifecycle;
pub mod model;
pub mod observer;
pub mod orchestrator;
pub mod policy;
pub mod selectors;
pub mod store;
pub mod tokens;

// Re-export commonly used types for the binaries
pub use model::{
    ArtifactManifest, ArtifactType, BriefGeneratorKind, BriefMetadata, ConversationTurn,
    ExtractedArtifact, Segment, SegmentStatus, Thread, ThreadState, TurnRole, UserSettings,
    format_segment_name,
};

pub use store::{keys, DurableStore, FileStore, MemoryStore, Records, StoreError};
pub use store::watch::{watch_store, StoreWatcher};

pub use lifecycle::{LifecycleError, LifecycleManager, NewThread, RepairReport, conversation_id_from_url};

pub use bus::{BusError, Context, Delivery, Endpoint, Mailbox, Message, MessageBus, decode};

pub use orchestrator::{
    CheckpointError, Orchestrator, OrchestratorConfig, ResumeSummary, StageError,
};
pub use orchestrator::progress::{CheckpointProgress, CheckpointStage, TriggerSource};
pub use orchestrator::collaborators::{
    BriefGenerator, BriefResult, CollaboratorError, Collaborators, ConversationRef, Extractor,
    KnowledgeUploader, PageAutomation, UnavailablePage,
};
pub use orchestrator::api_brief::ApiBriefGenerator;

pub use archive::{ArchiveError, LocalArchive};
pub use config::{HostConfig, ConfigError, init_logging};
pub use policy::{SplitPolicy, SplitReason, should_split};
pub use selectors::{SelectorError, SelectorMap};
pub use tokens::{count_tokens, estimate_tokens_quick};
