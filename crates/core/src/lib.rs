pub mod config;
pub mod domain;
pub mod errors;
pub mod experiments;
pub mod flows;
pub mod metrics;
pub mod reflection;
pub mod retrieval;
pub mod text;
pub mod tools;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use domain::conversation::{
    ActionId, ConversationId, ConversationState, Message, MessageRole, PendingAction,
    SourceCitation, TurnId,
};
pub use domain::record::{Record, RecordDraft, RecordId, RecordPatch};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use experiments::{
    ExperimentAssignment, ExperimentDefinition, ExperimentError, PromptStyle, Variant,
    VariantParams, VariantSelector,
};
pub use metrics::{MetricsTracker, ModelPricing, TokenUsage, TurnMetrics, TurnOutcome};
pub use reflection::{
    ReflectionOutcome, ReflectionValidator, ReflectionVerdict, StylePolicy, Violation,
    ViolationKind,
};
pub use retrieval::{adaptive_alpha, fuse, RetrievalResult, SearchHit};
pub use tools::{ToolCall, ToolCallError};
