use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use parley_core::domain::conversation::{
    ConversationId, ConversationState, Message, PendingAction,
};
use parley_core::domain::record::{Record, RecordId};
use parley_core::experiments::ExperimentAssignment;
use parley_core::metrics::TurnMetrics;

pub mod conversations;
pub mod memory;
pub mod metrics;
pub mod records;

pub use conversations::SqlConversationRepository;
pub use memory::{InMemoryConversationRepository, InMemoryMetricsRepository, InMemoryRecordRepository};
pub use metrics::SqlMetricsRepository;
pub use records::SqlRecordRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// What the finalize step does with the single pending slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingWrite {
    /// Leave whatever is stored untouched.
    Keep,
    /// Replace the slot with a fresh proposal.
    Set(PendingAction),
    /// Empty the slot.
    Clear,
}

/// One turn's buffered mutations, applied together so an aborted turn
/// never leaves a half-written conversation behind.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnCommit {
    pub user_message: Message,
    pub assistant_message: Message,
    pub assignment: Option<ExperimentAssignment>,
    pub pending: PendingWrite,
    pub committed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Full state for one conversation, or `None` if it has never been
    /// seen. Messages come back in append order.
    async fn load(&self, id: &ConversationId)
        -> Result<Option<ConversationState>, RepositoryError>;

    /// Creates the conversation row if missing and bumps `updated_at`.
    async fn ensure(&self, id: &ConversationId, now: DateTime<Utc>)
        -> Result<(), RepositoryError>;

    async fn append_message(
        &self,
        id: &ConversationId,
        message: Message,
    ) -> Result<(), RepositoryError>;

    /// Stores the single pending slot, replacing any previous proposal.
    async fn set_pending(
        &self,
        id: &ConversationId,
        action: PendingAction,
    ) -> Result<(), RepositoryError>;

    async fn clear_pending(&self, id: &ConversationId) -> Result<(), RepositoryError>;

    async fn get_pending(
        &self,
        id: &ConversationId,
    ) -> Result<Option<PendingAction>, RepositoryError>;

    /// First write wins; later calls for the same conversation are
    /// no-ops so assignments stay sticky.
    async fn record_assignment(
        &self,
        id: &ConversationId,
        assignment: ExperimentAssignment,
    ) -> Result<(), RepositoryError>;

    /// Applies one finished turn as a unit: the conversation upsert,
    /// both messages, the sticky assignment, and the pending slot.
    async fn commit_turn(
        &self,
        id: &ConversationId,
        commit: TurnCommit,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn find_by_id(&self, id: &RecordId) -> Result<Option<Record>, RepositoryError>;

    /// All records, newest update first. `tag_filter` keeps only
    /// records carrying that tag.
    async fn list(&self, tag_filter: Option<&str>) -> Result<Vec<Record>, RepositoryError>;

    async fn save(&self, record: Record) -> Result<(), RepositoryError>;

    /// Returns whether a row was actually removed.
    async fn delete(&self, id: &RecordId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn record(&self, metrics: TurnMetrics) -> Result<(), RepositoryError>;

    async fn list_for_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<TurnMetrics>, RepositoryError>;
}
