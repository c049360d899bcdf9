use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use parley_core::domain::conversation::{
    ConversationId, ConversationState, Message, PendingAction,
};
use parley_core::domain::record::{Record, RecordId};
use parley_core::experiments::ExperimentAssignment;
use parley_core::metrics::TurnMetrics;

use super::{
    ConversationRepository, MetricsRepository, PendingWrite, RecordRepository, RepositoryError,
    TurnCommit,
};

#[derive(Clone, Debug)]
struct StoredConversation {
    messages: Vec<Message>,
    pending_action: Option<PendingAction>,
    assignment: Option<ExperimentAssignment>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Clones share the same storage, so one instance can back several
/// components at once the way a pool-backed repository does.
#[derive(Clone, Default)]
pub struct InMemoryConversationRepository {
    conversations: Arc<RwLock<HashMap<String, StoredConversation>>>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn load(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&id.0).map(|stored| ConversationState {
            id: id.clone(),
            messages: stored.messages.clone(),
            pending_action: stored.pending_action.clone(),
            assignment: stored.assignment.clone(),
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }))
    }

    async fn ensure(
        &self,
        id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(id.0.clone())
            .and_modify(|stored| stored.updated_at = now)
            .or_insert_with(|| StoredConversation {
                messages: Vec::new(),
                pending_action: None,
                assignment: None,
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn append_message(
        &self,
        id: &ConversationId,
        message: Message,
    ) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let stored = conversations
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown conversation `{}`", id.0)))?;
        stored.messages.push(message);
        Ok(())
    }

    async fn set_pending(
        &self,
        id: &ConversationId,
        action: PendingAction,
    ) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let stored = conversations
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown conversation `{}`", id.0)))?;
        stored.pending_action = Some(action);
        Ok(())
    }

    async fn clear_pending(&self, id: &ConversationId) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        if let Some(stored) = conversations.get_mut(&id.0) {
            stored.pending_action = None;
        }
        Ok(())
    }

    async fn get_pending(
        &self,
        id: &ConversationId,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&id.0).and_then(|stored| stored.pending_action.clone()))
    }

    async fn record_assignment(
        &self,
        id: &ConversationId,
        assignment: ExperimentAssignment,
    ) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let stored = conversations
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown conversation `{}`", id.0)))?;
        if stored.assignment.is_none() {
            stored.assignment = Some(assignment);
        }
        Ok(())
    }

    async fn commit_turn(
        &self,
        id: &ConversationId,
        commit: TurnCommit,
    ) -> Result<(), RepositoryError> {
        // One write guard for the whole batch, mirroring the SQL
        // transaction.
        let mut conversations = self.conversations.write().await;
        let stored = conversations.entry(id.0.clone()).or_insert_with(|| StoredConversation {
            messages: Vec::new(),
            pending_action: None,
            assignment: None,
            created_at: commit.committed_at,
            updated_at: commit.committed_at,
        });

        stored.updated_at = commit.committed_at;
        stored.messages.push(commit.user_message);
        stored.messages.push(commit.assistant_message);
        if stored.assignment.is_none() {
            stored.assignment = commit.assignment;
        }
        match commit.pending {
            PendingWrite::Keep => {}
            PendingWrite::Set(action) => stored.pending_action = Some(action),
            PendingWrite::Clear => stored.pending_action = None,
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryRecordRepository {
    records: Arc<RwLock<HashMap<String, Record>>>,
}

impl InMemoryRecordRepository {
    /// Preloaded corpus for tests and the scripted smoke run.
    pub async fn with_records(records: Vec<Record>) -> Self {
        let repo = Self::default();
        {
            let mut map = repo.records.write().await;
            for record in records {
                map.insert(record.id.0.clone(), record);
            }
        }
        repo
    }
}

#[async_trait::async_trait]
impl RecordRepository for InMemoryRecordRepository {
    async fn find_by_id(&self, id: &RecordId) -> Result<Option<Record>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&id.0).cloned())
    }

    async fn list(&self, tag_filter: Option<&str>) -> Result<Vec<Record>, RepositoryError> {
        let records = self.records.read().await;
        let mut listed: Vec<Record> = records
            .values()
            .filter(|record| match tag_filter {
                Some(tag) => record.tags.iter().any(|candidate| candidate == tag),
                None => true,
            })
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.0.cmp(&b.id.0)));
        Ok(listed)
    }

    async fn save(&self, record: Record) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records.insert(record.id.0.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        Ok(records.remove(&id.0).is_some())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryMetricsRepository {
    rows: Arc<RwLock<Vec<TurnMetrics>>>,
}

#[async_trait::async_trait]
impl MetricsRepository for InMemoryMetricsRepository {
    async fn record(&self, metrics: TurnMetrics) -> Result<(), RepositoryError> {
        let mut rows = self.rows.write().await;
        rows.push(metrics);
        Ok(())
    }

    async fn list_for_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<TurnMetrics>, RepositoryError> {
        let rows = self.rows.read().await;
        Ok(rows.iter().filter(|row| row.conversation_id == *id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use parley_core::domain::conversation::{ConversationId, Message, PendingAction};
    use parley_core::domain::record::{Record, RecordId};
    use parley_core::experiments::ExperimentAssignment;
    use parley_core::tools::ToolCall;

    use crate::repositories::{
        ConversationRepository, InMemoryConversationRepository, InMemoryRecordRepository,
        PendingWrite, RecordRepository, TurnCommit,
    };

    #[tokio::test]
    async fn in_memory_conversation_repo_round_trip() {
        let repo = InMemoryConversationRepository::default();
        let id = ConversationId("conv-mem-001".to_string());
        let now = parse_ts("2026-02-23T12:00:00Z");

        repo.ensure(&id, now).await.expect("ensure");
        repo.append_message(&id, Message::user("hello", now)).await.expect("append");

        let pending = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-1".to_string()) },
            now,
            Duration::seconds(300),
        );
        repo.set_pending(&id, pending.clone()).await.expect("set pending");

        let state = repo.load(&id).await.expect("load").expect("exists");
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.pending_action, Some(pending));

        repo.clear_pending(&id).await.expect("clear pending");
        assert!(repo.get_pending(&id).await.expect("get pending").is_none());
    }

    #[tokio::test]
    async fn in_memory_assignment_is_sticky() {
        let repo = InMemoryConversationRepository::default();
        let id = ConversationId("conv-mem-002".to_string());
        let now = parse_ts("2026-02-23T12:00:00Z");

        repo.ensure(&id, now).await.expect("ensure");

        let original = ExperimentAssignment {
            experiment_id: "prompt-style-ab".to_string(),
            variant_id: "control".to_string(),
            assigned_at: now,
        };
        let rival = ExperimentAssignment {
            experiment_id: "prompt-style-ab".to_string(),
            variant_id: "citation_forward".to_string(),
            assigned_at: now,
        };

        repo.record_assignment(&id, original.clone()).await.expect("first");
        repo.record_assignment(&id, rival).await.expect("second");

        let state = repo.load(&id).await.expect("load").expect("exists");
        assert_eq!(state.assignment, Some(original));
    }

    #[tokio::test]
    async fn commit_turn_creates_the_conversation_lazily() {
        let repo = InMemoryConversationRepository::default();
        let id = ConversationId("conv-mem-commit".to_string());
        let now = parse_ts("2026-02-23T12:00:00Z");

        let pending = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-9".to_string()) },
            now,
            Duration::seconds(300),
        );
        repo.commit_turn(
            &id,
            TurnCommit {
                user_message: Message::user("delete rec-9", now),
                assistant_message: Message::assistant("Confirm deleting rec-9?", vec![], now),
                assignment: None,
                pending: PendingWrite::Set(pending.clone()),
                committed_at: now,
            },
        )
        .await
        .expect("commit");

        let state = repo.load(&id).await.expect("load").expect("exists");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.pending_action, Some(pending));
        assert_eq!(state.created_at, now);
    }

    #[tokio::test]
    async fn in_memory_record_repo_lists_by_recency_then_id() {
        let now = parse_ts("2026-02-23T12:00:00Z");
        let older = Record {
            id: RecordId("rec-old".to_string()),
            title: "Old".to_string(),
            body: "old body".to_string(),
            tags: vec!["ops".to_string()],
            created_at: now - Duration::hours(2),
            updated_at: now - Duration::hours(2),
        };
        let newer = Record {
            id: RecordId("rec-new".to_string()),
            title: "New".to_string(),
            body: "new body".to_string(),
            tags: vec![],
            created_at: now,
            updated_at: now,
        };

        let repo =
            InMemoryRecordRepository::with_records(vec![older.clone(), newer.clone()]).await;

        let listed = repo.list(None).await.expect("list");
        assert_eq!(listed, vec![newer, older.clone()]);

        let tagged = repo.list(Some("ops")).await.expect("list tagged");
        assert_eq!(tagged, vec![older]);
    }

    #[tokio::test]
    async fn clones_share_the_same_storage() {
        let repo = InMemoryRecordRepository::default();
        let handle = repo.clone();
        let now = parse_ts("2026-02-23T12:00:00Z");

        handle
            .save(Record {
                id: RecordId("rec-shared".to_string()),
                title: "Shared".to_string(),
                body: "visible through every clone".to_string(),
                tags: vec![],
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("save");

        assert_eq!(repo.list(None).await.expect("list").len(), 1);
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
