use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::conversation::{
    ActionId, ConversationId, ConversationState, Message, MessageRole, PendingAction,
    SourceCitation,
};
use parley_core::experiments::ExperimentAssignment;
use parley_core::tools::ToolCall;

use super::{ConversationRepository, PendingWrite, RepositoryError, TurnCommit};
use crate::DbPool;

#[derive(Clone)]
pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn load(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let conversation_row = sqlx::query(
            "SELECT id, created_at, updated_at
             FROM conversation
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(conversation_row) = conversation_row else {
            return Ok(None);
        };

        let message_rows = sqlx::query(
            "SELECT role, content, citations_json, created_at
             FROM message
             WHERE conversation_id = ?
             ORDER BY position ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        let messages = message_rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let pending_action = self.get_pending(id).await?;

        let assignment_row = sqlx::query(
            "SELECT experiment_id, variant_id, assigned_at
             FROM experiment_assignment
             WHERE conversation_id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        let assignment = assignment_row.map(assignment_from_row).transpose()?;

        Ok(Some(ConversationState {
            id: id.clone(),
            messages,
            pending_action,
            assignment,
            created_at: parse_timestamp("created_at", conversation_row.try_get("created_at")?)?,
            updated_at: parse_timestamp("updated_at", conversation_row.try_get("updated_at")?)?,
        }))
    }

    async fn ensure(
        &self,
        id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation (id, created_at, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(&id.0)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_message(
        &self,
        id: &ConversationId,
        message: Message,
    ) -> Result<(), RepositoryError> {
        let citations_json = serde_json::to_string(&message.citations)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO message (conversation_id, position, role, content, citations_json, created_at)
             SELECT ?1, COALESCE(MAX(position) + 1, 0), ?2, ?3, ?4, ?5
             FROM message
             WHERE conversation_id = ?1",
        )
        .bind(&id.0)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&citations_json)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_pending(
        &self,
        id: &ConversationId,
        action: PendingAction,
    ) -> Result<(), RepositoryError> {
        let call_json = serde_json::to_string(&action.call)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO pending_action (
                conversation_id,
                action_id,
                call_json,
                fingerprint,
                proposed_at,
                expires_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE SET
                action_id = excluded.action_id,
                call_json = excluded.call_json,
                fingerprint = excluded.fingerprint,
                proposed_at = excluded.proposed_at,
                expires_at = excluded.expires_at",
        )
        .bind(&id.0)
        .bind(&action.action_id.0)
        .bind(&call_json)
        .bind(&action.fingerprint)
        .bind(action.proposed_at.to_rfc3339())
        .bind(action.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_pending(&self, id: &ConversationId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM pending_action WHERE conversation_id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_pending(
        &self,
        id: &ConversationId,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let row = sqlx::query(
            "SELECT action_id, call_json, fingerprint, proposed_at, expires_at
             FROM pending_action
             WHERE conversation_id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(pending_from_row).transpose()
    }

    async fn record_assignment(
        &self,
        id: &ConversationId,
        assignment: ExperimentAssignment,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO experiment_assignment (
                conversation_id,
                experiment_id,
                variant_id,
                assigned_at
             ) VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_id) DO NOTHING",
        )
        .bind(&id.0)
        .bind(&assignment.experiment_id)
        .bind(&assignment.variant_id)
        .bind(assignment.assigned_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn commit_turn(
        &self,
        id: &ConversationId,
        commit: TurnCommit,
    ) -> Result<(), RepositoryError> {
        let user_citations = serde_json::to_string(&commit.user_message.citations)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        let assistant_citations = serde_json::to_string(&commit.assistant_message.citations)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        // Any early return below drops the transaction, which rolls
        // the partial turn back.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversation (id, created_at, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(&id.0)
        .bind(commit.committed_at.to_rfc3339())
        .bind(commit.committed_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for (message, citations_json) in [
            (&commit.user_message, &user_citations),
            (&commit.assistant_message, &assistant_citations),
        ] {
            sqlx::query(
                "INSERT INTO message (conversation_id, position, role, content, citations_json, created_at)
                 SELECT ?1, COALESCE(MAX(position) + 1, 0), ?2, ?3, ?4, ?5
                 FROM message
                 WHERE conversation_id = ?1",
            )
            .bind(&id.0)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(citations_json)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(assignment) = &commit.assignment {
            sqlx::query(
                "INSERT INTO experiment_assignment (
                    conversation_id,
                    experiment_id,
                    variant_id,
                    assigned_at
                 ) VALUES (?, ?, ?, ?)
                 ON CONFLICT(conversation_id) DO NOTHING",
            )
            .bind(&id.0)
            .bind(&assignment.experiment_id)
            .bind(&assignment.variant_id)
            .bind(assignment.assigned_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        match &commit.pending {
            PendingWrite::Keep => {}
            PendingWrite::Set(action) => {
                let call_json = serde_json::to_string(&action.call)
                    .map_err(|error| RepositoryError::Decode(error.to_string()))?;
                sqlx::query(
                    "INSERT INTO pending_action (
                        conversation_id,
                        action_id,
                        call_json,
                        fingerprint,
                        proposed_at,
                        expires_at
                     ) VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(conversation_id) DO UPDATE SET
                        action_id = excluded.action_id,
                        call_json = excluded.call_json,
                        fingerprint = excluded.fingerprint,
                        proposed_at = excluded.proposed_at,
                        expires_at = excluded.expires_at",
                )
                .bind(&id.0)
                .bind(&action.action_id.0)
                .bind(&call_json)
                .bind(&action.fingerprint)
                .bind(action.proposed_at.to_rfc3339())
                .bind(action.expires_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }
            PendingWrite::Clear => {
                sqlx::query("DELETE FROM pending_action WHERE conversation_id = ?")
                    .bind(&id.0)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{role_raw}`")))?;

    let citations_json = row.try_get::<String, _>("citations_json")?;
    let citations: Vec<SourceCitation> = serde_json::from_str(&citations_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid citations_json: {error}")))?;

    Ok(Message {
        role,
        content: row.try_get("content")?,
        citations,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn pending_from_row(row: SqliteRow) -> Result<PendingAction, RepositoryError> {
    let call_json = row.try_get::<String, _>("call_json")?;
    let call: ToolCall = serde_json::from_str(&call_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid call_json: {error}")))?;

    Ok(PendingAction {
        action_id: ActionId(row.try_get("action_id")?),
        call,
        fingerprint: row.try_get("fingerprint")?,
        proposed_at: parse_timestamp("proposed_at", row.try_get("proposed_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}

fn assignment_from_row(row: SqliteRow) -> Result<ExperimentAssignment, RepositoryError> {
    Ok(ExperimentAssignment {
        experiment_id: row.try_get("experiment_id")?,
        variant_id: row.try_get("variant_id")?,
        assigned_at: parse_timestamp("assigned_at", row.try_get("assigned_at")?)?,
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use parley_core::domain::conversation::{
        ConversationId, Message, PendingAction, SourceCitation,
    };
    use parley_core::domain::record::{RecordId, RecordPatch};
    use parley_core::experiments::ExperimentAssignment;
    use parley_core::tools::ToolCall;

    use super::SqlConversationRepository;
    use crate::migrations;
    use crate::repositories::{ConversationRepository, PendingWrite, TurnCommit};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_conversation_repo_round_trips_full_state() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let id = ConversationId("conv-sql-001".to_string());
        let now = parse_ts("2026-02-23T12:00:00Z");

        repo.ensure(&id, now).await.expect("ensure conversation");

        let question = Message::user("where are the backups stored?", now);
        let answer = Message::assistant(
            "Backups live in the offsite vault [S1].",
            vec![SourceCitation {
                source_id: "rec-backups".to_string(),
                excerpt: "backups are copied to the offsite vault nightly".to_string(),
                fused_score: 0.91,
            }],
            now + Duration::seconds(2),
        );
        repo.append_message(&id, question.clone()).await.expect("append question");
        repo.append_message(&id, answer.clone()).await.expect("append answer");

        let pending = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-old".to_string()) },
            now,
            Duration::seconds(300),
        );
        repo.set_pending(&id, pending.clone()).await.expect("set pending");

        let assignment = ExperimentAssignment {
            experiment_id: "prompt-style-ab".to_string(),
            variant_id: "control".to_string(),
            assigned_at: now,
        };
        repo.record_assignment(&id, assignment.clone()).await.expect("record assignment");

        let state = repo.load(&id).await.expect("load").expect("conversation exists");
        assert_eq!(state.id, id);
        assert_eq!(state.messages, vec![question, answer]);
        assert_eq!(state.pending_action, Some(pending));
        assert_eq!(state.assignment, Some(assignment));

        pool.close().await;
    }

    #[tokio::test]
    async fn load_returns_none_for_unknown_conversation() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());

        let state =
            repo.load(&ConversationId("conv-missing".to_string())).await.expect("load");
        assert!(state.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn message_order_follows_append_order() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let id = ConversationId("conv-sql-order".to_string());
        let now = parse_ts("2026-02-23T12:00:00Z");

        repo.ensure(&id, now).await.expect("ensure conversation");
        for n in 0..5 {
            repo.append_message(&id, Message::user(format!("turn {n}"), now))
                .await
                .expect("append");
        }

        let state = repo.load(&id).await.expect("load").expect("conversation exists");
        let contents: Vec<_> =
            state.messages.iter().map(|message| message.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 0", "turn 1", "turn 2", "turn 3", "turn 4"]);

        pool.close().await;
    }

    #[tokio::test]
    async fn new_pending_action_replaces_the_previous_one() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let id = ConversationId("conv-sql-pending".to_string());
        let now = parse_ts("2026-02-23T12:00:00Z");

        repo.ensure(&id, now).await.expect("ensure conversation");

        let first = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-a".to_string()) },
            now,
            Duration::seconds(300),
        );
        let second = PendingAction::new(
            ToolCall::UpdateRecord {
                id: RecordId("rec-b".to_string()),
                patch: RecordPatch {
                    title: Some("amended".to_string()),
                    body: None,
                    tags: None,
                },
            },
            now,
            Duration::seconds(300),
        );

        repo.set_pending(&id, first).await.expect("set first");
        repo.set_pending(&id, second.clone()).await.expect("set second");

        let stored = repo.get_pending(&id).await.expect("get pending");
        assert_eq!(stored, Some(second));

        repo.clear_pending(&id).await.expect("clear pending");
        let cleared = repo.get_pending(&id).await.expect("get cleared");
        assert!(cleared.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn assignment_first_write_wins() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let id = ConversationId("conv-sql-assign".to_string());
        let now = parse_ts("2026-02-23T12:00:00Z");

        repo.ensure(&id, now).await.expect("ensure conversation");

        let original = ExperimentAssignment {
            experiment_id: "prompt-style-ab".to_string(),
            variant_id: "control".to_string(),
            assigned_at: now,
        };
        let rival = ExperimentAssignment {
            experiment_id: "prompt-style-ab".to_string(),
            variant_id: "citation_forward".to_string(),
            assigned_at: now + Duration::seconds(60),
        };

        repo.record_assignment(&id, original.clone()).await.expect("record original");
        repo.record_assignment(&id, rival).await.expect("record rival");

        let state = repo.load(&id).await.expect("load").expect("conversation exists");
        assert_eq!(state.assignment, Some(original));

        pool.close().await;
    }

    #[tokio::test]
    async fn commit_turn_applies_the_whole_batch() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let id = ConversationId("conv-sql-commit".to_string());
        let now = parse_ts("2026-02-23T12:00:00Z");

        // First turn: conversation is created lazily by the commit
        // itself, proposing a pending action on the way out.
        let pending = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-old".to_string()) },
            now,
            Duration::seconds(300),
        );
        let assignment = ExperimentAssignment {
            experiment_id: "prompt-style-ab".to_string(),
            variant_id: "control".to_string(),
            assigned_at: now,
        };
        repo.commit_turn(
            &id,
            TurnCommit {
                user_message: Message::user("delete the old runbook", now),
                assistant_message: Message::assistant(
                    "Confirm deleting rec-old?",
                    vec![],
                    now,
                ),
                assignment: Some(assignment.clone()),
                pending: PendingWrite::Set(pending.clone()),
                committed_at: now,
            },
        )
        .await
        .expect("first commit");

        let state = repo.load(&id).await.expect("load").expect("conversation exists");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.pending_action, Some(pending));
        assert_eq!(state.assignment, Some(assignment.clone()));

        // Second turn clears the slot; the sticky assignment survives
        // the rival value in the commit.
        let later = now + Duration::seconds(30);
        let rival = ExperimentAssignment {
            experiment_id: "prompt-style-ab".to_string(),
            variant_id: "citation_forward".to_string(),
            assigned_at: later,
        };
        repo.commit_turn(
            &id,
            TurnCommit {
                user_message: Message::user("yes", later),
                assistant_message: Message::assistant("Deleted rec-old.", vec![], later),
                assignment: Some(rival),
                pending: PendingWrite::Clear,
                committed_at: later,
            },
        )
        .await
        .expect("second commit");

        let state = repo.load(&id).await.expect("load").expect("conversation exists");
        let contents: Vec<_> =
            state.messages.iter().map(|message| message.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["delete the old runbook", "Confirm deleting rec-old?", "yes", "Deleted rec-old."]
        );
        assert!(state.pending_action.is_none());
        assert_eq!(state.assignment, Some(assignment));

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
