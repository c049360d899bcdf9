use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::record::{Record, RecordId};

use super::{RecordRepository, RepositoryError};
use crate::DbPool;

#[derive(Clone)]
pub struct SqlRecordRepository {
    pool: DbPool,
}

impl SqlRecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RecordRepository for SqlRecordRepository {
    async fn find_by_id(&self, id: &RecordId) -> Result<Option<Record>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, title, body, tags_json, created_at, updated_at
             FROM record
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn list(&self, tag_filter: Option<&str>) -> Result<Vec<Record>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, title, body, tags_json, created_at, updated_at
             FROM record
             ORDER BY updated_at DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        // Tags live in a JSON column; filtering happens after decode so
        // matching stays exact rather than substring-based.
        let records = match tag_filter {
            Some(tag) => records
                .into_iter()
                .filter(|record| record.tags.iter().any(|candidate| candidate == tag))
                .collect(),
            None => records,
        };

        Ok(records)
    }

    async fn save(&self, record: Record) -> Result<(), RepositoryError> {
        let tags_json = serde_json::to_string(&record.tags)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO record (id, title, body, tags_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                body = excluded.body,
                tags_json = excluded.tags_json,
                updated_at = excluded.updated_at",
        )
        .bind(&record.id.0)
        .bind(&record.title)
        .bind(&record.body)
        .bind(&tags_json)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM record WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn record_from_row(row: SqliteRow) -> Result<Record, RepositoryError> {
    let tags_json = row.try_get::<String, _>("tags_json")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid tags_json: {error}")))?;

    Ok(Record {
        id: RecordId(row.try_get("id")?),
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        tags,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
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

    use parley_core::domain::record::{Record, RecordId};

    use super::SqlRecordRepository;
    use crate::migrations;
    use crate::repositories::RecordRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_record_repo_round_trip_and_delete() {
        let pool = setup_pool().await;
        let repo = SqlRecordRepository::new(pool.clone());
        let record = sample_record("rec-sql-001", "Backup runbook", &["ops", "runbook"]);

        repo.save(record.clone()).await.expect("save record");

        let found = repo.find_by_id(&record.id).await.expect("find record");
        assert_eq!(found, Some(record.clone()));

        let removed = repo.delete(&record.id).await.expect("delete record");
        assert!(removed);

        let removed_again = repo.delete(&record.id).await.expect("delete missing record");
        assert!(!removed_again);

        pool.close().await;
    }

    #[tokio::test]
    async fn save_overwrites_existing_record() {
        let pool = setup_pool().await;
        let repo = SqlRecordRepository::new(pool.clone());
        let mut record = sample_record("rec-sql-002", "On-call rotation", &["ops"]);

        repo.save(record.clone()).await.expect("save record");

        record.body = "rotation moved to weekly handoffs".to_string();
        record.updated_at = record.updated_at + Duration::seconds(60);
        repo.save(record.clone()).await.expect("update record");

        let found = repo.find_by_id(&record.id).await.expect("find record");
        assert_eq!(found, Some(record));

        pool.close().await;
    }

    #[tokio::test]
    async fn list_filters_by_exact_tag() {
        let pool = setup_pool().await;
        let repo = SqlRecordRepository::new(pool.clone());

        repo.save(sample_record("rec-sql-a", "Backup runbook", &["ops", "runbook"]))
            .await
            .expect("save a");
        repo.save(sample_record("rec-sql-b", "Release checklist", &["release"]))
            .await
            .expect("save b");
        repo.save(sample_record("rec-sql-c", "Ops escalation", &["ops"]))
            .await
            .expect("save c");

        let all = repo.list(None).await.expect("list all");
        assert_eq!(all.len(), 3);

        let ops_only = repo.list(Some("ops")).await.expect("list ops");
        let mut ids: Vec<_> = ops_only.iter().map(|record| record.id.0.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["rec-sql-a", "rec-sql-c"]);

        // `op` is a prefix of `ops`, not a tag.
        let partial = repo.list(Some("op")).await.expect("list partial");
        assert!(partial.is_empty());

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_record(id: &str, title: &str, tags: &[&str]) -> Record {
        let now = parse_ts("2026-02-23T12:00:00Z");
        Record {
            id: RecordId(id.to_string()),
            title: title.to_string(),
            body: format!("{title} body text"),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
