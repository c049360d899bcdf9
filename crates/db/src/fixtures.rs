use crate::connection::DbPool;
use crate::repositories::RepositoryError;
use sqlx::Executor;

/// Canonical demo corpus and verification contract for the knowledge
/// base the assistant answers from.
const SEED_RECORDS: &[SeedRecordContract] = &[
    SeedRecordContract {
        record_id: "rec-backups",
        title: "Backup and restore runbook",
        tags: &["ops", "runbook"],
        body_keyword: "offsite vault",
    },
    SeedRecordContract {
        record_id: "rec-oncall",
        title: "On-call rotation",
        tags: &["ops"],
        body_keyword: "hands off every Monday",
    },
    SeedRecordContract {
        record_id: "rec-release",
        title: "Release checklist",
        tags: &["release", "runbook"],
        body_keyword: "bakes in staging for 24 hours",
    },
    SeedRecordContract {
        record_id: "rec-incident",
        title: "Incident severity matrix",
        tags: &["ops", "incident"],
        body_keyword: "within 5 minutes",
    },
    SeedRecordContract {
        record_id: "rec-vpn",
        title: "VPN access",
        tags: &["it"],
        body_keyword: "one business day",
    },
    SeedRecordContract {
        record_id: "rec-styleguide",
        title: "Documentation style guide",
        tags: &["docs"],
        body_keyword: "sentence case headings",
    },
    SeedRecordContract {
        record_id: "rec-retro",
        title: "Retrospective template",
        tags: &["process"],
        body_keyword: "action items with owners",
    },
    SeedRecordContract {
        record_id: "rec-deploy-freeze",
        title: "Deploy freeze windows",
        tags: &["release", "ops"],
        body_keyword: "last week of each quarter",
    },
];

/// Demo corpus for smoke runs and retrieval tests.
///
/// The records are small but deliberately overlapping: several share
/// the `ops` tag and several mention schedules, so fused search has
/// real ranking work to do.
pub struct DemoCorpus;

impl DemoCorpus {
    /// SQL fixture content for the demo corpus.
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_corpus.sql");

    /// Expected records that `load` writes and `verify` checks.
    pub fn contract() -> &'static [SeedRecordContract] {
        SEED_RECORDS
    }

    /// Load the demo corpus. Safe to run repeatedly; rows are replaced
    /// wholesale.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let records_seeded = SEED_RECORDS
            .iter()
            .map(|record| RecordSeedInfo { record_id: record.record_id, title: record.title })
            .collect::<Vec<_>>();

        Ok(SeedResult { records_seeded })
    }

    /// Verify that the corpus exists and matches the contract.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let quoted_ids = sql_array_from_ids(&seed_record_ids());
        let expected_total = SEED_RECORDS.len() as i64;
        let existing_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM record WHERE id IN {quoted_ids}"
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("record-count".to_string(), existing_count == expected_total));

        for record in SEED_RECORDS {
            let present: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM record WHERE id = ?1 AND title = ?2)",
            )
            .bind(record.record_id)
            .bind(record.title)
            .fetch_one(pool)
            .await?;
            checks.push((format!("{}-present", record.record_id), present == 1));

            let tags_json: Option<String> =
                sqlx::query_scalar("SELECT tags_json FROM record WHERE id = ?1")
                    .bind(record.record_id)
                    .fetch_optional(pool)
                    .await?;
            let tags_match = match tags_json {
                Some(raw) => {
                    let parsed: Vec<String> = serde_json::from_str(&raw)
                        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
                    parsed.len() == record.tags.len()
                        && parsed.iter().zip(record.tags).all(|(a, b)| a == b)
                }
                None => false,
            };
            checks.push((format!("{}-tags", record.record_id), tags_match));

            let keyword_present: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM record WHERE id = ?1 AND body LIKE ?2)",
            )
            .bind(record.record_id)
            .bind(format!("%{}%", record.body_keyword))
            .fetch_one(pool)
            .await?;
            checks.push((format!("{}-body", record.record_id), keyword_present == 1));
        }

        let all_present = checks.iter().all(|(_, exists)| *exists);
        Ok(VerificationResult { all_present, checks })
    }

    /// Remove the demo corpus from a test database.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let quoted_ids = sql_array_from_ids(&seed_record_ids());

        sqlx::query(&format!("DELETE FROM record WHERE id IN {quoted_ids}"))
            .execute(pool)
            .await?;

        Ok(())
    }
}

/// Expected shape of one seeded record.
#[derive(Debug, Clone, Copy)]
pub struct SeedRecordContract {
    pub record_id: &'static str,
    pub title: &'static str,
    pub tags: &'static [&'static str],
    pub body_keyword: &'static str,
}

fn seed_record_ids() -> Vec<&'static str> {
    SEED_RECORDS.iter().map(|record| record.record_id).collect()
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug)]
pub struct SeedResult {
    pub records_seeded: Vec<RecordSeedInfo>,
}

#[derive(Debug)]
pub struct RecordSeedInfo {
    pub record_id: &'static str,
    pub title: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(String, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_with_settings, migrations};

    #[test]
    fn sql_fixture_is_valid() {
        assert!(!DemoCorpus::SQL.is_empty());
    }

    #[tokio::test]
    async fn verify_seed_contract_and_idempotency() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect to test database");

        migrations::run_pending(&pool).await.expect("run migrations");

        let first = DemoCorpus::load(&pool).await.expect("load demo corpus");
        let first_verification = DemoCorpus::verify(&pool).await.expect("verify demo corpus");
        assert!(first_verification.all_present);
        assert_eq!(first.records_seeded.len(), 8);

        let second = DemoCorpus::load(&pool).await.expect("reload demo corpus");
        let second_verification = DemoCorpus::verify(&pool).await.expect("re-verify demo corpus");
        assert!(second_verification.all_present);
        assert_eq!(second.records_seeded.len(), 8);
        assert_eq!(first_verification.checks, second_verification.checks);
    }

    #[tokio::test]
    async fn corpus_spans_multiple_tags_for_filtered_listing() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect to test database");

        migrations::run_pending(&pool).await.expect("run migrations");
        DemoCorpus::load(&pool).await.expect("load demo corpus");

        let ops_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM record, json_each(record.tags_json)
             WHERE json_each.value = 'ops'",
        )
        .fetch_one(&pool)
        .await
        .expect("count ops-tagged records");
        assert_eq!(ops_count, 4);

        let distinct_tags: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT json_each.value) FROM record, json_each(record.tags_json)",
        )
        .fetch_one(&pool)
        .await
        .expect("count distinct tags");
        assert!(distinct_tags >= 5, "corpus should span several tags, found {distinct_tags}");
    }

    #[tokio::test]
    async fn clean_removes_all_seeded_records() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect to test database");

        migrations::run_pending(&pool).await.expect("run migrations");
        DemoCorpus::load(&pool).await.expect("load demo corpus");
        DemoCorpus::clean(&pool).await.expect("clean demo corpus");

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM record")
            .fetch_one(&pool)
            .await
            .expect("count remaining records");
        assert_eq!(remaining, 0);
    }
}
