use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::conversation::{ConversationId, TurnId};
use parley_core::metrics::{TokenUsage, TurnMetrics, TurnOutcome};

use super::{MetricsRepository, RepositoryError};
use crate::DbPool;

#[derive(Clone)]
pub struct SqlMetricsRepository {
    pool: DbPool,
}

impl SqlMetricsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MetricsRepository for SqlMetricsRepository {
    async fn record(&self, metrics: TurnMetrics) -> Result<(), RepositoryError> {
        let latency_ms = i64::try_from(metrics.latency_ms).map_err(|_| {
            RepositoryError::Decode(format!("latency_ms out of range: {}", metrics.latency_ms))
        })?;

        sqlx::query(
            "INSERT INTO turn_metrics (
                turn_id,
                conversation_id,
                variant_id,
                model,
                latency_ms,
                prompt_tokens,
                completion_tokens,
                cost_usd,
                outcome,
                recorded_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metrics.turn_id.0)
        .bind(&metrics.conversation_id.0)
        .bind(metrics.variant_id.as_deref())
        .bind(&metrics.model)
        .bind(latency_ms)
        .bind(i64::from(metrics.usage.prompt_tokens))
        .bind(i64::from(metrics.usage.completion_tokens))
        .bind(metrics.cost_usd.to_string())
        .bind(metrics.outcome.as_str())
        .bind(metrics.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<TurnMetrics>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                turn_id,
                conversation_id,
                variant_id,
                model,
                latency_ms,
                prompt_tokens,
                completion_tokens,
                cost_usd,
                outcome,
                recorded_at
             FROM turn_metrics
             WHERE conversation_id = ?
             ORDER BY recorded_at ASC, turn_id ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(metrics_from_row).collect()
    }
}

fn metrics_from_row(row: SqliteRow) -> Result<TurnMetrics, RepositoryError> {
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = TurnOutcome::parse(&outcome_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown turn outcome `{outcome_raw}`")))?;

    let cost_raw = row.try_get::<String, _>("cost_usd")?;
    let cost_usd = cost_raw
        .parse::<Decimal>()
        .map_err(|error| RepositoryError::Decode(format!("invalid cost_usd `{cost_raw}`: {error}")))?;

    Ok(TurnMetrics {
        turn_id: TurnId(row.try_get("turn_id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        variant_id: row.try_get("variant_id")?,
        model: row.try_get("model")?,
        latency_ms: parse_u64("latency_ms", row.try_get("latency_ms")?)?,
        usage: TokenUsage {
            prompt_tokens: parse_u32("prompt_tokens", row.try_get("prompt_tokens")?)?,
            completion_tokens: parse_u32("completion_tokens", row.try_get("completion_tokens")?)?,
        },
        cost_usd,
        outcome,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u64): {value}"
        ))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
