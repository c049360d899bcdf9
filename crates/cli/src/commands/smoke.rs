//! Scripted end-to-end turn scenarios: in-memory stores, fixed search
//! legs, and a scripted model, so `smoke` exercises the full turn
//! pipeline without a database file or a network.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, ensure};
use chrono::{Duration, Utc};
use serde::Serialize;

use crate::commands::CommandResult;
use parley_agent::{ScriptedLlmClient, StaticSearchIndex, TurnRequest, WorkflowOrchestrator};
use parley_core::config::{AppConfig, LoadOptions};
use parley_core::domain::conversation::{ConversationId, PendingAction};
use parley_core::domain::record::{Record, RecordId};
use parley_core::metrics::TurnOutcome;
use parley_core::retrieval::SearchHit;
use parley_core::tools::ToolCall;
use parley_db::repositories::{
    ConversationRepository, InMemoryConversationRepository, InMemoryMetricsRepository,
    InMemoryRecordRepository, RecordRepository,
};

const BACKUPS_EXCERPT: &str = "Backups run nightly at 2 am and copies are kept for 30 days.";
const DELETE_DIRECTIVE: &str = r#"@tool {"tool": "delete_record", "id": "rec-backups"}"#;

const SCENARIOS: [&str; 4] =
    ["turn_with_citations", "confirm_then_execute", "cancel_keeps_record", "expired_confirmation"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, mut config)) => {
            // Scenario scripts are deterministic; variant-assigned
            // prompts are not.
            config.experiment.variants.clear();
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            for name in SCENARIOS {
                checks.push(skipped(name));
            }
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(SmokeCheck {
                name: SCENARIOS[0],
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            for name in SCENARIOS.into_iter().skip(1) {
                checks.push(skipped(name));
            }
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    run_scenario(&runtime, &mut checks, SCENARIOS[0], turn_with_citations(&config));
    run_scenario(&runtime, &mut checks, SCENARIOS[1], confirm_then_execute(&config));
    run_scenario(&runtime, &mut checks, SCENARIOS[2], cancel_keeps_record(&config));
    run_scenario(&runtime, &mut checks, SCENARIOS[3], expired_confirmation(&config));

    finalize_report(checks, started.elapsed().as_millis() as u64)
}

/// A question answered straight from the scripted draft must ship with
/// citations from the fused ranking.
async fn turn_with_citations(config: &AppConfig) -> anyhow::Result<String> {
    let h = harness(config, &[BACKUPS_EXCERPT]).await?;

    let response = h.orchestrator.handle_turn(turn("smoke-answer", "When do backups run?")).await?;

    ensure!(
        response.outcome == TurnOutcome::Answered,
        "expected an answered turn, got {:?}",
        response.outcome
    );
    ensure!(!response.citations.is_empty(), "grounded answer shipped without citations");
    ensure!(
        response.answer_text == BACKUPS_EXCERPT,
        "answer text diverged from the scripted draft: {}",
        response.answer_text
    );
    Ok(format!("answered with {} citation(s)", response.citations.len()))
}

/// A destructive directive parks; only the affirmative reply runs it.
async fn confirm_then_execute(config: &AppConfig) -> anyhow::Result<String> {
    let h = harness(config, &[DELETE_DIRECTIVE]).await?;

    let parked =
        h.orchestrator.handle_turn(turn("smoke-confirm", "Delete the backup schedule record")).await?;
    ensure!(
        parked.outcome == TurnOutcome::AwaitingConfirmation,
        "expected a parked call, got {:?}",
        parked.outcome
    );
    ensure!(parked.pending_confirmation.is_some(), "no pending confirmation was surfaced");
    ensure!(
        h.records.find_by_id(&record_id()).await?.is_some(),
        "record was removed before any confirmation"
    );

    let confirmed = h.orchestrator.handle_turn(turn("smoke-confirm", affirmative(config))).await?;
    ensure!(
        confirmed.outcome == TurnOutcome::ActionExecuted,
        "expected the call to execute, got {:?}",
        confirmed.outcome
    );
    ensure!(
        h.records.find_by_id(&record_id()).await?.is_none(),
        "confirmed delete left the record in place"
    );

    let state = h
        .conversations
        .load(&ConversationId("smoke-confirm".to_string()))
        .await?
        .ok_or_else(|| anyhow!("conversation vanished after confirmation"))?;
    ensure!(state.pending_action.is_none(), "executed call left its pending slot occupied");
    Ok("destructive call ran only after an explicit confirmation".to_string())
}

/// A negative reply discards the parked call and keeps the record.
async fn cancel_keeps_record(config: &AppConfig) -> anyhow::Result<String> {
    let h = harness(config, &[DELETE_DIRECTIVE]).await?;

    h.orchestrator.handle_turn(turn("smoke-cancel", "Delete the backup schedule record")).await?;
    let cancelled = h.orchestrator.handle_turn(turn("smoke-cancel", negative(config))).await?;

    ensure!(
        cancelled.outcome == TurnOutcome::ActionCancelled,
        "expected a cancelled call, got {:?}",
        cancelled.outcome
    );
    ensure!(
        h.records.find_by_id(&record_id()).await?.is_some(),
        "cancelled delete still removed the record"
    );
    Ok("negative reply cancelled the parked call and kept the record".to_string())
}

/// Confirming after the ttl elapsed must refuse the call and clear the
/// slot.
async fn expired_confirmation(config: &AppConfig) -> anyhow::Result<String> {
    let h = harness(config, &[]).await?;
    let id = ConversationId("smoke-expired".to_string());

    let proposed_at = Utc::now() - config.pending_ttl() - Duration::seconds(60);
    h.conversations.ensure(&id, proposed_at).await?;
    h.conversations
        .set_pending(
            &id,
            PendingAction::new(
                ToolCall::DeleteRecord { id: record_id() },
                proposed_at,
                config.pending_ttl(),
            ),
        )
        .await?;

    let refused = h.orchestrator.handle_turn(turn("smoke-expired", affirmative(config))).await?;

    ensure!(
        refused.outcome == TurnOutcome::Degraded,
        "expected a degraded refusal, got {:?}",
        refused.outcome
    );
    ensure!(
        h.records.find_by_id(&record_id()).await?.is_some(),
        "expired confirmation still executed the call"
    );
    let state = h
        .conversations
        .load(&id)
        .await?
        .ok_or_else(|| anyhow!("conversation vanished after the refusal"))?;
    ensure!(state.pending_action.is_none(), "expired slot was not cleared");
    Ok("stale confirmation was refused and the slot cleared".to_string())
}

type SmokeOrchestrator = WorkflowOrchestrator<
    InMemoryConversationRepository,
    InMemoryRecordRepository,
    InMemoryMetricsRepository,
    StaticSearchIndex,
    Arc<ScriptedLlmClient>,
>;

struct SmokeHarness {
    orchestrator: SmokeOrchestrator,
    conversations: InMemoryConversationRepository,
    records: InMemoryRecordRepository,
}

async fn harness(config: &AppConfig, script: &[&str]) -> anyhow::Result<SmokeHarness> {
    let now = Utc::now();
    let conversations = InMemoryConversationRepository::default();
    let records = InMemoryRecordRepository::with_records(vec![Record {
        id: record_id(),
        title: "Backup schedule".to_string(),
        body: BACKUPS_EXCERPT.to_string(),
        tags: vec!["ops".to_string()],
        created_at: now,
        updated_at: now,
    }])
    .await;
    let metrics = InMemoryMetricsRepository::default();
    let index = StaticSearchIndex::new(
        vec![SearchHit {
            source_id: "rec-backups".to_string(),
            excerpt: BACKUPS_EXCERPT.to_string(),
            score: 0.9,
        }],
        vec![SearchHit {
            source_id: "rec-backups".to_string(),
            excerpt: BACKUPS_EXCERPT.to_string(),
            score: 0.8,
        }],
    );
    let llm = Arc::new(ScriptedLlmClient::answering(script));

    let orchestrator = WorkflowOrchestrator::new(
        config,
        conversations.clone(),
        records.clone(),
        metrics,
        index,
        llm,
    )?;
    Ok(SmokeHarness { orchestrator, conversations, records })
}

fn record_id() -> RecordId {
    RecordId("rec-backups".to_string())
}

fn turn(conversation: &str, text: &str) -> TurnRequest {
    TurnRequest {
        conversation_id: ConversationId(conversation.to_string()),
        message_text: text.to_string(),
        context_hints: Vec::new(),
    }
}

/// First configured affirmative reply; validation guarantees one.
fn affirmative(config: &AppConfig) -> &str {
    config.confirmation.affirmative_replies.first().map(String::as_str).unwrap_or("yes")
}

fn negative(config: &AppConfig) -> &str {
    config.confirmation.negative_replies.first().map(String::as_str).unwrap_or("no")
}

fn run_scenario(
    runtime: &tokio::runtime::Runtime,
    checks: &mut Vec<SmokeCheck>,
    name: &'static str,
    scenario: impl std::future::Future<Output = anyhow::Result<String>>,
) {
    let started = Instant::now();
    let check = match runtime.block_on(scenario) {
        Ok(message) => SmokeCheck {
            name,
            status: SmokeStatus::Pass,
            elapsed_ms: started.elapsed().as_millis() as u64,
            message,
        },
        Err(error) => SmokeCheck {
            name,
            status: SmokeStatus::Fail,
            elapsed_ms: started.elapsed().as_millis() as u64,
            message: format!("{error:#}"),
        },
    };
    checks.push(check);
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((started.elapsed().as_millis() as u64, value)),
        Err(error) => Err((started.elapsed().as_millis() as u64, error)),
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due to a previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
