//! The turn pipeline. One [`WorkflowOrchestrator::handle_turn`] call
//! carries a user message through pending-action resolution, retrieval,
//! generation, validation, and a single finalize commit.
//!
//! Mutations are buffered on the in-flight turn and reach the store
//! only in the finalize step. A turn that fails mid-flight leaves the
//! conversation exactly as it found it, so the caller can safely
//! resend the same message.

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use parley_core::config::AppConfig;
use parley_core::domain::conversation::{
    ActionId, ConversationId, ConversationState, Message, PendingAction, SourceCitation, TurnId,
};
use parley_core::errors::{ApplicationError, DomainError};
use parley_core::experiments::{ExperimentAssignment, PromptStyle, VariantSelector};
use parley_core::flows::{TurnEvent, TurnFlowContext, TurnFlowEngine, TurnPhase};
use parley_core::metrics::{MetricsTracker, TokenUsage, TurnOutcome};
use parley_core::reflection::{ReflectionOutcome, ReflectionValidator, ReflectionVerdict};
use parley_core::retrieval::RetrievalResult;
use parley_db::repositories::{
    ConversationRepository, MetricsRepository, PendingWrite, RecordRepository,
    SqlConversationRepository, SqlMetricsRepository, SqlRecordRepository, TurnCommit,
};

use crate::llm::{CompletionRequest, HttpLlmClient, LlmClient};
use crate::prompts::{GenerationPrompt, PromptError, PromptRenderer, SYSTEM_PROMPT};
use crate::retrieval::{CorpusSearchIndex, RetrievalFusionEngine, SearchIndex};
use crate::session::ConversationGate;
use crate::tools::{parse_draft, DraftContent, ReplyClassifier, ReplyDisposition, ToolExecutor};

const APOLOGY_ANSWER: &str =
    "Something went wrong while preparing your answer. Nothing was changed; please try again.";
const CANNOT_VERIFY_ANSWER: &str = "I could not verify an answer to that from the records I can \
see, so I'd rather not guess. Try rephrasing the question, or point me at a specific record.";
const DEGRADED_CAVEAT: &str = "Note: this answer did not pass every quality check.";
const STALE_CONFIRMATION_ANSWER: &str = "That reply arrived after the proposed action expired, \
so I have not run it. Please restate what you'd like me to do.";

/// One user message addressed to a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub message_text: String,
    /// Extra retrieval terms from the caller, such as a channel topic.
    #[serde(default)]
    pub context_hints: Vec<String>,
}

/// Surfaced when a turn parks a destructive call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PendingConfirmationNotice {
    pub action_id: ActionId,
    pub tool_name: String,
    pub summary: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything a caller gets back from one turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnResponse {
    pub turn_id: TurnId,
    pub conversation_id: ConversationId,
    pub answer_text: String,
    pub citations: Vec<SourceCitation>,
    pub pending_confirmation: Option<PendingConfirmationNotice>,
    pub outcome: TurnOutcome,
    pub variant_id: Option<String>,
}

/// Buffered state of the turn in flight. Nothing here touches the
/// store until the commit step.
struct TurnContext {
    turn_id: TurnId,
    conversation_id: ConversationId,
    context_hints: Vec<String>,
    state: ConversationState,
    now: DateTime<Utc>,
    model: String,
    prompt_style: PromptStyle,
    alpha_override: Option<f64>,
    variant_id: Option<String>,
    assignment_write: Option<ExperimentAssignment>,
    retrieval: Vec<RetrievalResult>,
    retrieval_degraded: bool,
    usage: TokenUsage,
    answer: String,
    citations: Vec<SourceCitation>,
    pending_write: PendingWrite,
    pending_notice: Option<PendingConfirmationNotice>,
    outcome: TurnOutcome,
    persist: bool,
}

impl TurnContext {
    fn new(
        turn_id: TurnId,
        request: TurnRequest,
        state: ConversationState,
        now: DateTime<Utc>,
        model: String,
    ) -> Self {
        Self {
            turn_id,
            conversation_id: request.conversation_id,
            context_hints: request.context_hints,
            state,
            now,
            model,
            prompt_style: PromptStyle::default(),
            alpha_override: None,
            variant_id: None,
            assignment_write: None,
            retrieval: Vec::new(),
            retrieval_degraded: false,
            usage: TokenUsage::default(),
            answer: String::new(),
            citations: Vec::new(),
            pending_write: PendingWrite::Keep,
            pending_notice: None,
            outcome: TurnOutcome::Answered,
            persist: true,
        }
    }
}

/// Drives complete turns against pluggable storage, search, and model
/// backends. The defaults are the production wiring.
pub struct WorkflowOrchestrator<
    C = SqlConversationRepository,
    R = SqlRecordRepository,
    M = SqlMetricsRepository,
    I = CorpusSearchIndex<SqlRecordRepository>,
    L = HttpLlmClient,
> {
    conversations: C,
    executor: ToolExecutor<R>,
    metrics: M,
    fusion: RetrievalFusionEngine<I>,
    llm: L,
    renderer: PromptRenderer,
    validator: ReflectionValidator,
    classifier: ReplyClassifier,
    selector: Option<VariantSelector>,
    tracker: MetricsTracker,
    gate: ConversationGate,
    flow: TurnFlowEngine,
    default_model: String,
    pending_ttl: Duration,
    pending_ttl_seconds: u64,
    max_refine_attempts: u32,
}

impl<C, R, M, I, L> WorkflowOrchestrator<C, R, M, I, L>
where
    C: ConversationRepository,
    R: RecordRepository,
    M: MetricsRepository,
    I: SearchIndex,
    L: LlmClient,
{
    pub fn new(
        config: &AppConfig,
        conversations: C,
        records: R,
        metrics: M,
        index: I,
        llm: L,
    ) -> Result<Self, ApplicationError> {
        let renderer = PromptRenderer::new(&config.style_policy()).map_err(configuration)?;

        Ok(Self {
            conversations,
            executor: ToolExecutor::new(records),
            metrics,
            fusion: RetrievalFusionEngine::new(index, &config.retrieval),
            llm,
            renderer,
            validator: ReflectionValidator::new(config.style_policy()),
            classifier: ReplyClassifier::from_config(&config.confirmation),
            selector: config.experiment_definition().map(VariantSelector::new),
            tracker: MetricsTracker::new(config.pricing.models.clone(), config.pricing.default.clone()),
            gate: ConversationGate::new(),
            flow: TurnFlowEngine::default(),
            default_model: config.llm.model.clone(),
            pending_ttl: config.pending_ttl(),
            pending_ttl_seconds: config.confirmation.ttl_seconds,
            max_refine_attempts: config.reflection.max_refine_attempts,
        })
    }

    /// Runs one complete turn. Turns addressed to the same conversation
    /// are strictly serialized in arrival order.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse, ApplicationError> {
        let message_text = request.message_text.trim().to_string();
        if message_text.is_empty() {
            return Err(ApplicationError::Domain(DomainError::EmptyTurnText));
        }

        let _guard = self.gate.acquire(&request.conversation_id).await;
        let started = Instant::now();
        let now = Utc::now();
        let turn_id = TurnId::generate();

        info!(
            event_name = "agent.turn.start",
            conversation_id = %request.conversation_id.0,
            turn_id = %turn_id.0,
            "turn started"
        );

        let state = self
            .conversations
            .load(&request.conversation_id)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?
            .unwrap_or_else(|| ConversationState::new(request.conversation_id.clone(), now));

        let mut turn = TurnContext::new(turn_id, request, state, now, self.default_model.clone());
        self.pin_variant(&mut turn);

        let mut result = self.walk_phases(&mut turn, &message_text).await;
        if result.is_ok() {
            if turn.outcome == TurnOutcome::Answered && turn.retrieval_degraded {
                turn.outcome = TurnOutcome::Degraded;
            }
            if turn.persist {
                result = self.commit(&turn, &message_text).await;
            }
        }

        let latency_ms = elapsed_ms(started);
        if let Err(error) = &result {
            turn.outcome = TurnOutcome::Failed;
            warn!(
                event_name = "agent.turn.failed",
                conversation_id = %turn.conversation_id.0,
                turn_id = %turn.turn_id.0,
                error = %error,
                latency_ms,
                "turn failed"
            );
        }
        self.record_metrics(&turn, latency_ms).await;

        result.map(|()| {
            info!(
                event_name = "agent.turn.finalized",
                conversation_id = %turn.conversation_id.0,
                turn_id = %turn.turn_id.0,
                outcome = turn.outcome.as_str(),
                variant = turn.variant_id.as_deref().unwrap_or("none"),
                persisted = turn.persist,
                latency_ms,
                "turn finalized"
            );
            self.response_from(&turn)
        })
    }

    /// Resolves the variant for this conversation, assigning one on the
    /// first turn. The assignment is buffered and becomes durable only
    /// when the turn commits.
    fn pin_variant(&self, turn: &mut TurnContext) {
        let Some(selector) = &self.selector else { return };

        let assignment = match &turn.state.assignment {
            Some(existing) => existing.clone(),
            None => match selector.assign(&turn.conversation_id, turn.now) {
                Ok(assignment) => {
                    turn.assignment_write = Some(assignment.clone());
                    assignment
                }
                Err(error) => {
                    warn!(
                        event_name = "agent.experiment.assignment_failed",
                        conversation_id = %turn.conversation_id.0,
                        error = %error,
                        "running the turn on default parameters"
                    );
                    return;
                }
            },
        };

        turn.variant_id = Some(assignment.variant_id.clone());
        // A variant that has since left the config keeps its id in the
        // metrics but contributes no parameters.
        if let Some(params) = selector.params_for(&assignment.variant_id) {
            if let Some(model) = &params.model {
                turn.model = model.clone();
            }
            turn.prompt_style = params.prompt_style;
            turn.alpha_override = params.alpha_override;
        }
    }

    async fn walk_phases(
        &self,
        turn: &mut TurnContext,
        message_text: &str,
    ) -> Result<(), ApplicationError> {
        let now = turn.now;
        let mut phase = self.flow.initial_phase();
        let has_live_pending = turn.state.live_pending_action(now).is_some();
        let mut budget = self.max_refine_attempts;

        if let Some(pending) = turn.state.live_pending_action(now).cloned() {
            match self.classifier.classify(message_text) {
                ReplyDisposition::Affirmative => {
                    self.step(&mut phase, TurnEvent::ConfirmationReceived, has_live_pending, budget)?;
                    let outcome = self.executor.execute_confirmed(&pending.call, now).await?;
                    turn.pending_write = PendingWrite::Clear;
                    turn.answer = outcome.render_answer();
                    if outcome.is_rejection() {
                        turn.outcome = TurnOutcome::Degraded;
                        warn!(
                            event_name = "agent.tool.rejected",
                            conversation_id = %turn.conversation_id.0,
                            turn_id = %turn.turn_id.0,
                            tool = pending.call.name(),
                            action_id = %pending.action_id.0,
                            "confirmed call was refused by the store"
                        );
                    } else {
                        turn.outcome = TurnOutcome::ActionExecuted;
                        info!(
                            event_name = "agent.tool.executed",
                            conversation_id = %turn.conversation_id.0,
                            turn_id = %turn.turn_id.0,
                            tool = pending.call.name(),
                            action_id = %pending.action_id.0,
                            confirmed = true,
                            "confirmed call executed"
                        );
                    }
                    return Ok(());
                }
                ReplyDisposition::Negative => {
                    self.step(&mut phase, TurnEvent::CancellationReceived, has_live_pending, budget)?;
                    turn.pending_write = PendingWrite::Clear;
                    turn.outcome = TurnOutcome::ActionCancelled;
                    turn.answer = format!("Cancelled. I will not {}.", pending.call.summary());
                    info!(
                        event_name = "agent.pending.cancelled",
                        conversation_id = %turn.conversation_id.0,
                        turn_id = %turn.turn_id.0,
                        action_id = %pending.action_id.0,
                        "pending action cancelled"
                    );
                    return Ok(());
                }
                // Anything else leaves the proposal parked and is
                // handled as a fresh request.
                ReplyDisposition::Unrelated => {}
            }
        } else if let Some(expired) = turn.state.pending_action.clone() {
            // The slot holds only an expired proposal. It is cleared
            // whatever this turn turns out to be.
            turn.pending_write = PendingWrite::Clear;
            if self.classifier.classify(message_text) != ReplyDisposition::Unrelated {
                warn!(
                    event_name = "agent.pending.expired",
                    conversation_id = %turn.conversation_id.0,
                    turn_id = %turn.turn_id.0,
                    action_id = %expired.action_id.0,
                    expired_at = %expired.expires_at,
                    "confirmation arrived after expiry"
                );
                self.step(&mut phase, TurnEvent::FailureDetected, has_live_pending, budget)?;
                turn.outcome = TurnOutcome::Degraded;
                turn.answer = STALE_CONFIRMATION_ANSWER.to_string();
                return Ok(());
            }
        }

        self.step(&mut phase, TurnEvent::FreshRequestDetected, has_live_pending, budget)?;

        let query = compose_query(message_text, &turn.context_hints);
        let retrieval = self.fusion.retrieve(&query, turn.alpha_override).await;
        turn.retrieval_degraded = retrieval.degraded;
        turn.retrieval = retrieval.results;

        self.step(&mut phase, TurnEvent::ContextAssembled, has_live_pending, budget)?;

        let mut critique: Vec<String> = Vec::new();
        let mut strict_grounding = false;
        let mut rewrite_used = false;

        loop {
            let prompt = self
                .renderer
                .generation_prompt(&GenerationPrompt {
                    question: message_text,
                    context: &turn.retrieval,
                    style: turn.prompt_style,
                    critique: &critique,
                    strict_grounding,
                })
                .map_err(configuration)?;

            let draft = match self.complete_draft(turn, &prompt).await {
                Ok(draft) => draft,
                Err(error) => {
                    warn!(
                        event_name = "agent.llm.failed",
                        conversation_id = %turn.conversation_id.0,
                        turn_id = %turn.turn_id.0,
                        error = %error,
                        "model call failed; turn ends unpersisted"
                    );
                    self.step(&mut phase, TurnEvent::FailureDetected, has_live_pending, budget)?;
                    turn.outcome = TurnOutcome::Failed;
                    turn.answer = APOLOGY_ANSWER.to_string();
                    turn.citations.clear();
                    turn.pending_write = PendingWrite::Keep;
                    turn.persist = false;
                    return Ok(());
                }
            };

            match parse_draft(&draft) {
                Ok(DraftContent::Tool(call)) if call.is_destructive() => {
                    self.step(&mut phase, TurnEvent::DestructiveCallProposed, has_live_pending, budget)?;
                    let action = PendingAction::new(call, now, self.pending_ttl);
                    let question = self
                        .renderer
                        .confirmation_question(&action.call, self.pending_ttl_seconds)
                        .map_err(configuration)?;
                    info!(
                        event_name = "agent.pending.proposed",
                        conversation_id = %turn.conversation_id.0,
                        turn_id = %turn.turn_id.0,
                        tool = action.call.name(),
                        action_id = %action.action_id.0,
                        expires_at = %action.expires_at,
                        "destructive call parked for confirmation"
                    );
                    turn.pending_notice = Some(PendingConfirmationNotice {
                        action_id: action.action_id.clone(),
                        tool_name: action.call.name().to_string(),
                        summary: action.call.summary(),
                        expires_at: action.expires_at,
                    });
                    turn.pending_write = PendingWrite::Set(action);
                    turn.answer = question;
                    turn.outcome = TurnOutcome::AwaitingConfirmation;
                    self.step(
                        &mut phase,
                        TurnEvent::ConfirmationQuestionComposed,
                        has_live_pending,
                        budget,
                    )?;
                    return Ok(());
                }
                Ok(DraftContent::Tool(call)) => {
                    let outcome = self.executor.execute_immediate(&call, now).await?;
                    info!(
                        event_name = "agent.tool.executed",
                        conversation_id = %turn.conversation_id.0,
                        turn_id = %turn.turn_id.0,
                        tool = call.name(),
                        confirmed = false,
                        "read-side call executed inline"
                    );
                    // The listing is a deterministic view of store
                    // state; the claim validator is for model prose.
                    self.step(&mut phase, TurnEvent::DraftCompleted, has_live_pending, budget)?;
                    turn.answer = outcome.render_answer();
                    if outcome.is_rejection() {
                        turn.outcome = TurnOutcome::Degraded;
                    }
                    self.step(&mut phase, TurnEvent::DraftAccepted, has_live_pending, budget)?;
                    return Ok(());
                }
                Err(defect) => {
                    self.step(&mut phase, TurnEvent::DraftCompleted, has_live_pending, budget)?;
                    if budget == 0 {
                        turn.answer = CANNOT_VERIFY_ANSWER.to_string();
                        turn.outcome = TurnOutcome::Degraded;
                        self.step(&mut phase, TurnEvent::DraftAccepted, has_live_pending, budget)?;
                        return Ok(());
                    }
                    critique = vec![format!("the tool directive was invalid: {defect}")];
                    self.step(&mut phase, TurnEvent::RegenerationRequested, has_live_pending, budget)?;
                    budget -= 1;
                }
                Ok(DraftContent::Answer(answer)) => {
                    self.step(&mut phase, TurnEvent::DraftCompleted, has_live_pending, budget)?;
                    let verdict = self.validator.evaluate(&answer, &turn.retrieval);
                    info!(
                        event_name = "agent.reflection.verdict",
                        conversation_id = %turn.conversation_id.0,
                        turn_id = %turn.turn_id.0,
                        verdict = verdict.outcome.as_str(),
                        violations = verdict.violations.len(),
                        budget_left = budget,
                        "draft evaluated"
                    );
                    match verdict.outcome {
                        ReflectionOutcome::Pass => {
                            turn.answer = answer;
                            turn.citations = grounded_citations(&turn.retrieval);
                            self.step(&mut phase, TurnEvent::DraftAccepted, has_live_pending, budget)?;
                            return Ok(());
                        }
                        ReflectionOutcome::Refine if budget > 0 => {
                            critique = violation_details(&verdict);
                            self.step(
                                &mut phase,
                                TurnEvent::RegenerationRequested,
                                has_live_pending,
                                budget,
                            )?;
                            budget -= 1;
                        }
                        ReflectionOutcome::Refine => {
                            // Budget exhausted: the last draft ships
                            // with a visible caveat.
                            turn.answer = format!("{answer}\n\n{DEGRADED_CAVEAT}");
                            turn.citations = grounded_citations(&turn.retrieval);
                            turn.outcome = TurnOutcome::Degraded;
                            self.step(&mut phase, TurnEvent::DraftAccepted, has_live_pending, budget)?;
                            return Ok(());
                        }
                        ReflectionOutcome::Rewrite if !rewrite_used && budget > 0 => {
                            rewrite_used = true;
                            strict_grounding = true;
                            critique = violation_details(&verdict);
                            self.step(
                                &mut phase,
                                TurnEvent::RegenerationRequested,
                                has_live_pending,
                                budget,
                            )?;
                            budget -= 1;
                        }
                        ReflectionOutcome::Rewrite => {
                            // A second ungrounded draft never ships;
                            // the safe fallback does.
                            turn.answer = CANNOT_VERIFY_ANSWER.to_string();
                            turn.citations.clear();
                            turn.outcome = TurnOutcome::Degraded;
                            self.step(&mut phase, TurnEvent::DraftAccepted, has_live_pending, budget)?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn complete_draft(
        &self,
        turn: &mut TurnContext,
        prompt: &str,
    ) -> Result<String, crate::llm::LlmError> {
        let request = CompletionRequest {
            model: turn.model.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_prompt: prompt.to_string(),
        };
        let stream = self.llm.complete(request).await?;
        let completion = stream.collect().await?;
        turn.usage.add(completion.usage);
        Ok(completion.text)
    }

    fn step(
        &self,
        phase: &mut TurnPhase,
        event: TurnEvent,
        has_live_pending: bool,
        budget: u32,
    ) -> Result<(), ApplicationError> {
        let context = TurnFlowContext { has_live_pending, regenerations_remaining: budget };
        let transition = self
            .flow
            .apply(phase, &event, &context)
            .map_err(|error| ApplicationError::Domain(DomainError::from(error)))?;
        *phase = transition.to;
        Ok(())
    }

    async fn commit(&self, turn: &TurnContext, message_text: &str) -> Result<(), ApplicationError> {
        let commit = TurnCommit {
            user_message: Message::user(message_text, turn.now),
            assistant_message: Message::assistant(
                turn.answer.clone(),
                turn.citations.clone(),
                turn.now,
            ),
            assignment: turn.assignment_write.clone(),
            pending: turn.pending_write.clone(),
            committed_at: turn.now,
        };
        self.conversations
            .commit_turn(&turn.conversation_id, commit)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))
    }

    async fn record_metrics(&self, turn: &TurnContext, latency_ms: u64) {
        let row = self.tracker.compose(
            turn.turn_id.clone(),
            turn.conversation_id.clone(),
            turn.variant_id.clone(),
            &turn.model,
            latency_ms,
            turn.usage,
            turn.outcome,
            Utc::now(),
        );
        if let Err(error) = self.metrics.record(row).await {
            warn!(
                event_name = "agent.metrics.write_failed",
                conversation_id = %turn.conversation_id.0,
                turn_id = %turn.turn_id.0,
                error = %error,
                "metrics row was not recorded"
            );
        }
    }

    fn response_from(&self, turn: &TurnContext) -> TurnResponse {
        TurnResponse {
            turn_id: turn.turn_id.clone(),
            conversation_id: turn.conversation_id.clone(),
            answer_text: turn.answer.clone(),
            citations: turn.citations.clone(),
            pending_confirmation: turn.pending_notice.clone(),
            outcome: turn.outcome,
            variant_id: turn.variant_id.clone(),
        }
    }
}

fn compose_query(message_text: &str, hints: &[String]) -> String {
    if hints.is_empty() {
        return message_text.to_string();
    }
    let mut query = message_text.to_string();
    for hint in hints {
        query.push(' ');
        query.push_str(hint);
    }
    query
}

fn grounded_citations(retrieval: &[RetrievalResult]) -> Vec<SourceCitation> {
    retrieval
        .iter()
        .map(|result| SourceCitation {
            source_id: result.source_id.clone(),
            excerpt: result.excerpt.clone(),
            fused_score: result.fused_score,
        })
        .collect()
}

fn violation_details(verdict: &ReflectionVerdict) -> Vec<String> {
    verdict.violations.iter().map(|violation| violation.detail.clone()).collect()
}

fn configuration(error: PromptError) -> ApplicationError {
    ApplicationError::Configuration(error.to_string())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
