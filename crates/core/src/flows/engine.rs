use thiserror::Error;

use crate::flows::states::{
    TurnEvent, TurnFlowAction, TurnFlowContext, TurnPhase, TurnTransition,
};

pub trait TurnFlowDefinition {
    fn initial_phase(&self) -> TurnPhase;
    fn transition(
        &self,
        current: &TurnPhase,
        event: &TurnEvent,
        context: &TurnFlowContext,
    ) -> Result<TurnTransition, TurnFlowError>;
}

/// The one turn shape this engine runs: resolve any pending action,
/// retrieve, generate, then either park a destructive call for
/// confirmation or reflect on the draft, and finally commit.
#[derive(Clone, Debug, Default)]
pub struct StandardTurnFlow;

impl TurnFlowDefinition for StandardTurnFlow {
    fn initial_phase(&self) -> TurnPhase {
        TurnPhase::ResolvingPending
    }

    fn transition(
        &self,
        current: &TurnPhase,
        event: &TurnEvent,
        context: &TurnFlowContext,
    ) -> Result<TurnTransition, TurnFlowError> {
        transition_standard(current, event, context)
    }
}

pub struct TurnFlowEngine<F = StandardTurnFlow> {
    flow: F,
}

impl<F> TurnFlowEngine<F>
where
    F: TurnFlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_phase(&self) -> TurnPhase {
        self.flow.initial_phase()
    }

    pub fn apply(
        &self,
        current: &TurnPhase,
        event: &TurnEvent,
        context: &TurnFlowContext,
    ) -> Result<TurnTransition, TurnFlowError> {
        self.flow.transition(current, event, context)
    }
}

impl Default for TurnFlowEngine<StandardTurnFlow> {
    fn default() -> Self {
        Self::new(StandardTurnFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnFlowError {
    #[error("no live pending action to resolve in {phase:?}")]
    MissingPendingAction { phase: TurnPhase },
    #[error("regeneration budget exhausted in {phase:?}")]
    RegenerationBudgetExhausted { phase: TurnPhase },
    #[error("invalid transition from {phase:?} using event {event:?}")]
    InvalidTransition { phase: TurnPhase, event: TurnEvent },
}

fn transition_standard(
    current: &TurnPhase,
    event: &TurnEvent,
    context: &TurnFlowContext,
) -> Result<TurnTransition, TurnFlowError> {
    use TurnEvent::{
        CancellationReceived, ConfirmationQuestionComposed, ConfirmationReceived,
        ContextAssembled, DestructiveCallProposed, DraftAccepted, DraftCompleted,
        FailureDetected, FreshRequestDetected, RegenerationRequested,
    };
    use TurnFlowAction::{
        CommitTurn, DiscardPendingCall, ExecutePendingCall, GenerateDraft, ProposePendingAction,
        RunReflection, RunSearch,
    };
    use TurnPhase::{
        AwaitingConfirmation, Finalizing, Generating, Reflecting, ResolvingPending, Retrieving,
    };

    let (to, actions) = match (current, event) {
        (ResolvingPending, ConfirmationReceived) => {
            if !context.has_live_pending {
                return Err(TurnFlowError::MissingPendingAction { phase: current.clone() });
            }
            (Finalizing, vec![ExecutePendingCall, CommitTurn])
        }
        (ResolvingPending, CancellationReceived) => {
            if !context.has_live_pending {
                return Err(TurnFlowError::MissingPendingAction { phase: current.clone() });
            }
            (Finalizing, vec![DiscardPendingCall, CommitTurn])
        }
        (ResolvingPending, FreshRequestDetected) => (Retrieving, vec![RunSearch]),
        (Retrieving, ContextAssembled) => (Generating, vec![GenerateDraft]),
        (Generating, DestructiveCallProposed) => {
            (AwaitingConfirmation, vec![ProposePendingAction])
        }
        (AwaitingConfirmation, ConfirmationQuestionComposed) => (Finalizing, vec![CommitTurn]),
        (Generating, DraftCompleted) => (Reflecting, vec![RunReflection]),
        (Reflecting, RegenerationRequested) => {
            if context.regenerations_remaining == 0 {
                return Err(TurnFlowError::RegenerationBudgetExhausted { phase: current.clone() });
            }
            (Generating, vec![GenerateDraft])
        }
        (Reflecting, DraftAccepted) => (Finalizing, vec![CommitTurn]),
        (Finalizing, FailureDetected) => {
            return Err(TurnFlowError::InvalidTransition {
                phase: current.clone(),
                event: event.clone(),
            });
        }
        (_, FailureDetected) => (Finalizing, vec![CommitTurn]),
        _ => {
            return Err(TurnFlowError::InvalidTransition {
                phase: current.clone(),
                event: event.clone(),
            });
        }
    };

    Ok(TurnTransition { from: current.clone(), to, event: event.clone(), actions })
}

#[cfg(test)]
mod tests {
    use crate::flows::engine::{
        StandardTurnFlow, TurnFlowDefinition, TurnFlowEngine, TurnFlowError,
    };
    use crate::flows::states::{TurnEvent, TurnFlowAction, TurnFlowContext, TurnPhase};

    fn context_with_budget(regenerations_remaining: u32) -> TurnFlowContext {
        TurnFlowContext { has_live_pending: false, regenerations_remaining }
    }

    #[test]
    fn plain_question_walks_retrieve_generate_reflect_finalize() {
        let engine = TurnFlowEngine::default();
        let context = context_with_budget(2);
        let mut phase = engine.initial_phase();

        phase = engine
            .apply(&phase, &TurnEvent::FreshRequestDetected, &context)
            .expect("resolving -> retrieving")
            .to;
        phase = engine
            .apply(&phase, &TurnEvent::ContextAssembled, &context)
            .expect("retrieving -> generating")
            .to;
        phase = engine
            .apply(&phase, &TurnEvent::DraftCompleted, &context)
            .expect("generating -> reflecting")
            .to;
        let accepted = engine
            .apply(&phase, &TurnEvent::DraftAccepted, &context)
            .expect("reflecting -> finalizing");

        assert_eq!(accepted.to, TurnPhase::Finalizing);
        assert_eq!(accepted.actions, vec![TurnFlowAction::CommitTurn]);
    }

    #[test]
    fn destructive_proposal_parks_in_awaiting_confirmation() {
        let engine = TurnFlowEngine::default();
        let context = context_with_budget(2);

        let proposed = engine
            .apply(&TurnPhase::Generating, &TurnEvent::DestructiveCallProposed, &context)
            .expect("generating -> awaiting confirmation");
        assert_eq!(proposed.to, TurnPhase::AwaitingConfirmation);
        assert_eq!(proposed.actions, vec![TurnFlowAction::ProposePendingAction]);

        let finalized = engine
            .apply(&proposed.to, &TurnEvent::ConfirmationQuestionComposed, &context)
            .expect("awaiting confirmation -> finalizing");
        assert_eq!(finalized.to, TurnPhase::Finalizing);
    }

    #[test]
    fn confirmation_resolution_requires_a_live_pending_action() {
        let engine = TurnFlowEngine::default();

        let error = engine
            .apply(
                &TurnPhase::ResolvingPending,
                &TurnEvent::ConfirmationReceived,
                &context_with_budget(2),
            )
            .expect_err("confirm without pending must fail");
        assert!(matches!(error, TurnFlowError::MissingPendingAction { .. }));

        let context = TurnFlowContext { has_live_pending: true, regenerations_remaining: 2 };
        let executed = engine
            .apply(&TurnPhase::ResolvingPending, &TurnEvent::ConfirmationReceived, &context)
            .expect("confirm with pending");
        assert_eq!(
            executed.actions,
            vec![TurnFlowAction::ExecutePendingCall, TurnFlowAction::CommitTurn]
        );
    }

    #[test]
    fn regeneration_is_bounded_by_the_remaining_budget() {
        let engine = TurnFlowEngine::default();

        let looped = engine
            .apply(&TurnPhase::Reflecting, &TurnEvent::RegenerationRequested, &context_with_budget(1))
            .expect("reflecting -> generating");
        assert_eq!(looped.to, TurnPhase::Generating);

        let error = engine
            .apply(&TurnPhase::Reflecting, &TurnEvent::RegenerationRequested, &context_with_budget(0))
            .expect_err("exhausted budget must fail");
        assert!(matches!(error, TurnFlowError::RegenerationBudgetExhausted { .. }));
    }

    #[test]
    fn failure_routes_to_finalizing_from_any_live_phase() {
        let engine = TurnFlowEngine::default();
        let context = context_with_budget(2);

        for phase in [
            TurnPhase::ResolvingPending,
            TurnPhase::Retrieving,
            TurnPhase::Generating,
            TurnPhase::AwaitingConfirmation,
            TurnPhase::Reflecting,
        ] {
            let outcome = engine
                .apply(&phase, &TurnEvent::FailureDetected, &context)
                .expect("failure routes to finalizing");
            assert_eq!(outcome.to, TurnPhase::Finalizing);
        }

        let error = engine
            .apply(&TurnPhase::Finalizing, &TurnEvent::FailureDetected, &context)
            .expect_err("finalizing cannot fail into itself");
        assert!(matches!(error, TurnFlowError::InvalidTransition { .. }));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let engine = TurnFlowEngine::default();
        let error = engine
            .apply(&TurnPhase::ResolvingPending, &TurnEvent::DraftCompleted, &context_with_budget(2))
            .expect_err("resolving cannot complete a draft");
        assert!(matches!(
            error,
            TurnFlowError::InvalidTransition {
                phase: TurnPhase::ResolvingPending,
                event: TurnEvent::DraftCompleted
            }
        ));
    }

    #[test]
    fn replay_is_deterministic_for_same_event_sequence() {
        let engine = TurnFlowEngine::default();
        let context = context_with_budget(2);
        let events = [
            TurnEvent::FreshRequestDetected,
            TurnEvent::ContextAssembled,
            TurnEvent::DraftCompleted,
            TurnEvent::RegenerationRequested,
            TurnEvent::DraftCompleted,
            TurnEvent::DraftAccepted,
        ];

        let run = |engine: &TurnFlowEngine<StandardTurnFlow>| {
            let mut phase = engine.initial_phase();
            let mut actions = Vec::new();
            for event in &events {
                let outcome = engine.apply(&phase, event, &context).expect("deterministic run");
                actions.push(outcome.actions);
                phase = outcome.to;
            }
            (phase, actions)
        };

        let first = run(&engine);
        let second = run(&engine);

        assert_eq!(first, second);
        assert_eq!(StandardTurnFlow.initial_phase(), TurnPhase::ResolvingPending);
    }
}
