use serde::{Deserialize, Serialize};

/// Phase of a single turn. Every turn starts in `ResolvingPending`
/// and ends in `Finalizing`, where buffered state is committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnPhase {
    ResolvingPending,
    Retrieving,
    Generating,
    AwaitingConfirmation,
    Reflecting,
    Finalizing,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolvingPending => "resolving_pending",
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Reflecting => "reflecting",
            Self::Finalizing => "finalizing",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnEvent {
    ConfirmationReceived,
    CancellationReceived,
    FreshRequestDetected,
    ContextAssembled,
    DestructiveCallProposed,
    ConfirmationQuestionComposed,
    DraftCompleted,
    RegenerationRequested,
    DraftAccepted,
    FailureDetected,
}

/// Facts the transition function needs beyond the phase itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TurnFlowContext {
    pub has_live_pending: bool,
    pub regenerations_remaining: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnFlowAction {
    ExecutePendingCall,
    DiscardPendingCall,
    RunSearch,
    GenerateDraft,
    ProposePendingAction,
    RunReflection,
    CommitTurn,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTransition {
    pub from: TurnPhase,
    pub to: TurnPhase,
    pub event: TurnEvent,
    pub actions: Vec<TurnFlowAction>,
}
