pub mod engine;
pub mod states;

pub use engine::{StandardTurnFlow, TurnFlowDefinition, TurnFlowEngine, TurnFlowError};
pub use states::{TurnEvent, TurnFlowAction, TurnFlowContext, TurnPhase, TurnTransition};
