//! Turn orchestration for parley, the records assistant.
//!
//! This crate is the engine that turns one user message into one
//! finished turn:
//!
//! 1. **Pending resolution** (`tools`) - classify the reply against a
//!    parked destructive call and execute or cancel it
//! 2. **Retrieval** (`retrieval`) - run the vector and lexical legs and
//!    fuse them into a ranked context
//! 3. **Generation** (`llm`, `prompts`) - render the grounded prompt
//!    and stream a draft from the model
//! 4. **Validation** - reflect on the draft and regenerate within a
//!    bounded budget
//! 5. **Finalize** (`orchestrator`) - commit messages, pending state,
//!    and the experiment assignment in one step
//!
//! # Key Types
//!
//! - `WorkflowOrchestrator` - runs complete turns (see `orchestrator`)
//! - `LlmClient` - pluggable completion trait; `HttpLlmClient` speaks
//!   the OpenAI-compatible chat API, `ScriptedLlmClient` serves tests
//! - `SearchIndex` - pluggable retrieval legs over the record corpus
//! - `ConversationGate` - serializes turns within a conversation
//!
//! # Safety Principle
//!
//! The model is strictly a drafting engine. It NEVER mutates a record
//! directly: destructive calls are parked with their arguments frozen,
//! and only an explicit user confirmation executes them, verbatim, from
//! the stored copy.

pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod retrieval;
pub mod session;
pub mod tools;

pub use llm::{
    Completion, CompletionChunk, CompletionRequest, CompletionStream, HttpLlmClient, LlmClient,
    LlmError, RetryPolicy, ScriptedCompletion, ScriptedLlmClient,
};
pub use orchestrator::{
    PendingConfirmationNotice, TurnRequest, TurnResponse, WorkflowOrchestrator,
};
pub use prompts::{GenerationPrompt, PromptError, PromptRenderer, SYSTEM_PROMPT};
pub use retrieval::{
    CorpusSearchIndex, RetrievalFusionEngine, RetrievalOutcome, SearchError, SearchIndex,
    StaticSearchIndex,
};
pub use session::ConversationGate;
pub use tools::{
    parse_draft, DraftContent, ReplyClassifier, ReplyDisposition, ToolExecutor, ToolOutcome,
};
