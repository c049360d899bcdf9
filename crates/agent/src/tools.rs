//! The tool side of a turn: interpreting model drafts, running calls
//! against the record store, and classifying confirmation replies.
//!
//! Non-destructive calls run immediately. Destructive calls are parked
//! by the orchestrator and reach [`ToolExecutor::execute_confirmed`]
//! only after an explicit affirmative reply, with the arguments that
//! were stored at proposal time.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_core::config::ConfirmationConfig;
use parley_core::domain::record::{Record, RecordId};
use parley_core::errors::{ApplicationError, DomainError};
use parley_core::text::normalize_reply;
use parley_core::tools::{ToolCall, ToolCallError};
use parley_db::repositories::{RecordRepository, RepositoryError};

/// Marker the model puts at the start of a line to request a tool call.
pub const TOOL_DIRECTIVE_MARKER: &str = "@tool";

/// What a model draft asks the engine to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DraftContent {
    Answer(String),
    Tool(ToolCall),
}

/// Interprets a raw draft. A draft whose first non-empty line starts
/// with the directive marker is a tool request; anything else is an
/// answer. A malformed directive is a draft defect the caller feeds
/// back as critique, never a crash.
pub fn parse_draft(raw: &str) -> Result<DraftContent, ToolCallError> {
    let Some(first_line) = raw.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return Ok(DraftContent::Answer(String::new()));
    };

    if let Some(arguments) = directive_arguments(first_line) {
        let call = ToolCall::parse(arguments)?;
        return Ok(DraftContent::Tool(call));
    }

    Ok(DraftContent::Answer(raw.trim().to_string()))
}

fn directive_arguments(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(TOOL_DIRECTIVE_MARKER)?;
    // `@toolbox` and friends are prose, not directives.
    if rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.starts_with('{') {
        Some(rest.trim())
    } else {
        None
    }
}

/// How a confirmation-shaped reply reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyDisposition {
    Affirmative,
    Negative,
    Unrelated,
}

/// Exact-match classification over normalized replies. Anything outside
/// both lexicons is unrelated and leaves a pending action in place.
#[derive(Clone, Debug)]
pub struct ReplyClassifier {
    affirmative: Vec<String>,
    negative: Vec<String>,
}

impl ReplyClassifier {
    pub fn from_config(config: &ConfirmationConfig) -> Self {
        Self {
            affirmative: config.affirmative_replies.iter().map(|r| normalize_reply(r)).collect(),
            negative: config.negative_replies.iter().map(|r| normalize_reply(r)).collect(),
        }
    }

    pub fn classify(&self, reply: &str) -> ReplyDisposition {
        let normalized = normalize_reply(reply);
        if self.affirmative.iter().any(|entry| *entry == normalized) {
            ReplyDisposition::Affirmative
        } else if self.negative.iter().any(|entry| *entry == normalized) {
            ReplyDisposition::Negative
        } else {
            ReplyDisposition::Unrelated
        }
    }
}

/// Result of one call against the record store.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Listed { tag_filter: Option<String>, records: Vec<Record> },
    Created(Record),
    Updated(Record),
    Deleted(RecordId),
    /// The store refused the call, usually because the record vanished
    /// between proposal and confirmation. Reported once, never retried.
    Rejected { call: ToolCall, reason: String },
}

impl ToolOutcome {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// User-facing rendering folded into the turn's answer.
    pub fn render_answer(&self) -> String {
        match self {
            Self::Listed { tag_filter, records } => render_listing(tag_filter.as_deref(), records),
            Self::Created(record) => {
                format!("Created record `{}`: {}.", record.id.0, record.title)
            }
            Self::Updated(record) => {
                format!("Updated record `{}` ({}).", record.id.0, record.title)
            }
            Self::Deleted(id) => format!("Deleted record `{}`.", id.0),
            Self::Rejected { call, reason } => {
                format!("Could not {}: {}.", call.summary(), reason)
            }
        }
    }
}

fn render_listing(tag_filter: Option<&str>, records: &[Record]) -> String {
    if records.is_empty() {
        return match tag_filter {
            Some(tag) => format!("No records carry the tag `{tag}`."),
            None => "No records exist yet.".to_string(),
        };
    }

    let mut lines = vec![match tag_filter {
        Some(tag) => format!("{} record(s) tagged `{tag}`:", records.len()),
        None => format!("{} record(s):", records.len()),
    }];
    for record in records {
        if record.tags.is_empty() {
            lines.push(format!("- {}: {}", record.id.0, record.title));
        } else {
            lines.push(format!("- {}: {} [{}]", record.id.0, record.title, record.tags.join(", ")));
        }
    }
    lines.join("\n")
}

/// Runs tool calls against the record store.
#[derive(Clone, Debug)]
pub struct ToolExecutor<R> {
    records: R,
}

impl<R> ToolExecutor<R>
where
    R: RecordRepository,
{
    pub fn new(records: R) -> Self {
        Self { records }
    }

    /// Immediate path. Destructive calls are rejected outright; they
    /// must go through the confirmation protocol.
    pub async fn execute_immediate(
        &self,
        call: &ToolCall,
        now: DateTime<Utc>,
    ) -> Result<ToolOutcome, ApplicationError> {
        match call {
            ToolCall::ListRecords { tag_filter } => {
                let records = self.records.list(tag_filter.as_deref()).await.map_err(persistence)?;
                Ok(ToolOutcome::Listed { tag_filter: tag_filter.clone(), records })
            }
            ToolCall::CreateRecord { title, body, tags } => {
                let record = Record {
                    id: RecordId(Uuid::new_v4().to_string()),
                    title: title.clone(),
                    body: body.clone(),
                    tags: tags.clone(),
                    created_at: now,
                    updated_at: now,
                };
                self.records.save(record.clone()).await.map_err(persistence)?;
                Ok(ToolOutcome::Created(record))
            }
            destructive => Err(ApplicationError::Domain(DomainError::InvariantViolation(
                format!("destructive call `{}` on the immediate path", destructive.name()),
            ))),
        }
    }

    /// Confirmed path for previously parked destructive calls. Runs
    /// with the stored arguments exactly as proposed.
    pub async fn execute_confirmed(
        &self,
        call: &ToolCall,
        now: DateTime<Utc>,
    ) -> Result<ToolOutcome, ApplicationError> {
        match call {
            ToolCall::UpdateRecord { id, patch } => {
                match self.records.find_by_id(id).await.map_err(persistence)? {
                    Some(mut record) => {
                        record.apply_patch(patch.clone(), now);
                        self.records.save(record.clone()).await.map_err(persistence)?;
                        Ok(ToolOutcome::Updated(record))
                    }
                    None => Ok(ToolOutcome::Rejected {
                        call: call.clone(),
                        reason: format!("record `{}` no longer exists", id.0),
                    }),
                }
            }
            ToolCall::DeleteRecord { id } => {
                if self.records.delete(id).await.map_err(persistence)? {
                    Ok(ToolOutcome::Deleted(id.clone()))
                } else {
                    Ok(ToolOutcome::Rejected {
                        call: call.clone(),
                        reason: format!("record `{}` no longer exists", id.0),
                    })
                }
            }
            non_destructive => Err(ApplicationError::Domain(DomainError::InvariantViolation(
                format!("non-destructive call `{}` on the confirmed path", non_destructive.name()),
            ))),
        }
    }
}

fn persistence(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}
