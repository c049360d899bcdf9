use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::record::{RecordDraft, RecordId, RecordPatch};
use crate::errors::DomainError;

/// The closed tool surface the model may request. Anything outside
/// these four operations is rejected at parse time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    ListRecords {
        #[serde(default)]
        tag_filter: Option<String>,
    },
    CreateRecord {
        title: String,
        body: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    UpdateRecord {
        id: RecordId,
        patch: RecordPatch,
    },
    DeleteRecord {
        id: RecordId,
    },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolCallError {
    #[error("tool directive is not valid JSON: {detail}")]
    InvalidJson { detail: String },
    #[error("tool directive is missing the `tool` field")]
    MissingToolName,
    #[error("unknown tool `{name}` (expected list_records|create_record|update_record|delete_record)")]
    UnknownTool { name: String },
    #[error("invalid arguments for `{tool}`: {detail}")]
    InvalidArguments { tool: String, detail: String },
}

const KNOWN_TOOLS: &[&str] = &["list_records", "create_record", "update_record", "delete_record"];

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListRecords { .. } => "list_records",
            Self::CreateRecord { .. } => "create_record",
            Self::UpdateRecord { .. } => "update_record",
            Self::DeleteRecord { .. } => "delete_record",
        }
    }

    /// Destructive calls require a confirmed pending action before
    /// they execute; the rest run immediately.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::UpdateRecord { .. } | Self::DeleteRecord { .. })
    }

    /// Parses a raw tool directive emitted by the model. The name is
    /// checked before argument deserialization so the caller can tell
    /// an unknown tool apart from bad arguments.
    pub fn parse(raw: &str) -> Result<Self, ToolCallError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|err| ToolCallError::InvalidJson { detail: err.to_string() })?;

        let name = value
            .get("tool")
            .and_then(|field| field.as_str())
            .map(str::to_owned)
            .ok_or(ToolCallError::MissingToolName)?;
        if !KNOWN_TOOLS.contains(&name.as_str()) {
            return Err(ToolCallError::UnknownTool { name });
        }

        let call: Self = serde_json::from_value(value)
            .map_err(|err| ToolCallError::InvalidArguments { tool: name, detail: err.to_string() })?;
        call.validate()?;
        Ok(call)
    }

    pub fn validate(&self) -> Result<(), ToolCallError> {
        let reject = |detail: &str| {
            Err(ToolCallError::InvalidArguments {
                tool: self.name().to_owned(),
                detail: detail.to_owned(),
            })
        };

        match self {
            Self::ListRecords { tag_filter } => {
                if matches!(tag_filter, Some(tag) if tag.trim().is_empty()) {
                    return reject("tag_filter must not be blank");
                }
            }
            Self::CreateRecord { title, body, tags } => {
                let draft = RecordDraft {
                    title: title.clone(),
                    body: body.clone(),
                    tags: tags.clone(),
                };
                if let Err(error) = draft.validate() {
                    return reject(&error.to_string());
                }
            }
            Self::UpdateRecord { id, patch } => {
                if id.0.trim().is_empty() {
                    return reject("record id must not be empty");
                }
                if let Err(error) = patch.validate() {
                    return reject(&error.to_string());
                }
            }
            Self::DeleteRecord { id } => {
                if id.0.trim().is_empty() {
                    return reject("record id must not be empty");
                }
            }
        }
        Ok(())
    }

    /// One-line description shown to the user when asking for
    /// confirmation and echoed in logs.
    pub fn summary(&self) -> String {
        match self {
            Self::ListRecords { tag_filter: Some(tag) } => {
                format!("list records tagged `{tag}`")
            }
            Self::ListRecords { tag_filter: None } => "list all records".to_owned(),
            Self::CreateRecord { title, .. } => format!("create record `{title}`"),
            Self::UpdateRecord { id, patch } => {
                let mut fields = Vec::new();
                if patch.title.is_some() {
                    fields.push("title");
                }
                if patch.body.is_some() {
                    fields.push("body");
                }
                if patch.tags.is_some() {
                    fields.push("tags");
                }
                format!("update {} of record `{}`", fields.join(", "), id.0)
            }
            Self::DeleteRecord { id } => format!("delete record `{}`", id.0),
        }
    }

    /// Stable byte encoding fed to the pending-action fingerprint.
    /// Field order is fixed by construction, so equal calls always
    /// encode identically.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut push = |part: &str| {
            out.extend_from_slice(part.as_bytes());
            out.push(0);
        };

        push(self.name());
        match self {
            Self::ListRecords { tag_filter } => {
                push(tag_filter.as_deref().unwrap_or(""));
            }
            Self::CreateRecord { title, body, tags } => {
                push(title);
                push(body);
                for tag in tags {
                    push(tag);
                }
            }
            Self::UpdateRecord { id, patch } => {
                push(&id.0);
                push(patch.title.as_deref().unwrap_or(""));
                push(patch.body.as_deref().unwrap_or(""));
                for tag in patch.tags.iter().flatten() {
                    push(tag);
                }
            }
            Self::DeleteRecord { id } => {
                push(&id.0);
            }
        }
        out
    }
}

impl From<ToolCallError> for DomainError {
    fn from(value: ToolCallError) -> Self {
        DomainError::ToolCall(value)
    }
}
