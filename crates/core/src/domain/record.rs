use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

/// A document in the knowledge corpus. Records are both the retrieval
/// source material and the target of the record tools.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
}

impl RecordDraft {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.title.trim().is_empty() {
            return Err(DomainError::InvariantViolation(
                "record title must not be empty".to_owned(),
            ));
        }
        if self.body.trim().is_empty() {
            return Err(DomainError::InvariantViolation(
                "record body must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Partial update applied to an existing record. `None` fields are
/// left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.tags.is_none()
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.is_empty() {
            return Err(DomainError::InvariantViolation(
                "record patch must change at least one field".to_owned(),
            ));
        }
        if matches!(&self.title, Some(title) if title.trim().is_empty()) {
            return Err(DomainError::InvariantViolation(
                "record title must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Record {
    pub fn apply_patch(&mut self, patch: RecordPatch, now: DateTime<Utc>) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(body) = patch.body {
            self.body = body;
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        self.updated_at = now;
    }
}
