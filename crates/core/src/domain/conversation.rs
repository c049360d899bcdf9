use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::experiments::ExperimentAssignment;
use crate::tools::ToolCall;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    pub source_id: String,
    pub excerpt: String,
    pub fused_score: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub citations: Vec<SourceCitation>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self { role: MessageRole::User, content: content.into(), citations: Vec::new(), created_at }
    }

    pub fn assistant(
        content: impl Into<String>,
        citations: Vec<SourceCitation>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self { role: MessageRole::Assistant, content: content.into(), citations, created_at }
    }
}

/// A destructive tool call parked until the user confirms it. At most
/// one exists per conversation; proposing a new one replaces the old.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub action_id: ActionId,
    pub call: ToolCall,
    pub fingerprint: String,
    pub proposed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAction {
    pub fn new(call: ToolCall, proposed_at: DateTime<Utc>, ttl: Duration) -> Self {
        let fingerprint = blake3::hash(&call.canonical_bytes()).to_hex().to_string();
        Self {
            action_id: ActionId(Uuid::new_v4().to_string()),
            call,
            fingerprint,
            proposed_at,
            expires_at: proposed_at + ttl,
        }
    }

    /// Expired actions are treated as absent everywhere; execution
    /// with stale arguments is never allowed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: ConversationId,
    pub messages: Vec<Message>,
    pub pending_action: Option<PendingAction>,
    pub assignment: Option<ExperimentAssignment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(id: ConversationId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            messages: Vec::new(),
            pending_action: None,
            assignment: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The pending action, with expiry already applied.
    pub fn live_pending_action(&self, now: DateTime<Utc>) -> Option<&PendingAction> {
        self.pending_action.as_ref().filter(|action| !action.is_expired(now))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::domain::record::RecordId;
    use crate::tools::ToolCall;

    use super::{ConversationId, ConversationState, MessageRole, PendingAction};

    #[test]
    fn role_round_trips_from_storage_encoding() {
        for role in [MessageRole::User, MessageRole::Assistant] {
            assert_eq!(MessageRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(MessageRole::parse("system"), None);
    }

    #[test]
    fn pending_action_expires_at_the_boundary() {
        let proposed_at = Utc::now();
        let action = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-1".to_string()) },
            proposed_at,
            Duration::seconds(300),
        );

        assert!(!action.is_expired(proposed_at + Duration::seconds(299)));
        assert!(action.is_expired(proposed_at + Duration::seconds(300)));
        assert!(action.is_expired(proposed_at + Duration::seconds(301)));
    }

    #[test]
    fn equal_calls_share_a_fingerprint() {
        let now = Utc::now();
        let first = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-1".to_string()) },
            now,
            Duration::seconds(300),
        );
        let second = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-1".to_string()) },
            now,
            Duration::seconds(300),
        );
        let other = PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-2".to_string()) },
            now,
            Duration::seconds(300),
        );

        assert_eq!(first.fingerprint, second.fingerprint);
        assert_ne!(first.fingerprint, other.fingerprint);
        assert_ne!(first.action_id, second.action_id);
    }

    #[test]
    fn expired_pending_action_reads_as_absent() {
        let proposed_at = Utc::now();
        let mut state = ConversationState::new(ConversationId("conv-1".to_string()), proposed_at);
        state.pending_action = Some(PendingAction::new(
            ToolCall::DeleteRecord { id: RecordId("rec-1".to_string()) },
            proposed_at,
            Duration::seconds(60),
        ));

        assert!(state.live_pending_action(proposed_at + Duration::seconds(30)).is_some());
        assert!(state.live_pending_action(proposed_at + Duration::seconds(90)).is_none());
    }
}
