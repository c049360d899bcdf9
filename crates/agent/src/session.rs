//! Per-conversation turn serialization.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use parley_core::domain::conversation::ConversationId;

/// Hands out one guard per conversation so its turns run strictly in
/// arrival order while unrelated conversations proceed in parallel.
/// Waiters queue fairly on the per-conversation mutex. Entries are a
/// handful of words each and live for the process lifetime.
#[derive(Debug, Default)]
pub struct ConversationGate {
    locks: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ConversationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    #[tokio::test]
    async fn same_conversation_waits_for_the_previous_turn() {
        let gate = Arc::new(ConversationGate::new());
        let id = ConversationId("conv-gate".to_string());
        let guard = gate.acquire(&id).await;

        let contender = {
            let gate = Arc::clone(&gate);
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = gate.acquire(&id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender unblocked")
            .expect("contender task");
    }

    #[tokio::test]
    async fn different_conversations_do_not_block_each_other() {
        let gate = ConversationGate::new();
        let _held = gate.acquire(&ConversationId("conv-a".to_string())).await;

        let other = timeout(
            Duration::from_millis(100),
            gate.acquire(&ConversationId("conv-b".to_string())),
        )
        .await;
        assert!(other.is_ok());
    }
}
