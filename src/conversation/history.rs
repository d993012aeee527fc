//! Conversation history access under a per-conversation lock.

use crate::HistoryEntry;
use crate::conversation::store::StateStore;
use crate::error::StoreError;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Serializes read-modify-write of each conversation's history.
///
/// Sessions sharing a conversation id (channel or guild scope) run their
/// generations in parallel and only contend for the short read+append+persist
/// step, so neither side's turn is lost.
pub struct HistoryStore {
    store: Arc<dyn StateStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

impl HistoryStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once nobody else holds or waits on it.
    async fn release(&self, conversation_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(conversation_id);
        }
    }

    /// Snapshot of a conversation's history.
    pub async fn load(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let lock = self.lock_for(conversation_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.store.read(conversation_id).await
        };
        self.release(conversation_id, lock).await;
        result
    }

    /// Append one (user, assistant) pair and persist it.
    pub async fn append_turn(
        &self,
        conversation_id: &str,
        user: HistoryEntry,
        assistant: HistoryEntry,
    ) -> Result<(), StoreError> {
        let lock = self.lock_for(conversation_id).await;
        let result = {
            let _guard = lock.lock().await;
            match self.store.read(conversation_id).await {
                Ok(mut history) => {
                    history.push(user);
                    history.push(assistant);
                    self.store.persist(conversation_id, &history).await
                }
                Err(error) => Err(error),
            }
        };
        self.release(conversation_id, lock).await;

        if let Err(error) = &result {
            tracing::error!(%error, conversation_id, "failed to persist conversation turn");
        }
        result
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::store::MemoryStateStore;
    use crate::{ContentPart, Role};
    use std::time::Duration;

    /// Store that yields between read and persist so unguarded updates interleave.
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStateStore,
    }

    #[async_trait::async_trait]
    impl StateStore for SlowStore {
        async fn read(&self, conversation_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
            let history = self.inner.read(conversation_id).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            history
        }

        async fn persist(
            &self,
            conversation_id: &str,
            history: &[HistoryEntry],
        ) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.inner.persist(conversation_id, history).await
        }
    }

    fn pair(text: &str) -> (HistoryEntry, HistoryEntry) {
        (
            HistoryEntry::user(vec![ContentPart::text(text)]),
            HistoryEntry::assistant(format!("answer to {text}")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_appends_keep_both_pairs() {
        let history = Arc::new(HistoryStore::new(Arc::new(SlowStore::default())));

        let (first_user, first_reply) = pair("first");
        let (second_user, second_reply) = pair("second");

        let a = {
            let history = history.clone();
            tokio::spawn(async move {
                history
                    .append_turn("channel:1", first_user, first_reply)
                    .await
            })
        };
        let b = {
            let history = history.clone();
            tokio::spawn(async move {
                history
                    .append_turn("channel:1", second_user, second_reply)
                    .await
            })
        };
        a.await.expect("task a").expect("append a");
        b.await.expect("task b").expect("append b");

        let stored = history.load("channel:1").await.expect("load");
        assert_eq!(stored.len(), 4);
        // Pairs are contiguous: user then assistant, never interleaved.
        for turn in stored.chunks(2) {
            assert_eq!(turn[0].role, Role::User);
            assert_eq!(turn[1].role, Role::Assistant);
        }
        let texts: Vec<_> = stored
            .iter()
            .filter(|entry| entry.role == Role::User)
            .filter_map(|entry| match &entry.parts[0] {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::File { .. } => None,
            })
            .collect();
        assert!(texts.contains(&"first"));
        assert!(texts.contains(&"second"));
        assert_eq!(history.tracked_locks().await, 0);
    }

    #[tokio::test]
    async fn separate_conversations_do_not_share_history() {
        let history = HistoryStore::new(Arc::new(MemoryStateStore::default()));
        let (user, reply) = pair("hi");
        history
            .append_turn("user:1", user, reply)
            .await
            .expect("append");

        assert_eq!(history.load("user:1").await.expect("load").len(), 2);
        assert!(history.load("user:2").await.expect("load").is_empty());
    }
}
