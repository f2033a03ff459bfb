//! Per-conversation write serialization.
//!
//! Every mutation of an existing conversation runs while holding that
//! conversation's lock, from its first read until its events are published.
//! Conversations never share a lock, so unrelated writers never wait on each
//! other. A multi-process deployment would replace this table with a row lock
//! on the conversation record.

use crate::model::ConversationId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Table of conversation locks, created on demand.
#[derive(Debug, Default)]
pub struct ConversationLocks {
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `conversation_id`.
    pub async fn acquire(&self, conversation_id: ConversationId) -> ConversationGuard<'_> {
        // Clone the mutex out so the shard lock is released before awaiting.
        let mutex = Arc::clone(self.locks.entry(conversation_id).or_default().value());

        // Built before waiting so a cancelled acquire still prunes its entry.
        let mut held = ConversationGuard {
            locks: self,
            conversation_id,
            guard: None,
        };
        held.guard = Some(mutex.lock_owned().await);
        trace!(conversation = %conversation_id, "Conversation lock acquired");

        held
    }

    /// Number of conversations with a live lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop the entry if nobody holds or waits for it. Waiters own a clone of
    /// the `Arc`, and `remove_if` holds the shard lock, so a count of one
    /// cannot race with a new `acquire`.
    fn prune(&self, conversation_id: ConversationId) {
        self.locks
            .remove_if(&conversation_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Exclusive access to one conversation. Released on drop.
pub struct ConversationGuard<'a> {
    locks: &'a ConversationLocks,
    conversation_id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationGuard<'_> {
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex (and its Arc clone) before checking for waiters.
        if self.guard.take().is_some() {
            trace!(conversation = %self.conversation_id, "Conversation lock released");
        }
        self.locks.prune(self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_same_conversation_is_exclusive() {
        let locks = Arc::new(ConversationLocks::new());
        let conversation = Uuid::new_v4();

        let held = locks.acquire(conversation).await;

        let contender = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _guard = contender.acquire(conversation).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_conversations_do_not_block() {
        let locks = ConversationLocks::new();

        let _first = locks.acquire(Uuid::new_v4()).await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.acquire(Uuid::new_v4()))
            .await;

        assert!(second.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_entry() {
        let locks = ConversationLocks::new();
        let conversation = Uuid::new_v4();

        let held = locks.acquire(conversation).await;
        let mut waiting = Box::pin(locks.acquire(conversation));
        assert!(futures_util::poll!(waiting.as_mut()).is_pending());

        // The waiter still owns a handle, so releasing keeps the entry.
        drop(held);
        assert_eq!(locks.len(), 1);

        drop(waiting);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_acquire_is_pruned() {
        let locks = ConversationLocks::new();
        let conversation = Uuid::new_v4();

        let held = locks.acquire(conversation).await;
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), locks.acquire(conversation)).await;
        assert!(timed_out.is_err());

        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_pruned_after_release() {
        let locks = ConversationLocks::new();
        let conversation = Uuid::new_v4();

        {
            let guard = locks.acquire(conversation).await;
            assert_eq!(guard.conversation_id(), conversation);
            assert_eq!(locks.len(), 1);
        }

        assert!(locks.is_empty());
    }
}
