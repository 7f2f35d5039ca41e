// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-conversation mutual exclusion.
//!
//! [`ConversationLock`] serializes all task processing for one conversation:
//! workspace allocation and the whole workflow run happen under one guard.
//! Waiters for the same conversation are served in arrival order (tokio's
//! `Mutex` is fair). Different conversations never block each other.
//!
//! The table lives in memory only. A slot exists while at least one task holds
//! or waits for it and is removed as soon as the last one leaves, including
//! when a waiter is cancelled or a holder panics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;
use uuid::Uuid;

/// Who holds a conversation lock, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// One conversation's slot in the lock table.
#[derive(Debug)]
pub struct LockSlot {
    gate: Arc<tokio::sync::Mutex<()>>,
    /// Holder plus waiters.
    users: usize,
    holder: Option<LockEntry>,
}

/// Backing map for [`ConversationLock`]. Shareable so tests and embedders can
/// inspect or pre-seed it.
pub type LockTable = Arc<Mutex<HashMap<String, LockSlot>>>;

/// Lock manager keyed by conversation id.
#[derive(Clone, Default)]
pub struct ConversationLock {
    table: LockTable,
}

impl ConversationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing table.
    pub fn with_table(table: LockTable) -> Self {
        Self { table }
    }

    /// Wait for exclusive access to `conversation_id`.
    pub async fn lock(&self, conversation_id: &str) -> ConversationGuard {
        let lease = Lease::join(&self.table, conversation_id);
        let permit = lease.gate.clone().lock_owned().await;
        trace!(conversation = conversation_id, "Conversation lock acquired");
        ConversationGuard::new(permit, lease)
    }

    /// Take the lock only if nobody holds or waits for it.
    pub fn try_lock(&self, conversation_id: &str) -> Option<ConversationGuard> {
        let lease = Lease::join(&self.table, conversation_id);
        let permit = lease.gate.clone().try_lock_owned().ok()?;
        Some(ConversationGuard::new(permit, lease))
    }

    /// Run `f` while holding the lock for `conversation_id`.
    ///
    /// The lock is released when `f` completes, fails, panics or is cancelled.
    pub async fn with_lock<F, Fut, T>(&self, conversation_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(conversation_id).await;
        f().await
    }

    /// Current holder, if the conversation is locked.
    pub fn holder(&self, conversation_id: &str) -> Option<LockEntry> {
        self.table
            .lock()
            .get(conversation_id)
            .and_then(|slot| slot.holder.clone())
    }

    pub fn is_locked(&self, conversation_id: &str) -> bool {
        self.holder(conversation_id).is_some()
    }

    /// Number of conversations with a holder or waiters.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration of one task in a slot. Dropping it leaves the slot and
/// removes the slot when it was the last user.
struct Lease {
    table: LockTable,
    conversation_id: String,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Lease {
    fn join(table: &LockTable, conversation_id: &str) -> Self {
        let gate = {
            let mut slots = table.lock();
            let slot = slots
                .entry(conversation_id.to_string())
                .or_insert_with(|| LockSlot {
                    gate: Arc::new(tokio::sync::Mutex::new(())),
                    users: 0,
                    holder: None,
                });
            slot.users += 1;
            slot.gate.clone()
        };
        Self {
            table: table.clone(),
            conversation_id: conversation_id.to_string(),
            gate,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut slots = self.table.lock();
        if let Some(slot) = slots.get_mut(&self.conversation_id) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                slots.remove(&self.conversation_id);
            }
        }
    }
}

/// Exclusive access to one conversation. Released on drop.
pub struct ConversationGuard {
    // Field order matters: the permit is released before the lease leaves.
    _permit: OwnedMutexGuard<()>,
    lease: Lease,
    entry: LockEntry,
}

impl ConversationGuard {
    fn new(permit: OwnedMutexGuard<()>, lease: Lease) -> Self {
        let entry = LockEntry {
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        if let Some(slot) = lease.table.lock().get_mut(&lease.conversation_id) {
            slot.holder = Some(entry.clone());
        }
        Self {
            _permit: permit,
            lease,
            entry,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.lease.conversation_id
    }

    pub fn entry(&self) -> &LockEntry {
        &self.entry
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        let mut slots = self.lease.table.lock();
        if let Some(slot) = slots.get_mut(&self.lease.conversation_id) {
            if slot.holder.as_ref().map(|h| h.token) == Some(self.entry.token) {
                slot.holder = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_conversation_is_serialized_in_arrival_order() {
        let lock = ConversationLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = lock.lock("c1").await;
        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("c1", || async {
                    order.lock().push(i);
                })
                .await
            }));
            // Let each task enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn test_bodies_never_overlap() {
        let lock = ConversationLock::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                lock.with_lock("c1", || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_conversations_do_not_block() {
        let lock = ConversationLock::new();
        let _held = lock.lock("c1").await;

        let other = tokio::time::timeout(Duration::from_secs(1), lock.lock("c2")).await;
        assert!(other.is_ok());
        assert!(lock.try_lock("c1").is_none());
    }

    #[tokio::test]
    async fn test_holder_is_visible_and_cleared() {
        let lock = ConversationLock::new();
        assert!(lock.holder("c1").is_none());

        let guard = lock.lock("c1").await;
        assert_eq!(lock.holder("c1"), Some(guard.entry().clone()));
        assert_eq!(guard.conversation_id(), "c1");
        drop(guard);

        assert!(!lock.is_locked("c1"));
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_entry() {
        let lock = ConversationLock::new();
        let guard = lock.lock("c1").await;

        let waiter = tokio::time::timeout(Duration::from_millis(20), lock.lock("c1")).await;
        assert!(waiter.is_err());
        drop(guard);

        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_holder_releases_lock() {
        let lock = ConversationLock::new();
        let task_lock = lock.clone();
        let result = tokio::spawn(async move {
            task_lock
                .with_lock("c1", || async {
                    panic!("boom");
                })
                .await
        })
        .await;
        assert!(result.unwrap_err().is_panic());

        let reacquired = tokio::time::timeout(Duration::from_secs(1), lock.lock("c1")).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_injected_table_is_shared() {
        let table: LockTable = Arc::default();
        let a = ConversationLock::with_table(table.clone());
        let b = ConversationLock::with_table(table.clone());

        let _guard = a.lock("c1").await;
        assert!(b.is_locked("c1"));
        assert!(table.lock().contains_key("c1"));
    }
}
