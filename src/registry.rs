//! Subscription registry - the set of artifact keys currently traced
//!
//! One writer (the synchronizer) and many readers (probe callbacks on
//! arbitrary application threads). Readers only take the read lock for a
//! single membership lookup; the writer applies a whole reconciliation
//! under one write lock, so readers see either the previous set or the
//! next one and never a half-applied diff.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::metrics;

/// Keys added and removed by one reconciliation, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SubscriptionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Concurrent set of subscribed artifact keys.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    keys: RwLock<HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Poison is ignored: no writer leaves the set half-edited.
    fn read(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.keys.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.keys.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Sorted copy of the current keys.
    pub fn snapshot(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns `true` if the key was not present.
    pub fn insert(&self, key: impl Into<String>) -> bool {
        let mut keys = self.write();
        let inserted = keys.insert(key.into());
        metrics::set_active_subscriptions(keys.len());
        inserted
    }

    /// Returns `true` if the key was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut keys = self.write();
        let removed = keys.remove(key);
        metrics::set_active_subscriptions(keys.len());
        removed
    }

    pub fn clear(&self) {
        let mut keys = self.write();
        keys.clear();
        metrics::set_active_subscriptions(0);
    }

    /// Make the set equal to `wanted` and report what changed.
    pub fn reconcile(&self, wanted: &HashSet<String>) -> SubscriptionDiff {
        let mut keys = self.write();

        let mut added: Vec<String> = wanted.difference(&keys).cloned().collect();
        let mut removed: Vec<String> = keys.difference(wanted).cloned().collect();
        added.sort();
        removed.sort();

        for key in &removed {
            keys.remove(key);
        }
        for key in &added {
            keys.insert(key.clone());
        }
        metrics::set_active_subscriptions(keys.len());

        SubscriptionDiff { added, removed }
    }
}
