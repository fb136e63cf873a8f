//! Subscription synchronizer - reconciles the registry with the control plane
//!
//! # Tick
//!
//! ```text
//! tick()
//!   │
//!   ├─ disabled? ─────────────────────────────► Disabled
//!   ├─ ready flag CAS true→false fails? ──────► Skipped   (previous tick still running)
//!   │
//!   ├─ register_liveness ─┐
//!   ├─ fetch_subscriptions┴─ error ───────────► Failed    (registry untouched)
//!   │
//!   ├─ wanted = TRACES ∪ forceSubscription
//!   ├─ registry.reconcile(wanted)  (one write lock)
//!   │
//!   └─ release flag ──────────────────────────► Completed(diff)
//! ```
//!
//! The flag is released by a guard, so a failed or cancelled tick never
//! leaves the synchronizer stuck busy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::{AgentIdentity, ControlPlane, Subscription, SyncError};
use crate::metrics::{self, SUBSCRIPTION_CHANGES, SYNC_TICKS};
use crate::registry::{SubscriptionDiff, SubscriptionRegistry};

/// Default time between ticks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum TickOutcome {
    /// Registry reconciled (the diff may be empty)
    Completed(SubscriptionDiff),
    /// A previous tick was still in flight
    Skipped,
    /// Sync is switched off
    Disabled,
    /// Control plane call failed; registry left as it was
    Failed(SyncError),
}

impl TickOutcome {
    fn label(&self) -> &'static str {
        match self {
            TickOutcome::Completed(_) => "completed",
            TickOutcome::Skipped => "skipped",
            TickOutcome::Disabled => "disabled",
            TickOutcome::Failed(_) => "failed",
        }
    }
}

/// Holds the ready flag for the duration of one tick.
struct TickPermit<'a>(&'a AtomicBool);

impl<'a> TickPermit<'a> {
    fn acquire(ready: &'a AtomicBool) -> Option<Self> {
        ready
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit(ready))
    }
}

impl Drop for TickPermit<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct SubscriptionSynchronizer {
    registry: Arc<SubscriptionRegistry>,
    client: Arc<dyn ControlPlane>,
    identity: AgentIdentity,
    interval: Duration,
    /// true = no tick in flight
    ready: AtomicBool,
    enabled: AtomicBool,
}

impl SubscriptionSynchronizer {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        client: Arc<dyn ControlPlane>,
        identity: AgentIdentity,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            identity,
            interval,
            ready: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Takes effect at the next tick; an in-flight tick completes.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(enabled, "Subscription sync toggled");
        }
        metrics::set_sync_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether a tick is currently in flight.
    pub fn is_busy(&self) -> bool {
        !self.ready.load(Ordering::Acquire)
    }

    /// Run one reconciliation cycle.
    pub async fn tick(&self) -> TickOutcome {
        let outcome = self.run_tick().await;
        SYNC_TICKS.with_label_values(&[outcome.label()]).inc();
        outcome
    }

    async fn run_tick(&self) -> TickOutcome {
        if !self.is_enabled() {
            return TickOutcome::Disabled;
        }
        let Some(_permit) = TickPermit::acquire(&self.ready) else {
            debug!("Previous sync tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let subscriptions = match self.fetch().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                warn!(
                    error = %e,
                    application = %self.identity.application_id,
                    "Subscription sync failed, keeping current subscriptions"
                );
                return TickOutcome::Failed(e);
            }
        };

        let wanted: HashSet<String> = subscriptions
            .into_iter()
            .filter(|s| s.wants_traces())
            .map(|s| s.artifact_qualified_name)
            .collect();

        let diff = self.registry.reconcile(&wanted);
        for key in &diff.added {
            info!(artifact = %key, "Subscription added");
        }
        for key in &diff.removed {
            info!(artifact = %key, "Subscription removed");
        }
        SUBSCRIPTION_CHANGES
            .with_label_values(&["added"])
            .inc_by(diff.added.len() as f64);
        SUBSCRIPTION_CHANGES
            .with_label_values(&["removed"])
            .inc_by(diff.removed.len() as f64);

        TickOutcome::Completed(diff)
    }

    async fn fetch(&self) -> Result<Vec<Subscription>, SyncError> {
        self.client.register_liveness(&self.identity).await?;
        self.client.fetch_subscriptions(&self.identity).await
    }

    /// Start the background sync task
    ///
    /// Ticks on a fixed interval. Each tick is spawned on its own so a slow
    /// control plane cannot push the schedule back; overlapping ticks are
    /// skipped by the ready flag. Aborting the returned handle stops the
    /// loop and any tick still running.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_ms = self.interval.as_millis() as u64,
                instance = %self.identity.instance_id,
                "Subscription sync started"
            );

            // Owned here so aborting the loop also cancels in-flight ticks.
            let mut ticks = JoinSet::new();
            loop {
                interval.tick().await;
                while ticks.try_join_next().is_some() {}
                let sync = Arc::clone(&self);
                ticks.spawn(async move {
                    sync.tick().await;
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::sync::client::SubscriptionType;

    /// Control plane that serves a scripted list, or fails.
    #[derive(Default)]
    struct Scripted {
        response: Mutex<Option<Vec<Subscription>>>,
        liveness_calls: Mutex<usize>,
    }

    impl Scripted {
        fn serve(&self, subs: Vec<Subscription>) {
            *self.response.lock().unwrap() = Some(subs);
        }

        fn fail(&self) {
            *self.response.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl ControlPlane for Scripted {
        async fn register_liveness(&self, _: &AgentIdentity) -> Result<(), SyncError> {
            *self.liveness_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn fetch_subscriptions(&self, _: &AgentIdentity) -> Result<Vec<Subscription>, SyncError> {
            self.response
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| SyncError::Unreachable("connection refused".into()))
        }
    }

    fn synchronizer(client: Arc<Scripted>) -> SubscriptionSynchronizer {
        SubscriptionSynchronizer::new(
            Arc::new(SubscriptionRegistry::new()),
            client,
            AgentIdentity::new("shop", "i-1"),
            DEFAULT_INTERVAL,
        )
    }

    #[tokio::test]
    async fn test_tick_applies_diff() {
        let client = Arc::new(Scripted::default());
        let sync = synchronizer(client.clone());
        sync.registry().insert("A");
        sync.registry().insert("B");

        client.serve(vec![Subscription::traces("B"), Subscription::traces("C")]);
        match sync.tick().await {
            TickOutcome::Completed(diff) => {
                assert_eq!(diff.added, vec!["C"]);
                assert_eq!(diff.removed, vec!["A"]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(sync.registry().snapshot(), vec!["B", "C"]);
        assert_eq!(*client.liveness_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_only_trace_or_forced_entries_are_wanted() {
        let client = Arc::new(Scripted::default());
        let sync = synchronizer(client.clone());

        let mut forced = Subscription::traces("forced");
        forced.subscription_types = vec![SubscriptionType::Metrics];
        forced.force_subscription = true;
        let mut metrics_only = Subscription::traces("metrics");
        metrics_only.subscription_types = vec![SubscriptionType::Metrics];

        client.serve(vec![Subscription::traces("traced"), forced, metrics_only]);
        sync.tick().await;
        assert_eq!(sync.registry().snapshot(), vec!["forced", "traced"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_state_and_releases_flag() {
        let client = Arc::new(Scripted::default());
        let sync = synchronizer(client.clone());
        client.serve(vec![Subscription::traces("A")]);
        sync.tick().await;

        client.fail();
        assert!(matches!(sync.tick().await, TickOutcome::Failed(SyncError::Unreachable(_))));
        assert_eq!(sync.registry().snapshot(), vec!["A"]);
        assert!(!sync.is_busy());

        client.serve(vec![]);
        assert!(matches!(sync.tick().await, TickOutcome::Completed(_)));
        assert!(sync.registry().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_sync_does_nothing() {
        let client = Arc::new(Scripted::default());
        let sync = synchronizer(client.clone());
        client.serve(vec![Subscription::traces("A")]);

        sync.set_enabled(false);
        assert!(matches!(sync.tick().await, TickOutcome::Disabled));
        assert!(sync.registry().is_empty());
        assert_eq!(*client.liveness_calls.lock().unwrap(), 0);

        sync.set_enabled(true);
        assert!(matches!(sync.tick().await, TickOutcome::Completed(_)));
        assert!(sync.registry().contains("A"));
    }

    #[test]
    fn test_permit_is_exclusive_and_released_on_drop() {
        let ready = AtomicBool::new(true);
        let permit = TickPermit::acquire(&ready);
        assert!(permit.is_some());
        assert!(TickPermit::acquire(&ready).is_none());
        drop(permit);
        assert!(TickPermit::acquire(&ready).is_some());
    }
}
