//! Subscription sync with the control plane
//!
//! - `client` - the [`ControlPlane`] trait, payload types and the HTTP client
//! - `synchronizer` - the periodic reconcile loop that feeds the registry

pub mod client;
pub mod synchronizer;

pub use client::{
    AgentIdentity, ControlPlane, HttpControlPlane, Subscription, SubscriptionType, SyncError,
};
pub use synchronizer::{SubscriptionSynchronizer, TickOutcome, DEFAULT_INTERVAL};
