//! Reconcile engine
//!
//! Each reconciler runs on a kube-runtime `Controller`: watched changes are
//! mapped to keys, a key is reconciled by one task at a time, failures back
//! off per key, and a success may ask for a requeue after a delay. One
//! [`Shutdown`] stops every controller and reflector.

pub mod backoff;
pub mod cache;
pub mod runner;
pub mod shutdown;

pub use backoff::{calculate_backoff, RateLimiter};
pub use cache::{controller_owner_key, reflect, wait_for_cache_sync};
pub use runner::{error_policy, reconcile, run, Action, Context, ObjectKey, Reconciler};
pub use shutdown::{Shutdown, ShutdownSignal};
