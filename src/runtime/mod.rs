//! A level-triggered reconciliation engine.
//!
//! Events from an event source pass through a [`Predicate`] filter into a
//! deduplicating [`WorkQueue`]. A fixed pool of workers owned by a
//! [`Controller`] pulls identities from the queue and drives the
//! [`Reconciler`] state machine against an [`ObjectStore`], turning each
//! outcome into a scheduling decision.

pub mod backoff;
pub mod controller;
pub mod finalizer;
pub mod identity;
pub mod cluster;
pub mod leadership;
pub mod predicate;
pub mod queue;
pub mod reconciler;
pub mod store;

pub use backoff::ExponentialBackoff;
pub use controller::{Controller, LockKey, Registration};
pub use identity::ResourceIdentity;
pub use leadership::{Leadership, LeadershipHandle};
pub use predicate::{Predicate, PredicateExt, PredicateSet, WatchEvent};
pub use queue::WorkQueue;
pub use reconciler::{reconcile, Action, Reconciler};
pub use store::{MemoryStore, ObjectStore, WriteTarget};
