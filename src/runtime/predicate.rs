use std::sync::Arc;

use kube::{Resource, ResourceExt};

use crate::runtime::identity::ResourceIdentity;

/// A change notification from an event source
#[derive(Debug)]
pub enum WatchEvent<K> {
    Created(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
    /// Originates outside the watch, eg a periodic resync
    Generic(Arc<K>),
}

// derive(Clone) would require K: Clone
impl<K> Clone for WatchEvent<K> {
    fn clone(&self) -> Self {
        match self {
            WatchEvent::Created(obj) => WatchEvent::Created(obj.clone()),
            WatchEvent::Updated { old, new } => WatchEvent::Updated {
                old: old.clone(),
                new: new.clone(),
            },
            WatchEvent::Deleted(obj) => WatchEvent::Deleted(obj.clone()),
            WatchEvent::Generic(obj) => WatchEvent::Generic(obj.clone()),
        }
    }
}

impl<K: Resource> WatchEvent<K> {
    /// The most recent version of the object the event refers to
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Created(obj) | WatchEvent::Deleted(obj) | WatchEvent::Generic(obj) => {
                obj.as_ref()
            }
            WatchEvent::Updated { new, .. } => new.as_ref(),
        }
    }

    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::from_resource(self.object())
    }
}

/// Decides whether an event is admitted to the work queue
pub trait Predicate<K>: Send + Sync {
    fn admit(&self, event: &WatchEvent<K>) -> bool;
}

impl<K, F> Predicate<K> for F
where
    F: Fn(&WatchEvent<K>) -> bool + Send + Sync,
{
    fn admit(&self, event: &WatchEvent<K>) -> bool {
        self(event)
    }
}

pub struct And<A, B>(A, B);

impl<K, A: Predicate<K>, B: Predicate<K>> Predicate<K> for And<A, B> {
    fn admit(&self, event: &WatchEvent<K>) -> bool {
        self.0.admit(event) && self.1.admit(event)
    }
}

pub struct Or<A, B>(A, B);

impl<K, A: Predicate<K>, B: Predicate<K>> Predicate<K> for Or<A, B> {
    fn admit(&self, event: &WatchEvent<K>) -> bool {
        self.0.admit(event) || self.1.admit(event)
    }
}

pub struct Not<A>(A);

impl<K, A: Predicate<K>> Predicate<K> for Not<A> {
    fn admit(&self, event: &WatchEvent<K>) -> bool {
        !self.0.admit(event)
    }
}

pub trait PredicateExt<K>: Predicate<K> + Sized {
    fn and<P: Predicate<K>>(self, other: P) -> And<Self, P> {
        And(self, other)
    }

    fn or<P: Predicate<K>>(self, other: P) -> Or<Self, P> {
        Or(self, other)
    }

    fn not(self) -> Not<Self> {
        Not(self)
    }
}

impl<K, P: Predicate<K>> PredicateExt<K> for P {}

/// All registered predicates must admit an event. An empty set admits everything.
pub struct PredicateSet<K> {
    predicates: Vec<Box<dyn Predicate<K>>>,
}

impl<K> Default for PredicateSet<K> {
    fn default() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }
}

impl<K> PredicateSet<K> {
    pub fn push(&mut self, predicate: impl Predicate<K> + 'static) {
        self.predicates.push(Box::new(predicate));
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl<K> Predicate<K> for PredicateSet<K> {
    fn admit(&self, event: &WatchEvent<K>) -> bool {
        self.predicates.iter().all(|p| p.admit(event))
    }
}

/// Updates pass only if `metadata.generation` changed, which suppresses
/// status-only writes. Other event kinds always pass.
pub fn generation_changed<K: Resource>(event: &WatchEvent<K>) -> bool {
    match event {
        WatchEvent::Updated { old, new } => old.meta().generation != new.meta().generation,
        _ => true,
    }
}

/// Updates pass only if the labels changed
pub fn labels_changed<K: Resource>(event: &WatchEvent<K>) -> bool {
    match event {
        WatchEvent::Updated { old, new } => old.labels() != new.labels(),
        _ => true,
    }
}

/// Updates pass only if the finalizers or the deletion timestamp changed
pub fn finalizers_changed<K: Resource>(event: &WatchEvent<K>) -> bool {
    match event {
        WatchEvent::Updated { old, new } => {
            old.finalizers() != new.finalizers()
                || old.meta().deletion_timestamp != new.meta().deletion_timestamp
        }
        _ => true,
    }
}
