use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::*;

use crate::runtime::identity::ResourceIdentity;
use crate::runtime::predicate::WatchEvent;
use crate::{Error, Result};

/// Access to the authoritative copy of managed objects.
///
/// Writes carry the object's `resourceVersion` and must fail with
/// [`Error::Conflict`] (or a 409 API error) if it is stale.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync + 'static {
    /// The latest version of the object, or `None` if it no longer exists
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<K>>;

    /// Replace the object's metadata and spec
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace the object's status
    async fn update_status(&self, obj: &K) -> Result<K>;
}

/// Which part of the object a write targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteTarget {
    Object,
    Status,
}

/// Read the latest revision of an object, apply `mutate` and write it back.
///
/// `mutate` returns whether it changed anything; no write happens if it
/// didn't. Returns `None` if the object no longer exists. A concurrent writer
/// surfaces as a conflict error rather than being overwritten.
pub async fn modify<K, F>(
    store: &dyn ObjectStore<K>,
    identity: &ResourceIdentity,
    target: WriteTarget,
    mutate: F,
) -> Result<Option<K>>
where
    K: Send + Sync + 'static,
    F: FnOnce(&mut K) -> bool + Send,
{
    let Some(mut latest) = store.get(identity).await? else {
        return Ok(None);
    };
    if !mutate(&mut latest) {
        return Ok(Some(latest));
    }
    let written = match target {
        WriteTarget::Object => store.update(&latest).await?,
        WriteTarget::Status => store.update_status(&latest).await?,
    };
    Ok(Some(written))
}

struct MemoryState<K> {
    objects: BTreeMap<ResourceIdentity, K>,
    revision: u64,
}

/// An in-process object store with Kubernetes write semantics: revisions,
/// optimistic concurrency, generation tracking, a status subresource and
/// finalizer-gated deletion. Every change is broadcast as a [`WatchEvent`].
pub struct MemoryStore<K> {
    state: Mutex<MemoryState<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> Default for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                revision: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: WatchEvent<K>) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Stream of every change made from now on
    pub fn watch(&self) -> impl Stream<Item = WatchEvent<K>> + Send + 'static {
        futures::stream::unfold(self.events.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Watch lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn create(&self, obj: &K) -> Result<K> {
        let identity = identity_of(obj)?;
        let created = {
            let mut state = self.lock();
            if state.objects.contains_key(&identity) {
                return Err(Error::AlreadyExists(identity.to_string()));
            }
            state.revision += 1;
            let mut created = obj.clone();
            let meta = created.meta_mut();
            meta.resource_version = Some(state.revision.to_string());
            meta.generation = Some(1);
            meta.uid = Some(format!("uid-{}", state.revision));
            meta.deletion_timestamp = None;
            state.objects.insert(identity, created.clone());
            created
        };
        self.publish(WatchEvent::Created(Arc::new(created.clone())));
        Ok(created)
    }

    /// Request deletion. Objects with finalizers are only marked with a
    /// deletion timestamp; the rest are removed immediately.
    pub fn delete(&self, identity: &ResourceIdentity) -> Result<()> {
        let event = {
            let mut state = self.lock();
            let Some(current) = state.objects.get(identity).cloned() else {
                return Err(Error::ObjectNotFound(identity.to_string()));
            };
            if current.finalizers().is_empty() {
                state.objects.remove(identity);
                WatchEvent::Deleted(Arc::new(current))
            } else if current.meta().deletion_timestamp.is_some() {
                return Ok(());
            } else {
                state.revision += 1;
                let mut terminating = current.clone();
                terminating.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                terminating.meta_mut().resource_version = Some(state.revision.to_string());
                state.objects.insert(identity.clone(), terminating.clone());
                WatchEvent::Updated {
                    old: Arc::new(current),
                    new: Arc::new(terminating),
                }
            }
        };
        self.publish(event);
        Ok(())
    }

    /// Snapshot of the stored object
    pub fn peek(&self, identity: &ResourceIdentity) -> Option<K> {
        self.lock().objects.get(identity).cloned()
    }

    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.lock().objects.contains_key(identity)
    }

    fn write(&self, obj: &K, target: WriteTarget) -> Result<K> {
        let identity = identity_of(obj)?;
        let (event, written) = {
            let mut state = self.lock();
            let Some(current) = state.objects.get(&identity).cloned() else {
                return Err(Error::ObjectNotFound(identity.to_string()));
            };
            if obj.resource_version() != current.resource_version() {
                return Err(Error::Conflict(identity.to_string()));
            }

            let current_value = serde_json::to_value(&current)?;
            let mut next_value = serde_json::to_value(obj)?;
            match target {
                WriteTarget::Object => {
                    // status is only writable through the status subresource
                    replace_field(&mut next_value, "status", current_value.get("status"));
                }
                WriteTarget::Status => {
                    let status = next_value.get("status").cloned();
                    next_value = current_value.clone();
                    replace_field(&mut next_value, "status", status.as_ref());
                }
            }
            if next_value == current_value {
                return Ok(current);
            }

            let mut next: K = serde_json::from_value(next_value.clone())?;
            // the deletion timestamp can't be set or cleared through an update
            next.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
            next.meta_mut().uid = current.meta().uid.clone();
            let spec_changed = next_value.get("spec") != current_value.get("spec");
            let generation = current.meta().generation.unwrap_or(1);
            next.meta_mut().generation = Some(if spec_changed {
                generation + 1
            } else {
                generation
            });
            state.revision += 1;
            next.meta_mut().resource_version = Some(state.revision.to_string());

            if next.meta().deletion_timestamp.is_some() && next.finalizers().is_empty() {
                debug!("Finalizers of {identity} are empty, removing it");
                state.objects.remove(&identity);
                (WatchEvent::Deleted(Arc::new(next.clone())), next)
            } else {
                state.objects.insert(identity, next.clone());
                (
                    WatchEvent::Updated {
                        old: Arc::new(current),
                        new: Arc::new(next.clone()),
                    },
                    next,
                )
            }
        };
        self.publish(event);
        Ok(written)
    }
}

fn replace_field(value: &mut serde_json::Value, key: &str, field: Option<&serde_json::Value>) {
    if let Some(object) = value.as_object_mut() {
        match field {
            Some(field) => {
                object.insert(key.to_owned(), field.clone());
            }
            None => {
                object.remove(key);
            }
        }
    }
}

fn identity_of<K: Resource>(obj: &K) -> Result<ResourceIdentity> {
    if obj.meta().name.is_none() {
        return Err(Error::MissingName(format!("{:?}", obj.meta())));
    }
    Ok(ResourceIdentity::from_resource(obj))
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<K>> {
        Ok(self.peek(identity))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.write(obj, WriteTarget::Object)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        self.write(obj, WriteTarget::Status)
    }
}
