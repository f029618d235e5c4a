use kube::{Resource, ResourceExt};
use tracing::*;

use crate::runtime::identity::ResourceIdentity;
use crate::runtime::store::{modify, ObjectStore, WriteTarget};
use crate::Result;

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

pub fn is_terminating<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Append the finalizer to the latest revision of the object.
///
/// Nothing is written if the token is already present or the object has
/// started terminating, since a terminating object can't take on new
/// finalizers. Returns whether a write happened.
pub async fn add_finalizer<K>(
    store: &dyn ObjectStore<K>,
    identity: &ResourceIdentity,
    finalizer: &str,
) -> Result<bool>
where
    K: Resource + Send + Sync + 'static,
{
    let mut added = false;
    modify(store, identity, WriteTarget::Object, |obj: &mut K| {
        if is_terminating(obj) || has_finalizer(obj, finalizer) {
            return false;
        }
        obj.finalizers_mut().push(finalizer.to_owned());
        added = true;
        true
    })
    .await?;
    if added {
        debug!("Added finalizer {finalizer} to {identity}");
    }
    Ok(added)
}

/// Remove every occurrence of the finalizer from the latest revision of the
/// object. Returns whether a write happened.
pub async fn remove_finalizer<K>(
    store: &dyn ObjectStore<K>,
    identity: &ResourceIdentity,
    finalizer: &str,
) -> Result<bool>
where
    K: Resource + Send + Sync + 'static,
{
    let mut removed = false;
    modify(store, identity, WriteTarget::Object, |obj: &mut K| {
        if !has_finalizer(obj, finalizer) {
            return false;
        }
        obj.finalizers_mut().retain(|f| f != finalizer);
        removed = true;
        true
    })
    .await?;
    if removed {
        debug!("Removed finalizer {finalizer} from {identity}");
    }
    Ok(removed)
}
