use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Resource;
use tracing::*;

use crate::runtime::finalizer::{add_finalizer, has_finalizer, is_terminating, remove_finalizer};
use crate::runtime::identity::ResourceIdentity;
use crate::runtime::store::ObjectStore;
use crate::Result;

/// What to do with an identity after a successful reconciliation. Failures
/// are expressed as `Err` and retried with backoff instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next change event
    AwaitChange,
    /// Reconcile again immediately
    Requeue,
    /// Reconcile again after the delay
    RequeueAfter(Duration),
}

impl Action {
    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue(after: Duration) -> Self {
        Action::RequeueAfter(after)
    }

    pub fn requeue_now() -> Self {
        Action::Requeue
    }
}

/// Domain logic for one resource kind.
///
/// Both operations may be invoked any number of times, concurrently with
/// nothing for the same object, and by a different process than the one
/// that invoked them last. They must derive everything from the object
/// passed in and from the external systems they manage.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Resource: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static;

    /// The token that keeps objects around until [`Reconciler::cleanup`] succeeded
    fn finalizer(&self) -> &str;

    /// Converge external state towards the spec of an active object and
    /// persist a freshly computed status
    async fn apply(
        &self,
        obj: Arc<Self::Resource>,
        store: &dyn ObjectStore<Self::Resource>,
    ) -> Result<Action>;

    /// Tear down whatever external state the object owns. Partial progress
    /// from earlier attempts must be tolerated.
    async fn cleanup(&self, obj: Arc<Self::Resource>) -> Result<()>;
}

/// Reconcile the object with the given identity once.
///
/// Vanished objects are converged. Active objects first get the finalizer
/// (and nothing else; the write triggers another pass), then
/// [`Reconciler::apply`]. Terminating objects holding the finalizer get
/// [`Reconciler::cleanup`], and the finalizer is only removed once that
/// succeeded.
pub async fn reconcile<R: Reconciler + ?Sized>(
    reconciler: &R,
    store: &dyn ObjectStore<R::Resource>,
    identity: &ResourceIdentity,
) -> Result<Action> {
    let Some(obj) = store.get(identity).await? else {
        debug!("{identity} no longer exists");
        return Ok(Action::await_change());
    };
    let obj = Arc::new(obj);
    let finalizer = reconciler.finalizer();

    if !is_terminating(obj.as_ref()) {
        if !has_finalizer(obj.as_ref(), finalizer) {
            add_finalizer(store, identity, finalizer).await?;
            return Ok(Action::await_change());
        }
        return reconciler.apply(obj, store).await;
    }

    if !has_finalizer(obj.as_ref(), finalizer) {
        trace!("{identity} is terminating and has no {finalizer} finalizer");
        return Ok(Action::await_change());
    }
    info!("Cleaning up {identity}");
    reconciler.cleanup(obj).await?;
    remove_finalizer(store, identity, finalizer).await?;
    Ok(Action::await_change())
}
