use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use kube::Resource;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::*;

use crate::controllers::{Diagnostics, State};
use crate::metrics::Metrics;
use crate::runtime::backoff::ExponentialBackoff;
use crate::runtime::identity::ResourceIdentity;
use crate::runtime::leadership::Leadership;
use crate::runtime::predicate::{Predicate, PredicateSet, WatchEvent};
use crate::runtime::queue::{WorkQueue, MAX_DELAY};
use crate::runtime::reconciler::{reconcile, Action, Reconciler};
use crate::runtime::store::ObjectStore;
use crate::{telemetry, Error, Result};

/// Workers per controller unless configured otherwise
pub const DEFAULT_CONCURRENCY: usize = 2;

/// The namespace/name of the lock contended for by operator replicas
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Everything the controller needs to know about one resource kind: its
/// reconciler, which events to admit, how many workers to run and which
/// leader election lock guards it.
pub struct Registration<R: Reconciler> {
    reconciler: R,
    predicates: PredicateSet<R::Resource>,
    concurrency: usize,
    leader_election_id: Option<LockKey>,
    backoff: ExponentialBackoff,
}

impl<R: Reconciler> Registration<R> {
    pub fn new(reconciler: R) -> Self {
        Self {
            reconciler,
            predicates: PredicateSet::default(),
            concurrency: DEFAULT_CONCURRENCY,
            leader_election_id: None,
            backoff: ExponentialBackoff::default(),
        }
    }

    /// Events must pass every predicate added
    #[must_use]
    pub fn with_predicate(mut self, predicate: impl Predicate<R::Resource> + 'static) -> Self {
        self.predicates.push(predicate);
        self
    }

    #[must_use]
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    #[must_use]
    pub fn leader_election_id(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.leader_election_id = Some(LockKey {
            namespace: namespace.into(),
            name: name.into(),
        });
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConfiguration(
                "concurrency must be at least 1".into(),
            ));
        }
        if let Some(lock) = &self.leader_election_id {
            if lock.namespace.is_empty() || lock.name.is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "leader election id `{lock}` needs a namespace and a name"
                )));
            }
        }
        if self.backoff.base.is_zero() || self.backoff.base > self.backoff.max {
            return Err(Error::InvalidConfiguration(format!(
                "backoff base {:?} must be positive and at most the max {:?}",
                self.backoff.base, self.backoff.max
            )));
        }
        if self.backoff.max > MAX_DELAY {
            return Err(Error::InvalidConfiguration(format!(
                "backoff max {:?} exceeds the longest supported delay {MAX_DELAY:?}",
                self.backoff.max
            )));
        }
        Ok(())
    }
}

struct Shared<R: Reconciler> {
    reconciler: R,
    predicates: PredicateSet<R::Resource>,
    store: Arc<dyn ObjectStore<R::Resource>>,
    queue: Arc<WorkQueue>,
    concurrency: usize,
    leader_election_id: Option<LockKey>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
}

/// Runs a fixed pool of workers over a shared [`WorkQueue`] for one
/// registered resource kind.
pub struct Controller<R: Reconciler> {
    shared: Arc<Shared<R>>,
}

impl<R: Reconciler> Clone for Controller<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: Reconciler> Controller<R> {
    /// Fails with [`Error::InvalidConfiguration`] on a malformed registration
    pub fn new(
        registration: Registration<R>,
        store: Arc<dyn ObjectStore<R::Resource>>,
        metrics: Metrics,
        state: &State,
    ) -> Result<Self> {
        registration.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                queue: Arc::new(WorkQueue::new(registration.backoff)),
                reconciler: registration.reconciler,
                predicates: registration.predicates,
                concurrency: registration.concurrency,
                leader_election_id: registration.leader_election_id,
                store,
                metrics,
                diagnostics: state.diagnostics.clone(),
            }),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.shared.queue
    }

    pub fn leader_election_id(&self) -> Option<&LockKey> {
        self.shared.leader_election_id.as_ref()
    }

    /// Queue the event's identity if the predicates admit it
    pub fn enqueue(&self, event: &WatchEvent<R::Resource>) -> bool {
        if !self.shared.predicates.admit(event) {
            trace!("Filtered event for {}", event.identity());
            return false;
        }
        self.shared.queue.add(event.identity());
        self.shared
            .metrics
            .set_queue_depth::<R::Resource>(self.shared.queue.len());
        true
    }

    /// Queue an identity without consulting the predicates, for changes to
    /// resources owned by the registered kind
    pub fn trigger(&self, identity: ResourceIdentity) {
        trace!("Triggered {identity}");
        self.shared.queue.add(identity);
        self.shared
            .metrics
            .set_queue_depth::<R::Resource>(self.shared.queue.len());
    }

    /// Run until `shutdown` resolves or leadership is lost.
    ///
    /// Nothing is consumed before leadership is acquired. On the way out the
    /// queue stops handing out work and reconciliations already in flight
    /// are awaited. Losing leadership is reported as [`Error::LeadershipLost`].
    pub async fn run<S, F>(self, events: S, mut leadership: Leadership, shutdown: F) -> Result<()>
    where
        S: Stream<Item = WatchEvent<R::Resource>> + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let kind = R::Resource::kind(&());
        tokio::pin!(shutdown);

        if let Some(lock) = self.leader_election_id() {
            info!("Waiting for leadership of {lock} to reconcile {kind}");
        }
        tokio::select! {
            acquired = leadership.acquired() => {
                if !acquired {
                    return Err(Error::LeadershipLost);
                }
            }
            _ = &mut shutdown => {
                info!("Shut down before acquiring leadership");
                return Ok(());
            }
        }
        info!(
            concurrency = self.shared.concurrency,
            "Starting {kind} controller"
        );

        let intake = tokio::spawn(self.clone().intake(events));
        let workers: Vec<JoinHandle<()>> = (0..self.shared.concurrency)
            .map(|index| tokio::spawn(self.clone().worker(index)))
            .collect();

        let outcome = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down {kind} controller");
                Ok(())
            }
            _ = leadership.lost() => {
                warn!("Lost leadership, stopping {kind} controller");
                Err(Error::LeadershipLost)
            }
        };

        intake.abort();
        self.shared.queue.shut_down();
        for worker in workers {
            if let Err(err) = worker.await {
                error!("Worker failed to stop cleanly: {err}");
            }
        }
        info!("Stopped {kind} controller");
        outcome
    }

    async fn intake<S>(self, events: S)
    where
        S: Stream<Item = WatchEvent<R::Resource>> + Send + 'static,
    {
        events
            .for_each(|event| {
                self.enqueue(&event);
                futures::future::ready(())
            })
            .await;
        warn!("Event source for {} ended", R::Resource::kind(&()));
    }

    async fn worker(self, index: usize) {
        debug!(worker = index, "Worker started");
        while let Some(identity) = self.shared.queue.get().await {
            let result = self.reconcile_isolated(&identity).await;
            self.schedule(&identity, result);
            self.shared.queue.done(&identity);
            self.shared
                .metrics
                .set_queue_depth::<R::Resource>(self.shared.queue.len());
        }
        debug!(worker = index, "Worker stopped");
    }

    /// A panicking reconciliation only fails its own identity
    async fn reconcile_isolated(&self, identity: &ResourceIdentity) -> Result<Action> {
        let shared = self.shared.clone();
        let owned = identity.clone();
        match tokio::spawn(async move { shared.reconcile(&owned).await }).await {
            Ok(result) => result,
            Err(err) => Err(Error::ReconcilerPanicked(err.to_string())),
        }
    }

    fn schedule(&self, identity: &ResourceIdentity, result: Result<Action>) {
        let queue = &self.shared.queue;
        match result {
            Ok(Action::AwaitChange) => queue.forget(identity),
            Ok(Action::Requeue) => queue.add(identity.clone()),
            Ok(Action::RequeueAfter(delay)) => queue.add_after(identity.clone(), delay),
            Err(err) if err.is_conflict() => {
                debug!("Conflict reconciling {identity}, retrying: {err}");
                queue.add(identity.clone());
            }
            Err(err) => {
                warn!("reconcile failed: {:?}", err);
                self.shared
                    .metrics
                    .reconcile_failure::<R::Resource>(identity, &err);
                let delay = queue.add_rate_limited(identity.clone());
                debug!("Retrying {identity} in {delay:?}");
            }
        }
    }
}

impl<R: Reconciler> Shared<R> {
    #[instrument(skip(self), fields(trace_id))]
    async fn reconcile(&self, identity: &ResourceIdentity) -> Result<Action> {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        let _timer = self.metrics.count_and_measure::<R::Resource>();
        self.diagnostics.write().await.last_event = Utc::now();

        info!(
            "Reconciling {} \"{}\"",
            R::Resource::kind(&()),
            identity
        );
        reconcile(&self.reconciler, self.store.as_ref(), identity).await
    }
}
