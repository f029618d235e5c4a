use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use tracing::*;

use super::reconcilers::replicas::{
    live_replicas, reconcile_replicas, teardown_replicas, PodReplicas, ReplicaBackend,
};
use super::reconcilers::{APP_INSTANCE_LABEL, APP_MANAGED_BY_LABEL, MANAGER};
use crate::controllers::State;
use crate::metrics::Metrics;
use crate::resources::apps::{App, AppStatus, APP_FINALIZER};
use crate::runtime::cluster::{watch_events, KubeStore};
use crate::runtime::predicate::{finalizers_changed, generation_changed, PredicateExt};
use crate::runtime::store::{modify, WriteTarget};
use crate::runtime::{
    Action, Controller, Leadership, ObjectStore, Reconciler, Registration, ResourceIdentity,
};
use crate::Result;

/// How long to wait before checking again on replicas that are still coming or going
const NOT_READY_REQUEUE: Duration = Duration::from_secs(5);

/// Reconciles an [`App`] into `spec.replicas` replicas
pub struct AppReconciler {
    replicas: Arc<dyn ReplicaBackend>,
}

impl AppReconciler {
    pub fn new(replicas: Arc<dyn ReplicaBackend>) -> Self {
        Self { replicas }
    }
}

#[async_trait]
impl Reconciler for AppReconciler {
    type Resource = App;

    fn finalizer(&self) -> &str {
        APP_FINALIZER
    }

    async fn apply(&self, app: Arc<App>, store: &dyn ObjectStore<App>) -> Result<Action> {
        let identity = ResourceIdentity::from_resource(app.as_ref());
        let desired = app.desired_replicas();

        reconcile_replicas(self.replicas.as_ref(), &app).await?;

        // status reflects what exists now, not what was asked for
        let live = live_replicas(self.replicas.as_ref(), &identity).await?;
        let status = AppStatus {
            replicas: i32::try_from(live).unwrap_or(i32::MAX),
            observed_generation: app.metadata.generation,
        };
        modify(store, &identity, WriteTarget::Status, |latest: &mut App| {
            if latest.status.as_ref() == Some(&status) {
                return false;
            }
            latest.status = Some(status);
            true
        })
        .await?;

        if live == desired {
            debug!("App {identity} has its {desired} replica(s)");
            Ok(Action::await_change())
        } else {
            info!("App {identity} has {live} of {desired} replica(s), checking again shortly");
            Ok(Action::requeue(NOT_READY_REQUEUE))
        }
    }

    async fn cleanup(&self, app: Arc<App>) -> Result<()> {
        let identity = ResourceIdentity::from_resource(app.as_ref());
        teardown_replicas(self.replicas.as_ref(), &identity).await?;
        info!("Removed all replicas of App {identity}");
        Ok(())
    }
}

/// Settings for [`run`], usually taken from the command line
#[derive(Clone, Debug)]
pub struct Settings {
    pub concurrency: usize,
    /// Only watch this namespace; all namespaces if unset
    pub namespace: Option<String>,
    pub leader_election_namespace: String,
    pub leader_election_id: String,
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(client: Client, state: State, settings: Settings) -> Result<()> {
    let (apps, pods): (Api<App>, Api<Pod>) = match settings.namespace.as_deref() {
        Some(namespace) => (
            Api::namespaced(client.clone(), namespace),
            Api::namespaced(client.clone(), namespace),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    if let Err(e) = apps.list(&ListParams::default().limit(1)).await {
        error!("App is not queryable; {e:?}. Is the CRD installed?");
        return Err(e.into());
    }

    let metrics = Metrics::default().register(&state.registry)?;

    // status-only updates are our own writes and need no reconciliation
    let registration = Registration::new(AppReconciler::new(Arc::new(PodReplicas::new(
        client.clone(),
    ))))
    .with_predicate(generation_changed::<App>.or(finalizers_changed::<App>))
    .concurrency(settings.concurrency)
    .leader_election_id(
        settings.leader_election_namespace,
        settings.leader_election_id,
    );
    let store = Arc::new(KubeStore::<App>::new(client));
    let controller = Controller::new(registration, store, metrics, &state)?;

    // all replicas we create have this label
    let owned = watcher::Config::default().labels(&format!("{APP_MANAGED_BY_LABEL}={MANAGER}"));
    let owned_watch = tokio::spawn(trigger_owners(controller.clone(), pods, owned));

    let outcome = controller
        .run(
            watch_events(apps, watcher::Config::default()),
            Leadership::standalone(),
            shutdown_signal(),
        )
        .await;
    owned_watch.abort();
    outcome
}

/// Reconcile the owning App whenever one of its replicas changes
async fn trigger_owners(controller: Controller<AppReconciler>, pods: Api<Pod>, config: watcher::Config) {
    watcher(pods, config)
        .default_backoff()
        .touched_objects()
        .for_each(|pod| {
            match pod {
                Ok(pod) => {
                    if let Some(owner) = owner_of(&pod) {
                        controller.trigger(owner);
                    }
                }
                Err(err) => warn!("Replica watch error: {err}"),
            }
            futures::future::ready(())
        })
        .await;
}

fn owner_of(pod: &Pod) -> Option<ResourceIdentity> {
    let name = pod.labels().get(APP_INSTANCE_LABEL)?;
    let identity = ResourceIdentity::new(name.clone());
    Some(match pod.namespace() {
        Some(namespace) => identity.within(namespace),
        None => identity,
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Received shutdown signal");
}
