use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::client::Client;
use kube::{Resource, ResourceExt};
use tracing::*;

use super::{label_selector, object_meta, MANAGER};
use crate::resources::apps::App;
use crate::runtime::ResourceIdentity;
use crate::{Error, Result};

/// A replica as currently observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replica {
    pub name: String,
    /// Deletion was requested but the replica still exists
    pub terminating: bool,
}

/// Where the replicas of an App live.
///
/// Creating an existing replica and deleting a missing one both succeed, so
/// callers can repeat any sequence of calls after a partial failure.
#[async_trait]
pub trait ReplicaBackend: Send + Sync + 'static {
    async fn list(&self, app: &ResourceIdentity) -> Result<Vec<Replica>>;
    async fn create(&self, app: &App, name: &str) -> Result<()>;
    async fn delete(&self, app: &ResourceIdentity, name: &str) -> Result<()>;
}

pub fn replica_name(app_name: &str, index: usize) -> String {
    format!("{app_name}-{index}")
}

/// Create the missing replicas `0..desired` and delete any others.
pub async fn reconcile_replicas(backend: &dyn ReplicaBackend, app: &App) -> Result<()> {
    let identity = ResourceIdentity::from_resource(app);
    let existing: BTreeSet<String> = backend
        .list(&identity)
        .await?
        .into_iter()
        .map(|replica| replica.name)
        .collect();
    let wanted: BTreeSet<String> = (0..app.desired_replicas())
        .map(|index| replica_name(&identity.name, index))
        .collect();

    for name in wanted.difference(&existing) {
        backend.create(app, name).await?;
    }
    for name in existing.difference(&wanted) {
        backend.delete(&identity, name).await?;
    }
    Ok(())
}

/// Number of replicas that exist and are not terminating
pub async fn live_replicas(backend: &dyn ReplicaBackend, identity: &ResourceIdentity) -> Result<usize> {
    Ok(backend
        .list(identity)
        .await?
        .iter()
        .filter(|replica| !replica.terminating)
        .count())
}

/// Delete every replica of the App, succeeding only once none remain.
///
/// Replicas still shutting down make this fail with
/// [`Error::CleanupPending`], so it gets retried until they are gone.
pub async fn teardown_replicas(backend: &dyn ReplicaBackend, identity: &ResourceIdentity) -> Result<()> {
    for replica in backend.list(identity).await? {
        if !replica.terminating {
            backend.delete(identity, &replica.name).await?;
        }
    }

    let remaining = backend.list(identity).await?;
    if !remaining.is_empty() {
        return Err(Error::CleanupPending {
            identity: identity.to_string(),
            message: format!("{} replica(s) still shutting down", remaining.len()),
        });
    }
    Ok(())
}

/// Replicas as Pods in the App's namespace, owned by the App
pub struct PodReplicas {
    client: Client,
}

impl PodReplicas {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, identity: &ResourceIdentity) -> Api<Pod> {
        match identity.namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl ReplicaBackend for PodReplicas {
    async fn list(&self, app: &ResourceIdentity) -> Result<Vec<Replica>> {
        let pods = self
            .api(app)
            .list(&ListParams::default().labels(&label_selector(&app.name)))
            .await?;
        Ok(pods
            .items
            .iter()
            .map(|pod| Replica {
                name: pod.name_any(),
                terminating: pod.metadata.deletion_timestamp.is_some(),
            })
            .collect())
    }

    async fn create(&self, app: &App, name: &str) -> Result<()> {
        let identity = ResourceIdentity::from_resource(app);
        let owner_reference = app
            .controller_owner_ref(&())
            .ok_or_else(|| Error::MissingName(identity.to_string()))?;

        let mut annotations = app.annotations().clone();
        // if this is set on the app, don't propagate it
        annotations.remove("kubectl.kubernetes.io/last-applied-configuration");

        let base_metadata = ObjectMeta {
            namespace: app.namespace(),
            labels: Some(app.labels().clone()),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        };

        let pod = Pod {
            metadata: object_meta(&base_metadata, &identity.name, name),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    image: Some(app.spec.image.clone()),
                    env: app.spec.foo.as_ref().map(|foo| {
                        vec![EnvVar {
                            name: "FOO".into(),
                            value: Some(foo.clone()),
                            ..Default::default()
                        }]
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let params = PostParams {
            dry_run: false,
            field_manager: Some(MANAGER.to_owned()),
        };
        match self.api(&identity).create(&params, &pod).await {
            Ok(_) => {
                debug!("Created Pod {name} for App {identity}");
                Ok(())
            }
            // a previous attempt got there first
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, app: &ResourceIdentity, name: &str) -> Result<()> {
        match self.api(app).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!("Deleted Pod {name} of App {app}");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
