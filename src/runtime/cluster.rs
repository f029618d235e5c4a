//! Adapters between the engine and a Kubernetes API server

use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::*;

use crate::runtime::identity::ResourceIdentity;
use crate::runtime::predicate::WatchEvent;
use crate::runtime::store::ObjectStore;
use crate::{Error, Result};

/// An [`ObjectStore`] reading and writing through the API server.
///
/// The API server enforces `resourceVersion` on every write, so stale
/// writes come back as [`Error::Conflict`].
pub struct KubeStore<K> {
    client: Client,
    _resource_type: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _resource_type: PhantomData,
        }
    }

    fn api(&self, identity: &ResourceIdentity) -> Result<Api<K>> {
        match identity.namespace.as_deref() {
            Some(namespace) => Ok(Api::namespaced(self.client.clone(), namespace)),
            None => Err(Error::InvalidConfiguration(format!(
                "{} is namespaced but {identity} has no namespace",
                K::kind(&())
            ))),
        }
    }
}

fn write_error(identity: &ResourceIdentity, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 409 => {
            Error::Conflict(identity.to_string())
        }
        kube::Error::Api(response) if response.code == 404 => {
            Error::ObjectNotFound(identity.to_string())
        }
        err => Error::KubeError(err),
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, identity: &ResourceIdentity) -> Result<Option<K>> {
        Ok(self.api(identity)?.get_opt(&identity.name).await?)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let identity = ResourceIdentity::from_resource(obj);
        self.api(&identity)?
            .replace(&identity.name, &PostParams::default(), obj)
            .await
            .map_err(|err| write_error(&identity, err))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let identity = ResourceIdentity::from_resource(obj);
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        // carrying the resourceVersion makes the API server reject stale patches
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        self.api(&identity)?
            .patch_status(&identity.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|err| write_error(&identity, err))
    }
}

/// Turn a watch on `api` into [`WatchEvent`]s.
///
/// The last seen version of each object is kept so updates carry the
/// previous version for predicates. Watch errors are retried with backoff.
pub fn watch_events<K>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = WatchEvent<K>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut seen = SeenObjects::default();
    watcher(api, config)
        .default_backoff()
        .flat_map(move |event| {
            let events = match event {
                Ok(event) => seen.observe(event),
                Err(err) => {
                    warn!("Watch error: {err}");
                    Vec::new()
                }
            };
            futures::stream::iter(events)
        })
}

/// The latest version of every object the watch has delivered.
///
/// A relist builds a fresh map and swaps it in once complete, so objects
/// deleted while the watch was down are reported as deleted instead of
/// lingering.
struct SeenObjects<K> {
    current: HashMap<ResourceIdentity, Arc<K>>,
    relisting: Option<HashMap<ResourceIdentity, Arc<K>>>,
}

impl<K> Default for SeenObjects<K> {
    fn default() -> Self {
        Self {
            current: HashMap::new(),
            relisting: None,
        }
    }
}

impl<K: Resource> SeenObjects<K> {
    fn observe(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let obj = Arc::new(obj);
                let identity = ResourceIdentity::from_resource(obj.as_ref());
                if let Some(relisting) = self.relisting.as_mut() {
                    relisting.insert(identity.clone(), obj.clone());
                }
                vec![match self.current.insert(identity, obj.clone()) {
                    Some(old) => WatchEvent::Updated { old, new: obj },
                    None => WatchEvent::Created(obj),
                }]
            }
            watcher::Event::Delete(obj) => {
                let identity = ResourceIdentity::from_resource(&obj);
                self.current.remove(&identity);
                if let Some(relisting) = self.relisting.as_mut() {
                    relisting.remove(&identity);
                }
                vec![WatchEvent::Deleted(Arc::new(obj))]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisting.take() else {
                    return Vec::new();
                };
                let previous = std::mem::replace(&mut self.current, relisted);
                previous
                    .into_iter()
                    .filter(|(identity, _)| !self.current.contains_key(identity))
                    .map(|(_, obj)| WatchEvent::Deleted(obj))
                    .collect()
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.current.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::apps::{App, AppSpec, AppStatus};
    use assert_json_diff::assert_json_include;
    use http::{Request, Response};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use kube::client::Body;
    use serde_json::Value;

    type Handle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    fn mock_client() -> (Client, Handle) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(mock_service, "default"), handle)
    }

    fn status_response(code: u16, reason: &str) -> Response<Body> {
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code,
        });
        Response::builder()
            .status(code)
            .body(Body::from(serde_json::to_vec(&status).unwrap()))
            .unwrap()
    }

    fn object_response(obj: &impl Serialize) -> Response<Body> {
        Response::builder()
            .body(Body::from(serde_json::to_vec(obj).unwrap()))
            .unwrap()
    }

    fn id(name: &str) -> ResourceIdentity {
        ResourceIdentity::new(name).within("default")
    }

    fn config_map(name: &str, resource_version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some(resource_version.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn get_treats_404_as_vanished() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/default/configmaps/a"
            );
            send.send_response(status_response(404, "NotFound"));
        });
        let store = KubeStore::<ConfigMap>::new(client);
        assert!(store.get(&id("a")).await.unwrap().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn update_sends_revision_and_maps_409_to_conflict() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PUT);
            let body = request.into_body().collect_bytes().await.unwrap();
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert_json_include!(
                actual: body,
                expected: json!({"metadata": {"name": "a", "resourceVersion": "7"}})
            );
            send.send_response(status_response(409, "Conflict"));
        });
        let store = KubeStore::<ConfigMap>::new(client);
        let err = store.update(&config_map("a", "7")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn update_status_patches_status_subresource() {
        let (client, mut handle) = mock_client();
        let mut app = App::new(
            "a",
            AppSpec {
                replicas: 3,
                image: "nginx".into(),
                foo: None,
            },
        );
        app.metadata.namespace = Some("default".into());
        app.metadata.resource_version = Some("11".into());
        app.status = Some(AppStatus {
            replicas: 3,
            observed_generation: Some(2),
        });
        let response = app.clone();

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().path(),
                "/apis/aloys.tech/v1beta1/namespaces/default/apps/a/status"
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert_json_include!(
                actual: body,
                expected: json!({
                    "metadata": {"resourceVersion": "11"},
                    "status": {"replicas": 3, "observedGeneration": 2},
                })
            );
            send.send_response(object_response(&response));
        });
        let store = KubeStore::<App>::new(client);
        let written = store.update_status(&app).await.unwrap();
        assert_eq!(written.status.map(|s| s.replicas), Some(3));
        server.await.unwrap();
    }

    #[test]
    fn classifies_watch_events() {
        let mut seen = SeenObjects::default();
        assert!(seen.observe(watcher::Event::Init).is_empty());
        assert!(matches!(
            &seen.observe(watcher::Event::InitApply(config_map("a", "1")))[..],
            [WatchEvent::Created(_)]
        ));
        assert!(seen.observe(watcher::Event::InitDone).is_empty());
        match &seen.observe(watcher::Event::Apply(config_map("a", "2")))[..] {
            [WatchEvent::Updated { old, new }] => {
                assert_eq!(old.resource_version().as_deref(), Some("1"));
                assert_eq!(new.resource_version().as_deref(), Some("2"));
            }
            other => panic!("expected an update, got {other:?}"),
        }
        assert!(matches!(
            &seen.observe(watcher::Event::Delete(config_map("a", "3")))[..],
            [WatchEvent::Deleted(_)]
        ));
        assert_eq!(seen.len(), 0);
    }

    #[test]
    fn relist_reports_objects_deleted_while_disconnected() {
        let mut seen = SeenObjects::default();
        seen.observe(watcher::Event::Init);
        seen.observe(watcher::Event::InitApply(config_map("a", "1")));
        seen.observe(watcher::Event::InitApply(config_map("b", "2")));
        seen.observe(watcher::Event::InitDone);
        assert_eq!(seen.len(), 2);

        // the watch restarts and "b" is gone from the relist
        seen.observe(watcher::Event::Init);
        assert!(matches!(
            &seen.observe(watcher::Event::InitApply(config_map("a", "3")))[..],
            [WatchEvent::Updated { .. }]
        ));
        let deleted = seen.observe(watcher::Event::InitDone);
        match &deleted[..] {
            [WatchEvent::Deleted(obj)] => assert_eq!(obj.name_any(), "b"),
            other => panic!("expected b to be deleted, got {other:?}"),
        }
        assert_eq!(seen.len(), 1);
    }
}
