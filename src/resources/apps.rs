use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static APP_FINALIZER: &str = "storage.finalizers.tutorial.kubebuilder.io";

/// Represents a set of identical replica pods running one image
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "App",
    group = "aloys.tech",
    version = "v1beta1",
    namespaced,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "AppStatus", shortname = "app")]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// How many replica pods should exist
    #[schemars(range(min = 0))]
    pub replicas: i32,
    /// The container image every replica runs
    pub image: String,
    /// Free-form example field, passed to replicas as the FOO environment variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foo: Option<String>,
}

/// The observed state of an App, recomputed from the live replicas on every reconciliation
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// Number of live (not terminating) replica pods
    pub replicas: i32,
    /// The generation of the spec the status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl App {
    /// Negative replica counts are treated as zero
    pub fn desired_replicas(&self) -> usize {
        usize::try_from(self.spec.replicas).unwrap_or(0)
    }
}
