use std::fmt;

use kube::{Resource, ResourceExt};

/// The identity of a managed object within its kind, used as the work queue key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    #[test]
    fn displays_namespaced_identity() {
        assert_eq!(ResourceIdentity::new("a").within("ns").to_string(), "ns/a");
        assert_eq!(ResourceIdentity::new("a").to_string(), "a");
    }

    #[test]
    fn identity_from_resource_is_structural() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".into()),
                namespace: Some("default".into()),
                resource_version: Some("12".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            ResourceIdentity::from_resource(&cm),
            ResourceIdentity::new("settings").within("default")
        );
    }
}
