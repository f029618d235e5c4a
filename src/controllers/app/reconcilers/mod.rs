use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub mod replicas;

pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGER: &str = "app-operator";

// mandatory_labels returns labels applied to every replica on top of the App labels;
// replicas are found again by these, so they must not change
pub fn mandatory_labels(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        (APP_INSTANCE_LABEL.into(), app_name.into()),
        (APP_MANAGED_BY_LABEL.into(), MANAGER.into()),
    ])
}

pub fn label_selector(app_name: &str) -> String {
    mandatory_labels(app_name)
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn object_meta(base_metadata: &ObjectMeta, app_name: &str, name: impl Into<String>) -> ObjectMeta {
    let mut meta = base_metadata.clone();
    meta.name = Some(name.into());
    meta.labels
        .get_or_insert_with(Default::default)
        .extend(mandatory_labels(app_name));
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_mandatory_labels() {
        assert_eq!(
            label_selector("web"),
            "app.kubernetes.io/instance=web,app.kubernetes.io/managed-by=app-operator"
        );
    }

    #[test]
    fn object_meta_keeps_base_labels() {
        let base = ObjectMeta {
            labels: Some(BTreeMap::from([("team".to_string(), "a".to_string())])),
            ..Default::default()
        };
        let meta = object_meta(&base, "web", "web-0");
        assert_eq!(meta.name.as_deref(), Some("web-0"));
        let labels = meta.labels.unwrap();
        assert_eq!(labels["team"], "a");
        assert_eq!(labels[APP_INSTANCE_LABEL], "web");
    }
}
