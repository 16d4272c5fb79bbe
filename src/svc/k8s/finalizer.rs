//! # Finalizer module
//!
//! This module provide helpers methods to interact with kubernetes' resource
//! finalizer

use kube::Resource;

/// returns if there is the given finalizer on the resource
pub fn contains<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    match &obj.meta().finalizers {
        Some(finalizers) => finalizers.iter().any(|f| finalizer == f),
        None => false,
    }
}

/// add finalizer to the resource
pub fn add<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if !contains(&obj, finalizer) {
        obj.meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.into());
    }

    obj
}

/// remove finalizer from the resource
pub fn remove<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if let Some(finalizers) = &obj.meta().finalizers {
        obj.meta_mut().finalizers = Some(
            finalizers
                .iter()
                .filter(|f| *f != finalizer)
                .cloned()
                .collect(),
        );
    }

    obj
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ObjectMeta;

    use super::{add, contains, remove};

    fn object() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("object".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn add_is_idempotent() {
        let obj = add(object(), "cloud-resources.dev/test");
        let obj = add(obj, "cloud-resources.dev/test");

        assert!(contains(&obj, "cloud-resources.dev/test"));
        assert_eq!(Some(1), obj.metadata.finalizers.as_ref().map(Vec::len));
    }

    #[test]
    fn remove_keeps_other_finalizers() {
        let obj = add(object(), "cloud-resources.dev/test");
        let obj = add(obj, "cloud-resources.dev/other");
        let obj = remove(obj, "cloud-resources.dev/test");

        assert!(!contains(&obj, "cloud-resources.dev/test"));
        assert!(contains(&obj, "cloud-resources.dev/other"));
    }

    #[test]
    fn remove_without_finalizers_is_noop() {
        let obj = remove(object(), "cloud-resources.dev/test");

        assert!(!contains(&obj, "cloud-resources.dev/test"));
    }
}
