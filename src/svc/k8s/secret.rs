//! # Secret module
//!
//! This module provide helpers to persist deployment details of a provisioned
//! resource as a kubernetes secret

use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{api::ObjectMeta, CustomResourceExt, ResourceExt};

use crate::svc::k8s::resource;

/// returns the default name of the secret holding the deployment details of
/// the given resource
pub fn name<T>(obj: &T) -> String
where
    T: ResourceExt,
{
    format!("{}-secrets", obj.name_any())
}

/// returns a secret owned by the given resource holding the given deployment
/// details, so that kubernetes garbage-collects it along with its owner
pub fn new<T>(obj: &T, name: &str, data: BTreeMap<String, Vec<u8>>) -> Secret
where
    T: ResourceExt + CustomResourceExt,
{
    let owner = resource::owner_reference(obj);
    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: obj.namespace(),
        owner_references: Some(vec![owner]),
        ..Default::default()
    };

    Secret {
        metadata,
        data: Some(
            data.into_iter()
                .map(|(key, value)| (key, ByteString(value)))
                .collect(),
        ),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    use super::{name, new};
    use crate::svc::crd::postgres::{Postgres, Spec};

    fn postgres() -> Postgres {
        let mut obj = Postgres::new(
            "mydb",
            Spec {
                tier: "managed".to_string(),
                secret_name: None,
            },
        );

        obj.metadata = ObjectMeta {
            name: Some("mydb".to_string()),
            namespace: Some("ns1".to_string()),
            uid: Some("aaaa-bbbb".to_string()),
            ..Default::default()
        };

        obj
    }

    #[test]
    fn secret_name_defaults_to_resource_name() {
        assert_eq!("mydb-secrets", &name(&postgres()));
    }

    #[test]
    fn secret_is_owned_and_carries_data() {
        let obj = postgres();
        let secret = new(
            &obj,
            &name(&obj),
            BTreeMap::from([("host".to_string(), b"localhost".to_vec())]),
        );

        let owners = secret
            .metadata
            .owner_references
            .expect("secret to be owned");
        assert_eq!(1, owners.len());
        assert_eq!("mydb", &owners[0].name);
        assert_eq!("Postgres", &owners[0].kind);

        let data = secret.data.expect("secret to hold data");
        assert_eq!(b"localhost".to_vec(), data["host"].0);
    }
}
