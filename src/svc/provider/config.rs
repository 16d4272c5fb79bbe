//! # Strategy store module
//!
//! This module provide the configuration manager mapping a deployment-type
//! name to a per resource-kind provider selection, backed by a configmap

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::PostParams, core::ObjectMeta, Api};
use serde_json::json;
use tracing::{debug, info};

use crate::svc::{
    cfg::Configuration,
    k8s::resource,
    provider::{DeploymentStrategyMapping, ResourceKind},
};

// -----------------------------------------------------------------------------
// Constants

pub const DEPLOYMENT_TYPE_MANAGED: &str = "managed";
pub const DEPLOYMENT_TYPE_WORKSHOP: &str = "workshop";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read strategy configuration from configmap '{0}/{1}', {2}")]
    Read(String, String, #[source] kube::Error),
    #[error("no strategy configuration found for deployment type '{0}'")]
    Missing(String),
    #[error("failed to decode strategy configuration for deployment type '{0}', {1}")]
    Decode(String, #[source] serde_json::Error),
    #[error("strategy configuration for deployment type '{0}' has no provider for resource kind '{1}'")]
    Incomplete(String, ResourceKind),
}

// -----------------------------------------------------------------------------
// helpers

/// returns the strategy store entries seeded when no administrator
/// configuration exists yet
pub fn default_seed() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            DEPLOYMENT_TYPE_MANAGED.to_string(),
            json!({
                "blobstorage": "aws",
                "smtpCredentials": "aws",
                "redis": "aws",
                "postgres": "aws",
            })
            .to_string(),
        ),
        (
            DEPLOYMENT_TYPE_WORKSHOP.to_string(),
            json!({
                "blobstorage": "aws",
                "smtpCredentials": "aws",
                "redis": "openshift",
                "postgres": "openshift",
            })
            .to_string(),
        ),
    ])
}

// -----------------------------------------------------------------------------
// ConfigMapConfigManager structure

/// reads the strategy store and decodes the per deployment-type document into
/// a [`DeploymentStrategyMapping`]. The store and its seeded defaults are
/// injected at construction, there is no process-wide state
pub struct ConfigMapConfigManager {
    client: kube::Client,
    configmap: String,
    namespace: String,
    seed: BTreeMap<String, String>,
}

impl ConfigMapConfigManager {
    pub fn new(
        client: kube::Client,
        configmap: String,
        namespace: String,
        seed: BTreeMap<String, String>,
    ) -> Self {
        Self {
            client,
            configmap,
            namespace,
            seed,
        }
    }

    pub fn with_defaults(client: kube::Client, config: &Configuration) -> Self {
        Self::new(
            client,
            config.strategies.configmap.to_owned(),
            config.strategies.namespace.to_owned(),
            default_seed(),
        )
    }

    /// returns the provider selection for the given deployment type,
    /// re-reading the strategy store on every call
    pub async fn strategy_mapping_for_deployment_type(
        &self,
        deployment_type: &str,
    ) -> Result<DeploymentStrategyMapping, Error> {
        let configmap = self.read_or_seed().await?;

        let document = configmap
            .data
            .as_ref()
            .and_then(|data| data.get(deployment_type))
            .ok_or_else(|| Error::Missing(deployment_type.to_string()))?;

        let mapping: DeploymentStrategyMapping = serde_json::from_str(document)
            .map_err(|err| Error::Decode(deployment_type.to_string(), err))?;

        for kind in [
            ResourceKind::BlobStorage,
            ResourceKind::SmtpCredentials,
            ResourceKind::Redis,
            ResourceKind::Postgres,
        ] {
            if mapping.provider_for(kind).is_empty() {
                return Err(Error::Incomplete(deployment_type.to_string(), kind));
            }
        }

        Ok(mapping)
    }

    /// returns the strategy store configmap, lazily creating the seeded
    /// default when none exists so the operator functions before any
    /// administrator configuration
    async fn read_or_seed(&self) -> Result<ConfigMap, Error> {
        let configmap =
            resource::get::<ConfigMap>(self.client.to_owned(), &self.namespace, &self.configmap)
                .await
                .map_err(|err| {
                    Error::Read(self.namespace.to_owned(), self.configmap.to_owned(), err)
                })?;

        if let Some(configmap) = configmap {
            return Ok(configmap);
        }

        info!(
            namespace = &self.namespace,
            configmap = &self.configmap,
            "Strategy store does not exist, seed it with default provider mappings",
        );

        let api: Api<ConfigMap> = Api::namespaced(self.client.to_owned(), &self.namespace);
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.configmap.to_owned()),
                namespace: Some(self.namespace.to_owned()),
                ..Default::default()
            },
            data: Some(self.seed.to_owned()),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &configmap).await {
            Ok(configmap) => Ok(configmap),
            // another reconciliation seeded the store first, use its entry
            Err(kube::Error::Api(err)) if err.code == 409 => {
                debug!(
                    namespace = &self.namespace,
                    configmap = &self.configmap,
                    "Strategy store was seeded concurrently, re-read it",
                );

                resource::get::<ConfigMap>(
                    self.client.to_owned(),
                    &self.namespace,
                    &self.configmap,
                )
                .await
                .map_err(|err| {
                    Error::Read(self.namespace.to_owned(), self.configmap.to_owned(), err)
                })?
                .ok_or_else(|| {
                    Error::Read(
                        self.namespace.to_owned(),
                        self.configmap.to_owned(),
                        kube::Error::Api(err),
                    )
                })
            }
            Err(err) => Err(Error::Read(
                self.namespace.to_owned(),
                self.configmap.to_owned(),
                err,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::{default_seed, ConfigMapConfigManager, Error};
    use crate::svc::k8s::mock;

    const PATH: &str = "/api/v1/namespaces/kube-system/configmaps/cloud-resource-config";

    fn manager(client: kube::Client) -> ConfigMapConfigManager {
        ConfigMapConfigManager::new(
            client,
            "cloud-resource-config".to_string(),
            "kube-system".to_string(),
            default_seed(),
        )
    }

    #[tokio::test]
    async fn absent_store_is_seeded_with_defaults() {
        let (client, server) = mock::client();
        let handle = server.run(HashMap::new());

        let mapping = manager(client)
            .strategy_mapping_for_deployment_type("managed")
            .await
            .expect("mapping to resolve");

        assert_eq!("aws", &mapping.blob_storage);
        assert_eq!("aws", &mapping.smtp_credentials);
        assert_eq!("aws", &mapping.redis);
        assert_eq!("aws", &mapping.postgres);

        let store = handle.await.expect("mock api server to stop");
        assert!(store.contains_key(PATH), "seeded configmap to be persisted");
    }

    #[tokio::test]
    async fn workshop_defaults_use_openshift_for_databases() {
        let (client, server) = mock::client();
        let _handle = server.run(HashMap::new());

        let mapping = manager(client)
            .strategy_mapping_for_deployment_type("workshop")
            .await
            .expect("mapping to resolve");

        assert_eq!("aws", &mapping.blob_storage);
        assert_eq!("openshift", &mapping.redis);
        assert_eq!("openshift", &mapping.postgres);
    }

    #[tokio::test]
    async fn unknown_deployment_type_is_an_error() {
        let (client, server) = mock::client();
        let _handle = server.run(HashMap::from([(
            PATH.to_string(),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cloud-resource-config", "namespace": "kube-system"},
                "data": {"managed": r#"{"blobstorage":"aws","smtpCredentials":"aws","redis":"aws","postgres":"aws"}"#},
            }),
        )]));

        let result = manager(client)
            .strategy_mapping_for_deployment_type("production")
            .await;

        assert!(matches!(result, Err(Error::Missing(_))));
    }

    #[tokio::test]
    async fn invalid_document_is_a_decode_error() {
        let (client, server) = mock::client();
        let _handle = server.run(HashMap::from([(
            PATH.to_string(),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cloud-resource-config", "namespace": "kube-system"},
                "data": {"managed": "not a json document"},
            }),
        )]));

        let result = manager(client)
            .strategy_mapping_for_deployment_type("managed")
            .await;

        assert!(matches!(result, Err(Error::Decode(_, _))));
    }

    #[tokio::test]
    async fn empty_provider_name_is_rejected() {
        let (client, server) = mock::client();
        let _handle = server.run(HashMap::from([(
            PATH.to_string(),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cloud-resource-config", "namespace": "kube-system"},
                "data": {"managed": r#"{"blobstorage":"aws","smtpCredentials":"aws","redis":"","postgres":"aws"}"#},
            }),
        )]));

        let result = manager(client)
            .strategy_mapping_for_deployment_type("managed")
            .await;

        assert!(matches!(result, Err(Error::Incomplete(_, _))));
    }
}
