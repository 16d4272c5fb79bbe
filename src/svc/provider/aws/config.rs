//! # AWS strategy module
//!
//! This module provide the resolution of per resource-kind and tier strategy
//! configuration for the aws providers

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::debug;

use crate::svc::{
    cfg::Configuration,
    k8s::resource,
    provider::{
        aws::DEFAULT_REGION,
        config::Error,
        ResourceKind, StrategyConfig,
    },
};

// -----------------------------------------------------------------------------
// ConfigManager structure

/// resolves the [`StrategyConfig`] of one resource kind and tier from the aws
/// strategy configmap. The store is re-read on every call; a missing store or
/// entry resolves to the defaulted strategy so the operator functions before
/// any administrator configuration exists
pub struct ConfigManager {
    client: kube::Client,
    configmap: String,
    namespace: String,
}

impl ConfigManager {
    pub fn new(client: kube::Client, config: &Arc<Configuration>) -> Self {
        Self {
            client,
            configmap: config.aws.strategies.to_owned(),
            namespace: config.strategies.namespace.to_owned(),
        }
    }

    pub async fn read_blob_storage_strategy(&self, tier: &str) -> Result<StrategyConfig, Error> {
        self.read_strategy(ResourceKind::BlobStorage, tier).await
    }

    pub async fn read_postgres_strategy(&self, tier: &str) -> Result<StrategyConfig, Error> {
        self.read_strategy(ResourceKind::Postgres, tier).await
    }

    pub async fn read_redis_strategy(&self, tier: &str) -> Result<StrategyConfig, Error> {
        self.read_strategy(ResourceKind::Redis, tier).await
    }

    pub async fn read_smtp_credentials_strategy(
        &self,
        tier: &str,
    ) -> Result<StrategyConfig, Error> {
        self.read_strategy(ResourceKind::SmtpCredentials, tier).await
    }

    async fn read_strategy(
        &self,
        kind: ResourceKind,
        tier: &str,
    ) -> Result<StrategyConfig, Error> {
        let configmap =
            resource::get::<ConfigMap>(self.client.to_owned(), &self.namespace, &self.configmap)
                .await
                .map_err(|err| {
                    Error::Read(self.namespace.to_owned(), self.configmap.to_owned(), err)
                })?;

        let document = configmap
            .as_ref()
            .and_then(|configmap| configmap.data.as_ref())
            .and_then(|data| data.get(&kind.to_string()))
            .map(ToOwned::to_owned);

        let mut strategy = match document {
            Some(document) => {
                let tiers: BTreeMap<String, StrategyConfig> = serde_json::from_str(&document)
                    .map_err(|err| Error::Decode(tier.to_string(), err))?;

                tiers.get(tier).map(ToOwned::to_owned).unwrap_or_default()
            }
            None => {
                debug!(
                    kind = kind.to_string(),
                    tier = tier,
                    "No aws strategy configured for resource kind, use defaults",
                );

                StrategyConfig::default()
            }
        };

        if strategy.region.is_empty() {
            debug!(
                kind = kind.to_string(),
                tier = tier,
                region = DEFAULT_REGION,
                "Region not set in deployment strategy configuration, use default region",
            );

            strategy.region = DEFAULT_REGION.to_string();
        }

        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use serde_json::json;

    use super::ConfigManager;
    use crate::svc::{cfg::Configuration, k8s::mock};

    const PATH: &str = "/api/v1/namespaces/kube-system/configmaps/cloud-resources-aws-strategies";

    fn manager(client: kube::Client) -> ConfigManager {
        let configuration =
            Arc::new(Configuration::try_default().expect("configuration to load"));

        ConfigManager::new(client, &configuration)
    }

    fn strategies() -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cloud-resources-aws-strategies", "namespace": "kube-system"},
            "data": {
                "blobstorage": r#"{"managed": {"region": "eu-west-1", "createStrategy": {"bucketName": "custom-bucket"}}}"#,
                "postgres": r#"{"managed": {}}"#,
            },
        })
    }

    #[tokio::test]
    async fn explicit_region_is_never_overridden() {
        let (client, server) = mock::client();
        let _handle = server.run(HashMap::from([(PATH.to_string(), strategies())]));

        let strategy = manager(client)
            .read_blob_storage_strategy("managed")
            .await
            .expect("strategy to resolve");

        assert_eq!("eu-west-1", &strategy.region);
        assert!(strategy.raw_strategy.is_some());
    }

    #[tokio::test]
    async fn omitted_region_falls_back_to_the_default() {
        let (client, server) = mock::client();
        let _handle = server.run(HashMap::from([(PATH.to_string(), strategies())]));

        let strategy = manager(client)
            .read_postgres_strategy("managed")
            .await
            .expect("strategy to resolve");

        assert_eq!(super::DEFAULT_REGION, &strategy.region);
        assert!(strategy.raw_strategy.is_none());
    }

    #[tokio::test]
    async fn absent_store_resolves_to_the_defaulted_strategy() {
        let (client, server) = mock::client();
        let _handle = server.run(HashMap::new());

        let strategy = manager(client)
            .read_redis_strategy("managed")
            .await
            .expect("strategy to resolve");

        assert_eq!(super::DEFAULT_REGION, &strategy.region);
        assert!(strategy.raw_strategy.is_none());
    }
}
