//! # OpenShift provider module
//!
//! This module provide the in-cluster provider implementations used by
//! workshop-style deployments, running databases and caches as workloads in
//! the resource request's own namespace

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::PostParams, core::NamespaceResourceScope, Api, Resource};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::svc::{
    cfg::Configuration,
    k8s::resource,
    provider::{config::Error, ResourceKind, StrategyConfig},
};

pub mod postgres;
pub mod redis;

// -----------------------------------------------------------------------------
// Constants

/// name advertised by every openshift provider implementation and matched
/// against the deployment strategy mapping
pub const DEPLOYMENT_STRATEGY: &str = "openshift";

// -----------------------------------------------------------------------------
// WorkloadSpec structure

/// workload tuning decoded from the raw strategy payload of the in-cluster
/// providers
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct WorkloadSpec {
    #[serde(rename = "image")]
    pub image: Option<String>,
    #[serde(rename = "storage")]
    pub storage: Option<String>,
}

// -----------------------------------------------------------------------------
// ConfigManager structure

/// resolves the [`StrategyConfig`] of one resource kind and tier from the
/// openshift strategy configmap. In-cluster deployment needs no mandatory
/// configuration, a missing store or entry resolves to an empty strategy
pub struct ConfigManager {
    client: kube::Client,
    configmap: String,
    namespace: String,
}

impl ConfigManager {
    pub fn new(client: kube::Client, config: &Arc<Configuration>) -> Self {
        Self {
            client,
            configmap: config.openshift.strategies.to_owned(),
            namespace: config.strategies.namespace.to_owned(),
        }
    }

    pub async fn read_postgres_strategy(&self, tier: &str) -> Result<StrategyConfig, Error> {
        self.read_strategy(ResourceKind::Postgres, tier).await
    }

    pub async fn read_redis_strategy(&self, tier: &str) -> Result<StrategyConfig, Error> {
        self.read_strategy(ResourceKind::Redis, tier).await
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

        let Some(document) = document else {
            debug!(
                kind = kind.to_string(),
                tier = tier,
                "No openshift strategy configured for resource kind, use defaults",
            );

            return Ok(StrategyConfig::default());
        };

        let tiers: BTreeMap<String, StrategyConfig> =
            serde_json::from_str(&document).map_err(|err| Error::Decode(tier.to_string(), err))?;

        Ok(tiers.get(tier).map(ToOwned::to_owned).unwrap_or_default())
    }
}

// -----------------------------------------------------------------------------
// helpers

/// create the workload object only when it does not exist yet, an existing
/// object is left untouched
pub(crate) async fn ensure<T>(client: kube::Client, obj: &T) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + Serialize + DeserializeOwned + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = resource::namespaced_name(obj);

    if resource::get::<T>(client.to_owned(), &namespace, &name)
        .await?
        .is_some()
    {
        return Ok(());
    }

    match Api::namespaced(client, &namespace)
        .create(&PostParams::default(), obj)
        .await
    {
        Ok(_) => Ok(()),
        // created concurrently, which is just as good
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
        Err(err) => Err(err),
    }
}
