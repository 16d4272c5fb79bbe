//! # Redis provider
//!
//! This module provide the managed redis provider implementation backed by
//! aws elasticache

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::svc::{
    crd::{redis::Redis, Phase},
    k8s::{finalizer, resource},
    provider::{
        self,
        aws::{
            client::{CacheApiFactory, CreateCacheSpec},
            config::ConfigManager,
            credentials::CredentialManager,
            DEPLOYMENT_STRATEGY,
        },
        poll, Error, RedisDeploymentDetails, RedisInstance, DEFAULT_RECONCILE_TIME,
        PENDING_RECONCILE_TIME,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const REDIS_FINALIZER: &str = "cloud-resources.dev/aws-redis";

const DEFAULT_REDIS_PORT: i32 = 6379;

// -----------------------------------------------------------------------------
// RedisProvider structure

pub struct RedisProvider {
    client: kube::Client,
    strategies: Arc<ConfigManager>,
    credentials: Arc<dyn CredentialManager>,
    factory: Arc<dyn CacheApiFactory>,
}

impl RedisProvider {
    pub fn new(
        client: kube::Client,
        strategies: Arc<ConfigManager>,
        credentials: Arc<dyn CredentialManager>,
        factory: Arc<dyn CacheApiFactory>,
    ) -> Self {
        Self {
            client,
            strategies,
            credentials,
            factory,
        }
    }

    async fn cache_config(
        &self,
        obj: &Redis,
    ) -> Result<(String, CreateCacheSpec, provider::StrategyConfig), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        let strategy = self
            .strategies
            .read_redis_strategy(&obj.spec.tier)
            .await
            .map_err(|err| Error::strategy(obj, &obj.spec.tier, err))?;

        let spec: CreateCacheSpec = match &strategy.raw_strategy {
            Some(raw) => {
                serde_json::from_str(raw.get()).map_err(|err| Error::payload(obj, err))?
            }
            None => CreateCacheSpec::default(),
        };

        let identifier = spec
            .cluster_identifier
            .to_owned()
            .unwrap_or_else(|| format!("{}-{}", namespace, name));

        Ok((identifier, spec, strategy))
    }
}

#[async_trait]
impl provider::RedisProvider for RedisProvider {
    fn name(&self) -> &'static str {
        DEPLOYMENT_STRATEGY
    }

    fn supports_strategy(&self, strategy: &str) -> bool {
        strategy == DEPLOYMENT_STRATEGY
    }

    fn reconcile_time(&self, obj: &Redis) -> Duration {
        match obj.status.as_ref().map(|status| status.phase) {
            Some(Phase::Complete) => DEFAULT_RECONCILE_TIME,
            _ => PENDING_RECONCILE_TIME,
        }
    }

    async fn create_redis(&self, obj: &Redis) -> Result<Option<RedisInstance>, Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: attach the finalizer before any remote side effect

        if !resource::deleted(obj) && !finalizer::contains(obj, REDIS_FINALIZER) {
            info!(
                namespace = &namespace,
                name = &name,
                "Attach finalizer to redis resource",
            );

            let modified = finalizer::add(obj.to_owned(), REDIS_FINALIZER);
            let patch = resource::diff(obj, &modified).map_err(|err| Error::diff(obj, err))?;

            resource::patch(self.client.to_owned(), &modified, patch)
                .await
                .map_err(|err| Error::finalizer(obj, err))?;
        }

        // ---------------------------------------------------------------------
        // Step 2: resolve the strategy and the target cluster identifier

        let (identifier, spec, strategy) = self.cache_config(obj).await?;

        // ---------------------------------------------------------------------
        // Step 3: reconcile provider credentials, the cache itself carries no
        // per-user credentials

        let provider_credentials = self
            .credentials
            .reconcile_provider_credentials(&namespace)
            .await
            .map_err(|err| Error::credentials(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 4: build a session scoped to the resolved region

        debug!(
            namespace = &namespace,
            name = &name,
            region = &strategy.region,
            "Create cache session",
        );

        let api = self.factory.session(&provider_credentials, &strategy.region);

        // ---------------------------------------------------------------------
        // Step 5: poll the list call until freshly issued access keys are
        // visible remotely

        let probe = api.to_owned();
        poll::immediate(poll::DEFAULT_INTERVAL, poll::DEFAULT_CEILING, || {
            let probe = probe.to_owned();
            async move { probe.list_clusters().await.is_ok() }
        })
        .await
        .map_err(|err| Error::timeout(obj, err))?;

        let existing = api
            .list_clusters()
            .await
            .map_err(|err| Error::remote(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 6: create the cluster only when it does not exist yet

        if let Some(cluster) = existing
            .iter()
            .find(|cluster| cluster.identifier == identifier)
        {
            let Some(host) = cluster.host.to_owned() else {
                info!(
                    namespace = &namespace,
                    name = &name,
                    identifier = &identifier,
                    "Cache cluster exists but does not expose an endpoint yet",
                );

                return Ok(None);
            };

            return Ok(Some(RedisInstance {
                deployment_details: Box::new(RedisDeploymentDetails {
                    host,
                    port: cluster
                        .port
                        .or(spec.port)
                        .unwrap_or(DEFAULT_REDIS_PORT),
                }),
            }));
        }

        info!(
            namespace = &namespace,
            name = &name,
            identifier = &identifier,
            "Cache cluster not found, create it",
        );

        api.create_cluster(&identifier, &spec)
            .await
            .map_err(|err| Error::remote(obj, err))?;

        Ok(None)
    }

    async fn delete_redis(&self, obj: &Redis) -> Result<(), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: re-resolve the strategy and provider credentials

        let (identifier, _, strategy) = self.cache_config(obj).await?;

        let provider_credentials = self
            .credentials
            .reconcile_provider_credentials(&namespace)
            .await
            .map_err(|err| Error::credentials(obj, err))?;

        let api = self.factory.session(&provider_credentials, &strategy.region);

        // ---------------------------------------------------------------------
        // Step 2: delete the cluster, an already absent cluster is a success

        info!(
            namespace = &namespace,
            name = &name,
            identifier = &identifier,
            "Delete cache cluster",
        );

        match api.delete_cluster(&identifier).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(
                    namespace = &namespace,
                    name = &name,
                    identifier = &identifier,
                    "Cache cluster is already absent",
                );
            }
            Err(err) => return Err(Error::remote(obj, err)),
        }

        // ---------------------------------------------------------------------
        // Step 3: wait for confirmed absence

        let probe = api.to_owned();
        let target = identifier.to_owned();
        poll::immediate(poll::DEFAULT_INTERVAL, poll::DEFAULT_CEILING, || {
            let probe = probe.to_owned();
            let target = target.to_owned();
            async move { matches!(probe.cluster_exists(&target).await, Ok(false)) }
        })
        .await
        .map_err(|err| Error::timeout(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 4: release the finalizer, this must stay the last step

        info!(
            namespace = &namespace,
            name = &name,
            "Remove finalizer from redis resource",
        );

        let modified = finalizer::remove(obj.to_owned(), REDIS_FINALIZER);
        let patch = resource::diff(obj, &modified).map_err(|err| Error::diff(obj, err))?;

        resource::patch(self.client.to_owned(), &modified, patch)
            .await
            .map_err(|err| Error::finalizer(obj, err))?;

        Ok(())
    }
}
