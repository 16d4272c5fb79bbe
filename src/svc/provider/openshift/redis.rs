//! # Redis provider
//!
//! This module provide the in-cluster redis provider implementation, running
//! the cache as a deployment in the resource request's namespace

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort,
            ServiceSpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::api::ObjectMeta;
use tracing::info;

use crate::svc::{
    crd::{redis::Redis, Phase},
    k8s::{finalizer, resource},
    provider::{
        self,
        openshift::{ensure, ConfigManager, WorkloadSpec, DEPLOYMENT_STRATEGY},
        poll, Error, RedisDeploymentDetails, RedisInstance, DEFAULT_RECONCILE_TIME,
        PENDING_RECONCILE_TIME,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const REDIS_FINALIZER: &str = "cloud-resources.dev/openshift-redis";

pub const DEFAULT_REDIS_IMAGE: &str = "docker.io/library/redis:6";

const REDIS_PORT: i32 = 6379;

// -----------------------------------------------------------------------------
// RedisProvider structure

pub struct RedisProvider {
    client: kube::Client,
    strategies: Arc<ConfigManager>,
}

impl RedisProvider {
    pub fn new(client: kube::Client, strategies: Arc<ConfigManager>) -> Self {
        Self { client, strategies }
    }
}

// -----------------------------------------------------------------------------
// helpers

fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn deployment(obj: &Redis, image: &str) -> Deployment {
    let (namespace, name) = resource::namespaced_name(obj);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace),
            labels: Some(labels(&name)),
            owner_references: Some(vec![resource::owner_reference(obj)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(&name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "redis".to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: REDIS_PORT,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(obj: &Redis) -> Service {
    let (namespace, name) = resource::namespaced_name(obj);

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace),
            labels: Some(labels(&name)),
            owner_references: Some(vec![resource::owner_reference(obj)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some("redis".to_string()),
                port: REDIS_PORT,
                target_port: Some(IntOrString::Int(REDIS_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
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
        // Step 1: attach the finalizer before any side effect

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
        // Step 2: resolve the strategy and decode the workload tuning

        let strategy = self
            .strategies
            .read_redis_strategy(&obj.spec.tier)
            .await
            .map_err(|err| Error::strategy(obj, &obj.spec.tier, err))?;

        let workload: WorkloadSpec = match &strategy.raw_strategy {
            Some(raw) => {
                serde_json::from_str(raw.get()).map_err(|err| Error::payload(obj, err))?
            }
            None => WorkloadSpec::default(),
        };

        let image = workload
            .image
            .unwrap_or_else(|| DEFAULT_REDIS_IMAGE.to_string());

        // ---------------------------------------------------------------------
        // Step 3: ensure the workload objects exist

        info!(
            namespace = &namespace,
            name = &name,
            image = &image,
            "Ensure cache workload exists",
        );

        ensure(self.client.to_owned(), &deployment(obj, &image))
            .await
            .map_err(|err| Error::kube(obj, err))?;
        ensure(self.client.to_owned(), &service(obj))
            .await
            .map_err(|err| Error::kube(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 4: report in progress until the deployment has an available
        // replica

        let available = resource::get::<Deployment>(self.client.to_owned(), &namespace, &name)
            .await
            .map_err(|err| Error::kube(obj, err))?
            .and_then(|deployment| deployment.status)
            .and_then(|status| status.available_replicas)
            .unwrap_or(0)
            > 0;

        if !available {
            info!(
                namespace = &namespace,
                name = &name,
                "Cache workload is not available yet",
            );

            return Ok(None);
        }

        Ok(Some(RedisInstance {
            deployment_details: Box::new(RedisDeploymentDetails {
                host: format!("{}.{}.svc.cluster.local", name, namespace),
                port: REDIS_PORT,
            }),
        }))
    }

    async fn delete_redis(&self, obj: &Redis) -> Result<(), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: delete the workload objects, absent objects are a success

        info!(namespace = &namespace, name = &name, "Delete cache workload");

        resource::delete::<Deployment>(self.client.to_owned(), &namespace, &name)
            .await
            .map_err(|err| Error::kube(obj, err))?;
        resource::delete::<Service>(self.client.to_owned(), &namespace, &name)
            .await
            .map_err(|err| Error::kube(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 2: wait until the workload is confirmed gone

        let client = self.client.to_owned();
        let target = (namespace.to_owned(), name.to_owned());
        poll::immediate(poll::DEFAULT_INTERVAL, poll::DEFAULT_CEILING, || {
            let client = client.to_owned();
            let (namespace, name) = target.to_owned();

            async move {
                matches!(
                    resource::get::<Deployment>(client, &namespace, &name).await,
                    Ok(None)
                )
            }
        })
        .await
        .map_err(|err| Error::timeout(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 3: release the finalizer, this must stay the last step

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

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use kube::api::ObjectMeta;
    use serde_json::json;

    use super::{RedisProvider, REDIS_FINALIZER};
    use crate::svc::{
        cfg::Configuration,
        crd::redis::{Redis, Spec},
        k8s::mock,
        provider::{openshift::ConfigManager, RedisProvider as _},
    };

    fn redis(finalizer: bool) -> Redis {
        let mut obj = Redis::new(
            "mycache",
            Spec {
                tier: "workshop".to_string(),
                secret_name: None,
            },
        );

        obj.metadata = ObjectMeta {
            name: Some("mycache".to_string()),
            namespace: Some("ns1".to_string()),
            uid: Some("5555-6666".to_string()),
            finalizers: finalizer.then(|| vec![REDIS_FINALIZER.to_string()]),
            ..Default::default()
        };

        obj
    }

    fn provider(client: kube::Client) -> RedisProvider {
        let configuration = Arc::new(Configuration::try_default().expect("configuration"));

        RedisProvider::new(
            client.to_owned(),
            Arc::new(ConfigManager::new(client, &configuration)),
        )
    }

    #[tokio::test]
    async fn create_builds_the_workload_and_reports_readiness() {
        let (client, server) = mock::client();
        let obj = redis(true);

        let handle = server.run(HashMap::from([
            (
                mock::path_for(&obj),
                serde_json::to_value(&obj).expect("resource to serialize"),
            ),
            (
                "/apis/apps/v1/namespaces/ns1/deployments/mycache".to_string(),
                json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {"name": "mycache", "namespace": "ns1"},
                    "status": {"availableReplicas": 1},
                }),
            ),
        ]));

        let provider = provider(client);

        let instance = provider
            .create_redis(&obj)
            .await
            .expect("create to succeed")
            .expect("instance to be ready");

        let data = instance.deployment_details.data();
        assert_eq!(b"mycache.ns1.svc.cluster.local".to_vec(), data["host"]);
        assert_eq!(b"6379".to_vec(), data["port"]);

        drop(provider);
        let store = handle.await.expect("mock api server to stop");
        assert!(store.contains_key("/api/v1/namespaces/ns1/services/mycache"));
    }
}
