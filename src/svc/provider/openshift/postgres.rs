//! # Postgres provider
//!
//! This module provide the in-cluster postgres provider implementation,
//! running the database as a deployment in the resource request's namespace

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
            PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
            PodTemplateSpec, ResourceRequirements, Secret, SecretKeySelector, Service,
            ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
    },
    ByteString,
};
use kube::{
    api::{ObjectMeta, PostParams},
    Api,
};
use rand::{distributions::Alphanumeric, Rng};
use tracing::info;

use crate::svc::{
    crd::{postgres::Postgres, Phase},
    k8s::{finalizer, resource},
    provider::{
        self,
        openshift::{ensure, ConfigManager, WorkloadSpec, DEPLOYMENT_STRATEGY},
        poll, Error, PostgresDeploymentDetails, PostgresInstance, DEFAULT_RECONCILE_TIME,
        PENDING_RECONCILE_TIME,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const POSTGRES_FINALIZER: &str = "cloud-resources.dev/openshift-postgres";

pub const DEFAULT_POSTGRES_IMAGE: &str = "docker.io/library/postgres:13";
pub const DEFAULT_POSTGRES_STORAGE: &str = "1Gi";

const POSTGRES_PORT: i32 = 5432;
const POSTGRES_DATABASE: &str = "postgres";
const POSTGRES_USER: &str = "postgres";

const DATA_USERNAME: &str = "username";
const DATA_PASSWORD: &str = "password";

// -----------------------------------------------------------------------------
// PostgresProvider structure

pub struct PostgresProvider {
    client: kube::Client,
    strategies: Arc<ConfigManager>,
}

impl PostgresProvider {
    pub fn new(client: kube::Client, strategies: Arc<ConfigManager>) -> Self {
        Self { client, strategies }
    }

    /// generate the database credentials once and persist them in a namespace
    /// secret, repeated reconciliations converge to the same identity
    async fn reconcile_credentials(&self, obj: &Postgres) -> Result<(String, String), Error> {
        let (namespace, name) = resource::namespaced_name(obj);
        let secret_name = credentials_name(&name);

        if let Some(secret) =
            resource::get::<Secret>(self.client.to_owned(), &namespace, &secret_name)
                .await
                .map_err(|err| Error::kube(obj, err))?
        {
            if let (Some(username), Some(password)) =
                (key(&secret, DATA_USERNAME), key(&secret, DATA_PASSWORD))
            {
                return Ok((username, password));
            }
        }

        info!(
            namespace = &namespace,
            name = &name,
            secret = &secret_name,
            "Generate database credentials",
        );

        let username = POSTGRES_USER.to_string();
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.to_owned()),
                namespace: Some(namespace.to_owned()),
                owner_references: Some(vec![resource::owner_reference(obj)]),
                ..Default::default()
            },
            data: Some(
                [
                    (
                        DATA_USERNAME.to_string(),
                        ByteString(username.to_owned().into_bytes()),
                    ),
                    (
                        DATA_PASSWORD.to_string(),
                        ByteString(password.to_owned().into_bytes()),
                    ),
                ]
                .into(),
            ),
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(self.client.to_owned(), &namespace);
        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok((username, password)),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                let secret =
                    resource::get::<Secret>(self.client.to_owned(), &namespace, &secret_name)
                        .await
                        .map_err(|err| Error::kube(obj, err))?
                        .ok_or_else(|| Error::kube(obj, kube::Error::Api(err)))?;

                key(&secret, DATA_USERNAME)
                    .zip(key(&secret, DATA_PASSWORD))
                    .ok_or_else(|| {
                        Error::kube(
                            obj,
                            kube::Error::Api(kube::core::ErrorResponse {
                                status: "Failure".to_string(),
                                message: format!(
                                    "secret '{}/{}' is missing credential keys",
                                    namespace, secret_name
                                ),
                                reason: "Invalid".to_string(),
                                code: 422,
                            }),
                        )
                    })
            }
            Err(err) => Err(Error::kube(obj, err)),
        }
    }
}

// -----------------------------------------------------------------------------
// helpers

fn credentials_name(name: &str) -> String {
    format!("cloud-resources-openshift-postgres-{}-credentials", name)
}

fn claim_name(name: &str) -> String {
    format!("{}-data", name)
}

fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn key(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).to_string())
}

fn persistent_volume_claim(obj: &Postgres, storage: &str) -> PersistentVolumeClaim {
    let (namespace, name) = resource::namespaced_name(obj);

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name(&name)),
            namespace: Some(namespace),
            owner_references: Some(vec![resource::owner_reference(obj)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, secret_key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: secret_key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment(obj: &Postgres, image: &str) -> Deployment {
    let (namespace, name) = resource::namespaced_name(obj);
    let secret_name = credentials_name(&name);

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
                        name: "postgresql".to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: POSTGRES_PORT,
                            ..Default::default()
                        }]),
                        env: Some(vec![
                            secret_env("POSTGRES_USER", &secret_name, DATA_USERNAME),
                            secret_env("POSTGRES_PASSWORD", &secret_name, DATA_PASSWORD),
                            EnvVar {
                                name: "POSTGRES_DB".to_string(),
                                value: Some(POSTGRES_DATABASE.to_string()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "PGDATA".to_string(),
                                value: Some("/var/lib/postgresql/data/pgdata".to_string()),
                                ..Default::default()
                            },
                        ]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "data".to_string(),
                            mount_path: "/var/lib/postgresql/data".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "data".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: claim_name(&name),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(obj: &Postgres) -> Service {
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
                name: Some("postgresql".to_string()),
                port: POSTGRES_PORT,
                target_port: Some(IntOrString::Int(POSTGRES_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl provider::PostgresProvider for PostgresProvider {
    fn name(&self) -> &'static str {
        DEPLOYMENT_STRATEGY
    }

    fn supports_strategy(&self, strategy: &str) -> bool {
        strategy == DEPLOYMENT_STRATEGY
    }

    fn reconcile_time(&self, obj: &Postgres) -> Duration {
        match obj.status.as_ref().map(|status| status.phase) {
            Some(Phase::Complete) => DEFAULT_RECONCILE_TIME,
            _ => PENDING_RECONCILE_TIME,
        }
    }

    async fn create_postgres(&self, obj: &Postgres) -> Result<Option<PostgresInstance>, Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: attach the finalizer before any side effect

        if !resource::deleted(obj) && !finalizer::contains(obj, POSTGRES_FINALIZER) {
            info!(
                namespace = &namespace,
                name = &name,
                "Attach finalizer to postgres resource",
            );

            let modified = finalizer::add(obj.to_owned(), POSTGRES_FINALIZER);
            let patch = resource::diff(obj, &modified).map_err(|err| Error::diff(obj, err))?;

            resource::patch(self.client.to_owned(), &modified, patch)
                .await
                .map_err(|err| Error::finalizer(obj, err))?;
        }

        // ---------------------------------------------------------------------
        // Step 2: resolve the strategy and decode the workload tuning

        let strategy = self
            .strategies
            .read_postgres_strategy(&obj.spec.tier)
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
            .unwrap_or_else(|| DEFAULT_POSTGRES_IMAGE.to_string());
        let storage = workload
            .storage
            .unwrap_or_else(|| DEFAULT_POSTGRES_STORAGE.to_string());

        // ---------------------------------------------------------------------
        // Step 3: reconcile the database credentials

        let (username, password) = self.reconcile_credentials(obj).await?;

        // ---------------------------------------------------------------------
        // Step 4: ensure the workload objects exist, existing objects are left
        // untouched

        info!(
            namespace = &namespace,
            name = &name,
            image = &image,
            "Ensure database workload exists",
        );

        ensure(self.client.to_owned(), &persistent_volume_claim(obj, &storage))
            .await
            .map_err(|err| Error::kube(obj, err))?;
        ensure(self.client.to_owned(), &deployment(obj, &image))
            .await
            .map_err(|err| Error::kube(obj, err))?;
        ensure(self.client.to_owned(), &service(obj))
            .await
            .map_err(|err| Error::kube(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 5: report in progress until the deployment has an available
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
                "Database workload is not available yet",
            );

            return Ok(None);
        }

        Ok(Some(PostgresInstance {
            deployment_details: Box::new(PostgresDeploymentDetails {
                host: format!("{}.{}.svc.cluster.local", name, namespace),
                port: POSTGRES_PORT,
                username,
                password,
                database: POSTGRES_DATABASE.to_string(),
            }),
        }))
    }

    async fn delete_postgres(&self, obj: &Postgres) -> Result<(), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: delete the workload objects, absent objects are a success

        info!(
            namespace = &namespace,
            name = &name,
            "Delete database workload",
        );

        resource::delete::<Deployment>(self.client.to_owned(), &namespace, &name)
            .await
            .map_err(|err| Error::kube(obj, err))?;
        resource::delete::<Service>(self.client.to_owned(), &namespace, &name)
            .await
            .map_err(|err| Error::kube(obj, err))?;
        resource::delete::<PersistentVolumeClaim>(
            self.client.to_owned(),
            &namespace,
            &claim_name(&name),
        )
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
        // Step 3: remove the credentials secret

        resource::delete::<Secret>(self.client.to_owned(), &namespace, &credentials_name(&name))
            .await
            .map_err(|err| Error::kube(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 4: release the finalizer, this must stay the last step

        info!(
            namespace = &namespace,
            name = &name,
            "Remove finalizer from postgres resource",
        );

        let modified = finalizer::remove(obj.to_owned(), POSTGRES_FINALIZER);
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

    use super::{PostgresProvider, POSTGRES_FINALIZER};
    use crate::svc::{
        cfg::Configuration,
        crd::postgres::{Postgres, Spec},
        k8s::mock,
        provider::{openshift::ConfigManager, PostgresProvider as _},
    };

    fn postgres(finalizer: bool, deleted: bool) -> Postgres {
        let mut obj = Postgres::new(
            "mydb",
            Spec {
                tier: "workshop".to_string(),
                secret_name: None,
            },
        );

        obj.metadata = ObjectMeta {
            name: Some("mydb".to_string()),
            namespace: Some("ns1".to_string()),
            uid: Some("3333-4444".to_string()),
            finalizers: finalizer.then(|| vec![POSTGRES_FINALIZER.to_string()]),
            deletion_timestamp: deleted.then(|| {
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())
            }),
            ..Default::default()
        };

        obj
    }

    fn provider(client: kube::Client) -> PostgresProvider {
        let configuration = Arc::new(Configuration::try_default().expect("configuration"));

        PostgresProvider::new(
            client.to_owned(),
            Arc::new(ConfigManager::new(client, &configuration)),
        )
    }

    fn workloads() -> HashMap<String, serde_json::Value> {
        HashMap::from([
            (
                "/apis/apps/v1/namespaces/ns1/deployments/mydb".to_string(),
                json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {"name": "mydb", "namespace": "ns1"},
                    "status": {"availableReplicas": 1},
                }),
            ),
            (
                "/api/v1/namespaces/ns1/services/mydb".to_string(),
                json!({
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": {"name": "mydb", "namespace": "ns1"},
                }),
            ),
            (
                "/api/v1/namespaces/ns1/persistentvolumeclaims/mydb-data".to_string(),
                json!({
                    "apiVersion": "v1",
                    "kind": "PersistentVolumeClaim",
                    "metadata": {"name": "mydb-data", "namespace": "ns1"},
                }),
            ),
            (
                "/api/v1/namespaces/ns1/secrets/cloud-resources-openshift-postgres-mydb-credentials"
                    .to_string(),
                json!({
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "metadata": {
                        "name": "cloud-resources-openshift-postgres-mydb-credentials",
                        "namespace": "ns1",
                    },
                    "data": {
                        // base64 of "postgres" and "secretpw"
                        "username": "cG9zdGdyZXM=",
                        "password": "c2VjcmV0cHc=",
                    },
                }),
            ),
        ])
    }

    #[tokio::test]
    async fn create_builds_the_workload_and_reports_in_progress() {
        let (client, server) = mock::client();
        let obj = postgres(false, false);
        let handle = server.run(HashMap::from([(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        )]));

        let provider = provider(client);

        let instance = provider
            .create_postgres(&obj)
            .await
            .expect("create to succeed");

        assert!(instance.is_none(), "deployment has no available replica yet");

        drop(provider);
        let store = handle.await.expect("mock api server to stop");
        assert_eq!(
            POSTGRES_FINALIZER,
            store[&mock::path_for(&obj)]["metadata"]["finalizers"][0],
        );
        assert!(store.contains_key("/apis/apps/v1/namespaces/ns1/deployments/mydb"));
        assert!(store.contains_key("/api/v1/namespaces/ns1/services/mydb"));
        assert!(store.contains_key("/api/v1/namespaces/ns1/persistentvolumeclaims/mydb-data"));
        assert!(store.contains_key(
            "/api/v1/namespaces/ns1/secrets/cloud-resources-openshift-postgres-mydb-credentials"
        ));
    }

    #[tokio::test]
    async fn create_returns_connection_details_once_available() {
        let (client, server) = mock::client();
        let obj = postgres(true, false);

        let mut store = workloads();
        store.insert(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        );
        let _handle = server.run(store);

        let provider = provider(client);

        let instance = provider
            .create_postgres(&obj)
            .await
            .expect("create to succeed")
            .expect("instance to be ready");

        let data = instance.deployment_details.data();
        assert_eq!(b"mydb.ns1.svc.cluster.local".to_vec(), data["host"]);
        assert_eq!(b"5432".to_vec(), data["port"]);
        assert_eq!(b"postgres".to_vec(), data["username"]);
        assert_eq!(b"secretpw".to_vec(), data["password"]);
        assert_eq!(b"postgres".to_vec(), data["database"]);
    }

    #[tokio::test]
    async fn delete_twice_reports_success_both_times() {
        let (client, server) = mock::client();
        let obj = postgres(true, true);

        let mut store = workloads();
        store.insert(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        );
        let handle = server.run(store);

        let provider = provider(client);

        provider
            .delete_postgres(&obj)
            .await
            .expect("first delete to succeed");
        provider
            .delete_postgres(&postgres(false, true))
            .await
            .expect("second delete to succeed even though the workload is absent");

        drop(provider);
        let store = handle.await.expect("mock api server to stop");
        assert!(!store.contains_key("/apis/apps/v1/namespaces/ns1/deployments/mydb"));
        assert!(!store.contains_key("/api/v1/namespaces/ns1/services/mydb"));
        assert!(!store.contains_key(
            "/api/v1/namespaces/ns1/secrets/cloud-resources-openshift-postgres-mydb-credentials"
        ));
    }
}
