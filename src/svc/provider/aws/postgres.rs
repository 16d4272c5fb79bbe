//! # Postgres provider
//!
//! This module provide the managed postgres provider implementation backed by
//! aws rds

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{
    api::{ObjectMeta, PostParams},
    Api,
};
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, info};

use crate::svc::{
    crd::{postgres::Postgres, Phase},
    k8s::{finalizer, resource},
    provider::{
        self,
        aws::{
            client::{CreateDatabaseSpec, PostgresApiFactory},
            config::ConfigManager,
            credentials::CredentialManager,
            DEPLOYMENT_STRATEGY,
        },
        poll, Error, PostgresDeploymentDetails, PostgresInstance, DEFAULT_RECONCILE_TIME,
        PENDING_RECONCILE_TIME,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const POSTGRES_FINALIZER: &str = "cloud-resources.dev/aws-postgres";

/// master username used when provisioning the database instance
pub const DEFAULT_POSTGRES_USER: &str = "postgres";

const DATA_USERNAME: &str = "username";
const DATA_PASSWORD: &str = "password";

// -----------------------------------------------------------------------------
// PostgresProvider structure

pub struct PostgresProvider {
    client: kube::Client,
    strategies: Arc<ConfigManager>,
    credentials: Arc<dyn CredentialManager>,
    factory: Arc<dyn PostgresApiFactory>,
}

impl PostgresProvider {
    pub fn new(
        client: kube::Client,
        strategies: Arc<ConfigManager>,
        credentials: Arc<dyn CredentialManager>,
        factory: Arc<dyn PostgresApiFactory>,
    ) -> Self {
        Self {
            client,
            strategies,
            credentials,
            factory,
        }
    }

    async fn database_config(
        &self,
        obj: &Postgres,
    ) -> Result<(String, CreateDatabaseSpec, provider::StrategyConfig), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        let strategy = self
            .strategies
            .read_postgres_strategy(&obj.spec.tier)
            .await
            .map_err(|err| Error::strategy(obj, &obj.spec.tier, err))?;

        let spec: CreateDatabaseSpec = match &strategy.raw_strategy {
            Some(raw) => {
                serde_json::from_str(raw.get()).map_err(|err| Error::payload(obj, err))?
            }
            None => CreateDatabaseSpec::default(),
        };

        let identifier = spec
            .instance_identifier
            .to_owned()
            .unwrap_or_else(|| format!("{}-{}", namespace, name));

        Ok((identifier, spec, strategy))
    }

    /// the master credentials are the end-user credentials of a database
    /// resource. They are generated once and persisted in a namespace secret,
    /// repeated reconciliations converge to the same identity
    async fn reconcile_admin_credentials(
        &self,
        obj: &Postgres,
    ) -> Result<(String, String), Error> {
        let (namespace, name) = resource::namespaced_name(obj);
        let secret_name = admin_credentials_name(&name);

        if let Some(secret) =
            resource::get::<Secret>(self.client.to_owned(), &namespace, &secret_name)
                .await
                .map_err(|err| Error::kube(obj, err))?
        {
            if let (Some(username), Some(password)) = (
                key(&secret, DATA_USERNAME),
                key(&secret, DATA_PASSWORD),
            ) {
                return Ok((username, password));
            }
        }

        info!(
            namespace = &namespace,
            name = &name,
            secret = &secret_name,
            "Generate master credentials for database instance",
        );

        let username = DEFAULT_POSTGRES_USER.to_string();
        let password = generate_password();

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.to_owned()),
                namespace: Some(namespace.to_owned()),
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
            // a concurrent reconciliation generated the credentials first,
            // converge on its identity
            Err(kube::Error::Api(err)) if err.code == 409 => {
                let secret =
                    resource::get::<Secret>(self.client.to_owned(), &namespace, &secret_name)
                        .await
                        .map_err(|err| Error::kube(obj, err))?
                        .ok_or_else(|| Error::kube(obj, kube::Error::Api(err)))?;

                match (key(&secret, DATA_USERNAME), key(&secret, DATA_PASSWORD)) {
                    (Some(username), Some(password)) => Ok((username, password)),
                    _ => Err(Error::kube(
                        obj,
                        kube::Error::Api(kube::core::ErrorResponse {
                            status: "Failure".to_string(),
                            message: format!(
                                "secret '{}/{}' is missing master credential keys",
                                namespace, secret_name
                            ),
                            reason: "Invalid".to_string(),
                            code: 422,
                        }),
                    )),
                }
            }
            Err(err) => Err(Error::kube(obj, err)),
        }
    }
}

fn admin_credentials_name(name: &str) -> String {
    format!("cloud-resources-aws-postgres-{}-credentials", name)
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn key(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).to_string())
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
        // Step 1: attach the finalizer before any remote side effect

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
        // Step 2: resolve the strategy and the target instance identifier

        let (identifier, spec, strategy) = self.database_config(obj).await?;

        // ---------------------------------------------------------------------
        // Step 3: reconcile end-user (master) then provider credentials

        let (username, password) = self.reconcile_admin_credentials(obj).await?;

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
            "Create database session",
        );

        let api = self.factory.session(&provider_credentials, &strategy.region);

        // ---------------------------------------------------------------------
        // Step 5: poll the list call until freshly issued access keys are
        // visible remotely

        let probe = api.to_owned();
        poll::immediate(poll::DEFAULT_INTERVAL, poll::DEFAULT_CEILING, || {
            let probe = probe.to_owned();
            async move { probe.list_instances().await.is_ok() }
        })
        .await
        .map_err(|err| Error::timeout(obj, err))?;

        let existing = api
            .list_instances()
            .await
            .map_err(|err| Error::remote(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 6: create the instance only when it does not exist yet

        if let Some(instance) = existing
            .iter()
            .find(|instance| instance.identifier == identifier)
        {
            let (Some(host), Some(port)) = (instance.host.to_owned(), instance.port) else {
                info!(
                    namespace = &namespace,
                    name = &name,
                    identifier = &identifier,
                    "Database instance exists but does not expose an endpoint yet",
                );

                return Ok(None);
            };

            return Ok(Some(PostgresInstance {
                deployment_details: Box::new(PostgresDeploymentDetails {
                    host,
                    port,
                    username,
                    password,
                    database: instance
                        .database
                        .to_owned()
                        .unwrap_or_else(|| spec.database.to_owned()),
                }),
            }));
        }

        info!(
            namespace = &namespace,
            name = &name,
            identifier = &identifier,
            "Database instance not found, create it",
        );

        api.create_instance(&identifier, &spec, &username, &password)
            .await
            .map_err(|err| Error::remote(obj, err))?;

        // the endpoint is exposed once the instance becomes available, report
        // the creation as in progress
        Ok(None)
    }

    async fn delete_postgres(&self, obj: &Postgres) -> Result<(), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: re-resolve the strategy and provider credentials

        let (identifier, _, strategy) = self.database_config(obj).await?;

        let provider_credentials = self
            .credentials
            .reconcile_provider_credentials(&namespace)
            .await
            .map_err(|err| Error::credentials(obj, err))?;

        let api = self.factory.session(&provider_credentials, &strategy.region);

        // ---------------------------------------------------------------------
        // Step 2: delete the instance, an already absent instance is a success

        info!(
            namespace = &namespace,
            name = &name,
            identifier = &identifier,
            "Delete database instance",
        );

        match api.delete_instance(&identifier).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(
                    namespace = &namespace,
                    name = &name,
                    identifier = &identifier,
                    "Database instance is already absent",
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
            async move { matches!(probe.instance_exists(&target).await, Ok(false)) }
        })
        .await
        .map_err(|err| Error::timeout(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 4: remove the master credentials secret

        resource::delete::<Secret>(
            self.client.to_owned(),
            &namespace,
            &admin_credentials_name(&name),
        )
        .await
        .map_err(|err| Error::kube(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 5: release the finalizer, this must stay the last step

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
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use async_trait::async_trait;
    use kube::api::ObjectMeta;

    use super::{PostgresProvider, POSTGRES_FINALIZER};
    use crate::svc::{
        cfg::Configuration,
        crd::postgres::{Postgres, Spec},
        k8s::mock,
        provider::{
            aws::{
                client::{
                    CreateDatabaseSpec, DatabaseInstance, Error as ClientError, PostgresApi,
                    PostgresApiFactory,
                },
                config::ConfigManager,
                credentials::{CredentialManager, Credentials, Error as CredentialsError},
            },
            PostgresProvider as _,
        },
    };

    // -------------------------------------------------------------------------
    // fakes

    #[derive(Default)]
    struct FakePostgresApi {
        instances: Mutex<Vec<DatabaseInstance>>,
        created: AtomicUsize,
    }

    #[async_trait]
    impl PostgresApi for FakePostgresApi {
        async fn list_instances(&self) -> Result<Vec<DatabaseInstance>, ClientError> {
            Ok(self.instances.lock().unwrap().to_owned())
        }

        async fn create_instance(
            &self,
            identifier: &str,
            spec: &CreateDatabaseSpec,
            _username: &str,
            _password: &str,
        ) -> Result<(), ClientError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.instances.lock().unwrap().push(DatabaseInstance {
                identifier: identifier.to_string(),
                // endpoints appear once the instance becomes available
                host: None,
                port: None,
                database: Some(spec.database.to_owned()),
                status: Some("creating".to_string()),
            });
            Ok(())
        }

        async fn delete_instance(&self, identifier: &str) -> Result<(), ClientError> {
            let mut instances = self.instances.lock().unwrap();

            match instances
                .iter()
                .position(|instance| instance.identifier == identifier)
            {
                Some(index) => {
                    instances.remove(index);
                    Ok(())
                }
                None => Err(ClientError::NotFound(identifier.to_string())),
            }
        }

        async fn instance_exists(&self, identifier: &str) -> Result<bool, ClientError> {
            Ok(self
                .instances
                .lock()
                .unwrap()
                .iter()
                .any(|instance| instance.identifier == identifier))
        }
    }

    struct FakeFactory {
        api: Arc<FakePostgresApi>,
    }

    impl PostgresApiFactory for FakeFactory {
        fn session(&self, _credentials: &Credentials, _region: &str) -> Arc<dyn PostgresApi> {
            self.api.to_owned()
        }
    }

    #[derive(Default)]
    struct FakeCredentialManager {}

    #[async_trait]
    impl CredentialManager for FakeCredentialManager {
        async fn reconcile_provider_credentials(
            &self,
            _namespace: &str,
        ) -> Result<Credentials, CredentialsError> {
            Ok(Credentials {
                access_key_id: "PROVIDERKEY".to_string(),
                secret_access_key: "PROVIDERSECRET".to_string(),
            })
        }

        async fn reconcile_bucket_owner_credentials(
            &self,
            _name: &str,
            _namespace: &str,
            _bucket: &str,
        ) -> Result<Credentials, CredentialsError> {
            unimplemented!("postgres tests never mint bucket credentials")
        }

        async fn reconcile_send_mail_credentials(
            &self,
            _name: &str,
            _namespace: &str,
        ) -> Result<Credentials, CredentialsError> {
            unimplemented!("postgres tests never mint smtp credentials")
        }

        async fn delete_owner_credentials(
            &self,
            _name: &str,
            _namespace: &str,
        ) -> Result<(), CredentialsError> {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // fixtures

    fn postgres(finalizer: bool, deleted: bool) -> Postgres {
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
            uid: Some("cccc-dddd".to_string()),
            finalizers: finalizer.then(|| vec![POSTGRES_FINALIZER.to_string()]),
            deletion_timestamp: deleted.then(|| {
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())
            }),
            ..Default::default()
        };

        obj
    }

    fn provider(client: kube::Client, api: Arc<FakePostgresApi>) -> PostgresProvider {
        let configuration = Arc::new(Configuration::try_default().expect("configuration"));

        PostgresProvider::new(
            client.to_owned(),
            Arc::new(ConfigManager::new(client, &configuration)),
            Arc::new(FakeCredentialManager::default()),
            Arc::new(FakeFactory { api }),
        )
    }

    fn available(identifier: &str) -> DatabaseInstance {
        DatabaseInstance {
            identifier: identifier.to_string(),
            host: Some(format!("{}.rds.amazonaws.com", identifier)),
            port: Some(5432),
            database: Some("postgres".to_string()),
            status: Some("available".to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // tests

    #[tokio::test]
    async fn create_starts_provisioning_and_reports_in_progress() {
        let (client, server) = mock::client();
        let obj = postgres(false, false);
        let handle = server.run(HashMap::from([(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        )]));

        let api = Arc::new(FakePostgresApi::default());
        let provider = provider(client, api.to_owned());

        let instance = provider
            .create_postgres(&obj)
            .await
            .expect("create to succeed");

        assert!(instance.is_none(), "endpoint is not exposed yet");
        assert_eq!(1, api.created.load(Ordering::SeqCst));

        drop(provider);
        let store = handle.await.expect("mock api server to stop");
        let finalizers = &store[&mock::path_for(&obj)]["metadata"]["finalizers"];
        assert_eq!(POSTGRES_FINALIZER, finalizers[0]);
        assert!(
            store.contains_key(
                "/api/v1/namespaces/ns1/secrets/cloud-resources-aws-postgres-mydb-credentials"
            ),
            "master credentials to be persisted",
        );
    }

    #[tokio::test]
    async fn create_returns_connection_details_once_available() {
        let (client, server) = mock::client();
        let obj = postgres(true, false);
        let _handle = server.run(HashMap::from([(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        )]));

        let api = Arc::new(FakePostgresApi {
            instances: Mutex::new(vec![available("ns1-mydb")]),
            ..Default::default()
        });
        let provider = provider(client, api.to_owned());

        let instance = provider
            .create_postgres(&obj)
            .await
            .expect("create to succeed")
            .expect("instance to be ready");

        let data = instance.deployment_details.data();
        for field in ["host", "port", "username", "password", "database"] {
            assert!(
                !data[field].is_empty(),
                "deployment details field '{}' to be set",
                field,
            );
        }
        assert_eq!(b"ns1-mydb.rds.amazonaws.com".to_vec(), data["host"]);
        assert_eq!(0, api.created.load(Ordering::SeqCst), "no second creation");
    }

    #[tokio::test]
    async fn delete_twice_reports_success_both_times() {
        let (client, server) = mock::client();
        let obj = postgres(true, true);
        let handle = server.run(HashMap::from([(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        )]));

        let api = Arc::new(FakePostgresApi {
            instances: Mutex::new(vec![available("ns1-mydb")]),
            ..Default::default()
        });
        let provider = provider(client, api.to_owned());

        provider
            .delete_postgres(&obj)
            .await
            .expect("first delete to succeed");
        provider
            .delete_postgres(&postgres(false, true))
            .await
            .expect("second delete to succeed even though the instance is absent");

        assert!(api.instances.lock().unwrap().is_empty());

        drop(provider);
        let store = handle.await.expect("mock api server to stop");
        let finalizers = &store[&mock::path_for(&obj)]["metadata"]["finalizers"];
        assert!(
            finalizers.as_array().map(Vec::is_empty).unwrap_or(true),
            "finalizer to be removed after cleanup",
        );
    }
}
