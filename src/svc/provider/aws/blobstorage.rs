//! # Blob storage provider
//!
//! This module provide the blob storage provider implementation backed by aws
//! s3

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::svc::{
    crd::blobstorage::BlobStorage,
    k8s::{finalizer, resource},
    provider::{
        self,
        aws::{
            client::{CreateBucketSpec, ObjectStorageApiFactory},
            config::ConfigManager,
            credentials::CredentialManager,
            DEPLOYMENT_STRATEGY,
        },
        poll, BlobStorageInstance, DeploymentDetails, Error, DEFAULT_RECONCILE_TIME,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const STORAGE_FINALIZER: &str = "cloud-resources.dev/aws-blobstorage";

const DATA_BUCKET_NAME: &str = "bucketName";
const DATA_CREDENTIAL_KEY_ID: &str = "credentialKeyID";
const DATA_CREDENTIAL_SECRET_KEY: &str = "credentialSecretKey";

// -----------------------------------------------------------------------------
// BlobStorageDeploymentDetails structure

/// provider-specific details about the created s3 bucket
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct BlobStorageDeploymentDetails {
    pub bucket_name: String,
    pub credential_key_id: String,
    pub credential_secret_key: String,
}

impl DeploymentDetails for BlobStorageDeploymentDetails {
    fn data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            (
                DATA_BUCKET_NAME.to_string(),
                self.bucket_name.to_owned().into_bytes(),
            ),
            (
                DATA_CREDENTIAL_KEY_ID.to_string(),
                self.credential_key_id.to_owned().into_bytes(),
            ),
            (
                DATA_CREDENTIAL_SECRET_KEY.to_string(),
                self.credential_secret_key.to_owned().into_bytes(),
            ),
        ])
    }
}

// -----------------------------------------------------------------------------
// BlobStorageProvider structure

pub struct BlobStorageProvider {
    client: kube::Client,
    strategies: Arc<ConfigManager>,
    credentials: Arc<dyn CredentialManager>,
    factory: Arc<dyn ObjectStorageApiFactory>,
}

impl BlobStorageProvider {
    pub fn new(
        client: kube::Client,
        strategies: Arc<ConfigManager>,
        credentials: Arc<dyn CredentialManager>,
        factory: Arc<dyn ObjectStorageApiFactory>,
    ) -> Self {
        Self {
            client,
            strategies,
            credentials,
            factory,
        }
    }

    /// returns the target bucket name, either set by the strategy payload or
    /// derived deterministically from the resource coordinates
    async fn bucket_config(
        &self,
        obj: &BlobStorage,
    ) -> Result<(String, provider::StrategyConfig), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        let strategy = self
            .strategies
            .read_blob_storage_strategy(&obj.spec.tier)
            .await
            .map_err(|err| Error::strategy(obj, &obj.spec.tier, err))?;

        let spec: CreateBucketSpec = match &strategy.raw_strategy {
            Some(raw) => {
                serde_json::from_str(raw.get()).map_err(|err| Error::payload(obj, err))?
            }
            None => CreateBucketSpec::default(),
        };

        let bucket = spec
            .bucket_name
            .unwrap_or_else(|| format!("{}-{}", namespace, name));

        Ok((bucket, strategy))
    }
}

fn end_user_credentials_name(name: &str) -> String {
    format!("cloud-resources-aws-s3-{}-credentials", name)
}

#[async_trait]
impl provider::BlobStorageProvider for BlobStorageProvider {
    fn name(&self) -> &'static str {
        DEPLOYMENT_STRATEGY
    }

    fn supports_strategy(&self, strategy: &str) -> bool {
        strategy == DEPLOYMENT_STRATEGY
    }

    fn reconcile_time(&self, _obj: &BlobStorage) -> Duration {
        DEFAULT_RECONCILE_TIME
    }

    async fn create_storage(
        &self,
        obj: &BlobStorage,
    ) -> Result<Option<BlobStorageInstance>, Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: attach the finalizer before any remote side effect, so that
        // a crash from here on still guarantees cleanup is attempted later

        if !resource::deleted(obj) && !finalizer::contains(obj, STORAGE_FINALIZER) {
            info!(
                namespace = &namespace,
                name = &name,
                "Attach finalizer to blob storage resource",
            );

            let modified = finalizer::add(obj.to_owned(), STORAGE_FINALIZER);
            let patch = resource::diff(obj, &modified).map_err(|err| Error::diff(obj, err))?;

            resource::patch(self.client.to_owned(), &modified, patch)
                .await
                .map_err(|err| Error::finalizer(obj, err))?;
        }

        // ---------------------------------------------------------------------
        // Step 2: resolve the strategy and the target bucket name

        let (bucket, strategy) = self.bucket_config(obj).await?;

        // ---------------------------------------------------------------------
        // Step 3: reconcile end-user then provider credentials

        let credentials_name = end_user_credentials_name(&name);

        info!(
            namespace = &namespace,
            name = &name,
            credentials = &credentials_name,
            bucket = &bucket,
            "Reconcile end-user credentials for bucket",
        );

        let end_user = self
            .credentials
            .reconcile_bucket_owner_credentials(&credentials_name, &namespace, &bucket)
            .await
            .map_err(|err| Error::credentials(obj, err))?;

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
            "Create object storage session",
        );

        let api = self.factory.session(&provider_credentials, &strategy.region);

        // ---------------------------------------------------------------------
        // Step 5: freshly issued access keys may not be visible remotely yet,
        // poll the list call until it succeeds

        let probe = api.to_owned();
        poll::immediate(poll::DEFAULT_INTERVAL, poll::DEFAULT_CEILING, || {
            let probe = probe.to_owned();
            async move { probe.list_buckets().await.is_ok() }
        })
        .await
        .map_err(|err| Error::timeout(obj, err))?;

        let existing = api.list_buckets().await.map_err(|err| Error::remote(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 6: create the bucket only when it does not exist yet

        let instance = BlobStorageInstance {
            deployment_details: Box::new(BlobStorageDeploymentDetails {
                bucket_name: bucket.to_owned(),
                credential_key_id: end_user.access_key_id,
                credential_secret_key: end_user.secret_access_key,
            }),
        };

        if existing.iter().any(|existing| existing == &bucket) {
            info!(
                namespace = &namespace,
                name = &name,
                bucket = &bucket,
                "Bucket already exists, use it",
            );

            return Ok(Some(instance));
        }

        info!(
            namespace = &namespace,
            name = &name,
            bucket = &bucket,
            "Bucket not found, create it",
        );

        api.create_bucket(&bucket)
            .await
            .map_err(|err| Error::remote(obj, err))?;

        Ok(Some(instance))
    }

    async fn delete_storage(&self, obj: &BlobStorage) -> Result<(), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: re-resolve the strategy and provider credentials, nothing is
        // cached across reconciliations

        let (bucket, strategy) = self.bucket_config(obj).await?;

        let provider_credentials = self
            .credentials
            .reconcile_provider_credentials(&namespace)
            .await
            .map_err(|err| Error::credentials(obj, err))?;

        let api = self.factory.session(&provider_credentials, &strategy.region);

        // ---------------------------------------------------------------------
        // Step 2: delete the bucket, an already absent bucket is a success

        info!(
            namespace = &namespace,
            name = &name,
            bucket = &bucket,
            "Delete bucket",
        );

        match api.delete_bucket(&bucket).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(
                    namespace = &namespace,
                    name = &name,
                    bucket = &bucket,
                    "Bucket is already absent",
                );
            }
            Err(err) => return Err(Error::remote(obj, err)),
        }

        // ---------------------------------------------------------------------
        // Step 3: deletion must not be reported complete while the bucket
        // might still exist, wait for confirmed absence

        let probe = api.to_owned();
        let target = bucket.to_owned();
        poll::immediate(poll::DEFAULT_INTERVAL, poll::DEFAULT_CEILING, || {
            let probe = probe.to_owned();
            let target = target.to_owned();
            async move { matches!(probe.bucket_exists(&target).await, Ok(false)) }
        })
        .await
        .map_err(|err| Error::timeout(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 4: remove the credential-issuance artifacts scoped to this
        // bucket

        let credentials_name = end_user_credentials_name(&name);

        info!(
            namespace = &namespace,
            name = &name,
            credentials = &credentials_name,
            "Delete end-user credentials request",
        );

        self.credentials
            .delete_owner_credentials(&credentials_name, &namespace)
            .await
            .map_err(|err| Error::credentials(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 5: release the finalizer, this must stay the last step

        info!(
            namespace = &namespace,
            name = &name,
            "Remove finalizer from blob storage resource",
        );

        let modified = finalizer::remove(obj.to_owned(), STORAGE_FINALIZER);
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

    use super::{BlobStorageProvider, STORAGE_FINALIZER};
    use crate::svc::{
        cfg::Configuration,
        crd::blobstorage::{BlobStorage, Spec},
        k8s::mock,
        provider::{
            aws::{
                client::{Error as ClientError, ObjectStorageApi, ObjectStorageApiFactory},
                config::ConfigManager,
                credentials::{CredentialManager, Credentials, Error as CredentialsError},
            },
            BlobStorageProvider as _, Error,
        },
    };

    // -------------------------------------------------------------------------
    // fakes

    #[derive(Default)]
    pub(crate) struct FakeObjectStorageApi {
        pub buckets: Mutex<Vec<String>>,
        pub created: AtomicUsize,
        pub fail_lists: bool,
    }

    #[async_trait]
    impl ObjectStorageApi for FakeObjectStorageApi {
        async fn list_buckets(&self) -> Result<Vec<String>, ClientError> {
            if self.fail_lists {
                return Err(ClientError::Remote("access key not yet visible".into()));
            }

            Ok(self.buckets.lock().unwrap().to_owned())
        }

        async fn create_bucket(&self, name: &str) -> Result<(), ClientError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.buckets.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn delete_bucket(&self, name: &str) -> Result<(), ClientError> {
            let mut buckets = self.buckets.lock().unwrap();

            match buckets.iter().position(|bucket| bucket == name) {
                Some(index) => {
                    buckets.remove(index);
                    Ok(())
                }
                None => Err(ClientError::NotFound(name.to_string())),
            }
        }

        async fn bucket_exists(&self, name: &str) -> Result<bool, ClientError> {
            Ok(self.buckets.lock().unwrap().iter().any(|bucket| bucket == name))
        }
    }

    pub(crate) struct FakeFactory {
        pub api: Arc<FakeObjectStorageApi>,
        pub regions: Mutex<Vec<String>>,
    }

    impl ObjectStorageApiFactory for FakeFactory {
        fn session(&self, _credentials: &Credentials, region: &str) -> Arc<dyn ObjectStorageApi> {
            self.regions.lock().unwrap().push(region.to_string());
            self.api.to_owned()
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeCredentialManager {
        pub minted: Mutex<Vec<String>>,
        pub deleted: Mutex<Vec<String>>,
    }

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
            name: &str,
            _namespace: &str,
            _bucket: &str,
        ) -> Result<Credentials, CredentialsError> {
            self.minted.lock().unwrap().push(name.to_string());

            Ok(Credentials {
                access_key_id: "USERKEY".to_string(),
                secret_access_key: "USERSECRET".to_string(),
            })
        }

        async fn reconcile_send_mail_credentials(
            &self,
            name: &str,
            _namespace: &str,
        ) -> Result<Credentials, CredentialsError> {
            self.minted.lock().unwrap().push(name.to_string());

            Ok(Credentials {
                access_key_id: "MAILKEY".to_string(),
                secret_access_key: "MAILSECRET".to_string(),
            })
        }

        async fn delete_owner_credentials(
            &self,
            name: &str,
            _namespace: &str,
        ) -> Result<(), CredentialsError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // fixtures

    fn storage(finalizer: bool, deleted: bool) -> BlobStorage {
        let mut obj = BlobStorage::new(
            "mystorage",
            Spec {
                tier: "managed".to_string(),
                secret_name: None,
            },
        );

        obj.metadata = ObjectMeta {
            name: Some("mystorage".to_string()),
            namespace: Some("ns1".to_string()),
            uid: Some("aaaa-bbbb".to_string()),
            finalizers: finalizer.then(|| vec![STORAGE_FINALIZER.to_string()]),
            deletion_timestamp: deleted.then(|| {
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now())
            }),
            ..Default::default()
        };

        obj
    }

    fn provider(
        client: kube::Client,
        api: Arc<FakeObjectStorageApi>,
    ) -> (
        BlobStorageProvider,
        Arc<FakeCredentialManager>,
        Arc<FakeFactory>,
    ) {
        let configuration = Arc::new(Configuration::try_default().expect("configuration"));
        let credentials = Arc::new(FakeCredentialManager::default());
        let factory = Arc::new(FakeFactory {
            api,
            regions: Mutex::new(vec![]),
        });

        (
            BlobStorageProvider::new(
                client.to_owned(),
                Arc::new(ConfigManager::new(client, &configuration)),
                credentials.to_owned(),
                factory.to_owned(),
            ),
            credentials,
            factory,
        )
    }

    // -------------------------------------------------------------------------
    // tests

    #[tokio::test]
    async fn create_attaches_finalizer_and_creates_the_bucket() {
        let (client, server) = mock::client();
        let obj = storage(false, false);
        let handle = server.run(HashMap::from([(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        )]));

        let api = Arc::new(FakeObjectStorageApi::default());
        let (provider, credentials, factory) = provider(client, api.to_owned());

        let instance = provider
            .create_storage(&obj)
            .await
            .expect("create to succeed")
            .expect("instance to be ready");

        let data = instance.deployment_details.data();
        assert_eq!(b"ns1-mystorage".to_vec(), data["bucketName"]);
        assert_eq!(b"USERKEY".to_vec(), data["credentialKeyID"]);
        assert_eq!(1, api.created.load(Ordering::SeqCst));
        assert_eq!(
            vec!["cloud-resources-aws-s3-mystorage-credentials".to_string()],
            credentials.minted.lock().unwrap().to_owned(),
        );
        // region resolved from the defaulted strategy
        assert_eq!(
            vec!["eu-west-2".to_string()],
            factory.regions.lock().unwrap().to_owned(),
        );

        drop(provider);
        let store = handle.await.expect("mock api server to stop");
        let finalizers = &store[&mock::path_for(&obj)]["metadata"]["finalizers"];
        assert_eq!(STORAGE_FINALIZER, finalizers[0]);
    }

    #[tokio::test]
    async fn create_is_idempotent_when_the_bucket_already_exists() {
        let (client, server) = mock::client();
        let obj = storage(true, false);
        let _handle = server.run(HashMap::from([(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        )]));

        let api = Arc::new(FakeObjectStorageApi {
            buckets: Mutex::new(vec!["ns1-mystorage".to_string()]),
            ..Default::default()
        });
        let (provider, _, _) = provider(client, api.to_owned());

        let first = provider
            .create_storage(&obj)
            .await
            .expect("create to succeed")
            .expect("instance to be ready");
        let second = provider
            .create_storage(&obj)
            .await
            .expect("create to succeed")
            .expect("instance to be ready");

        assert_eq!(
            first.deployment_details.data(),
            second.deployment_details.data()
        );
        assert_eq!(0, api.created.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn create_times_out_without_creating_when_listing_never_succeeds() {
        let (client, server) = mock::client();
        let obj = storage(true, false);
        let _handle = server.run(HashMap::from([(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        )]));

        let api = Arc::new(FakeObjectStorageApi {
            fail_lists: true,
            ..Default::default()
        });
        let (provider, _, _) = provider(client, api.to_owned());

        let result = provider.create_storage(&obj).await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(0, api.created.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn delete_twice_reports_success_both_times() {
        let (client, server) = mock::client();
        let obj = storage(true, true);
        let handle = server.run(HashMap::from([(
            mock::path_for(&obj),
            serde_json::to_value(&obj).expect("resource to serialize"),
        )]));

        let api = Arc::new(FakeObjectStorageApi {
            buckets: Mutex::new(vec!["ns1-mystorage".to_string()]),
            ..Default::default()
        });
        let (provider, credentials, _) = provider(client, api.to_owned());

        provider
            .delete_storage(&obj)
            .await
            .expect("first delete to succeed");

        // the trigger re-invokes with the refreshed resource, the finalizer is
        // already gone and so is the bucket
        provider
            .delete_storage(&storage(false, true))
            .await
            .expect("second delete to succeed even though the bucket is absent");

        assert!(api.buckets.lock().unwrap().is_empty());
        assert_eq!(
            2,
            credentials.deleted.lock().unwrap().len(),
            "credential cleanup to stay idempotent",
        );

        drop(provider);
        let store = handle.await.expect("mock api server to stop");
        let finalizers = &store[&mock::path_for(&obj)]["metadata"]["finalizers"];
        assert!(
            finalizers.as_array().map(Vec::is_empty).unwrap_or(true),
            "finalizer to be removed after cleanup",
        );
    }
}
