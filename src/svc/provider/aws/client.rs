//! # Client module
//!
//! This module provide the cloud api capability surface consumed by the aws
//! providers and its aws-sdk backed implementation. Vendor error shapes stay
//! behind an explicit not-found classification policy so the providers never
//! depend on wire-level details

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_elasticache as elasticache;
use aws_sdk_rds as rds;
use aws_sdk_s3 as s3;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use serde::{Deserialize, Serialize};

use crate::svc::provider::aws::credentials::Credentials;

// -----------------------------------------------------------------------------
// Constants

/// vendor error codes classified as "the resource does not exist". Swapping
/// cloud vendors means swapping this table, not the providers
pub const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchBucket",
    "NotFound",
    "DBInstanceNotFound",
    "CacheClusterNotFound",
];

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("resource '{0}' could not be found")]
    NotFound(String),
    #[error("failed to execute request on the cloud provider api, {0}")]
    Remote(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// fold a vendor error code into the taxonomy using the
    /// [`NOT_FOUND_CODES`] policy
    pub fn classify(identifier: &str, code: Option<&str>, message: String) -> Self {
        match code {
            Some(code) if NOT_FOUND_CODES.contains(&code) => {
                Self::NotFound(identifier.to_string())
            }
            _ => Self::Remote(message),
        }
    }
}

fn fold<E, R>(identifier: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().map(ToOwned::to_owned);

    Error::classify(
        identifier,
        code.as_deref(),
        DisplayErrorContext(&err).to_string(),
    )
}

// -----------------------------------------------------------------------------
// Creation spec structures, decoded from the raw strategy payloads

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct CreateBucketSpec {
    #[serde(rename = "bucketName")]
    pub bucket_name: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct CreateDatabaseSpec {
    #[serde(rename = "instanceIdentifier")]
    pub instance_identifier: Option<String>,
    #[serde(rename = "database", default = "default_database")]
    pub database: String,
    #[serde(rename = "instanceClass", default = "default_instance_class")]
    pub instance_class: String,
    #[serde(rename = "allocatedStorage", default = "default_allocated_storage")]
    pub allocated_storage: i32,
    #[serde(rename = "engineVersion")]
    pub engine_version: Option<String>,
    #[serde(rename = "port")]
    pub port: Option<i32>,
}

impl Default for CreateDatabaseSpec {
    fn default() -> Self {
        Self {
            instance_identifier: None,
            database: default_database(),
            instance_class: default_instance_class(),
            allocated_storage: default_allocated_storage(),
            engine_version: None,
            port: None,
        }
    }
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_instance_class() -> String {
    "db.t3.micro".to_string()
}

const fn default_allocated_storage() -> i32 {
    20
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct CreateCacheSpec {
    #[serde(rename = "clusterIdentifier")]
    pub cluster_identifier: Option<String>,
    #[serde(rename = "nodeType", default = "default_node_type")]
    pub node_type: String,
    #[serde(rename = "engineVersion")]
    pub engine_version: Option<String>,
    #[serde(rename = "port")]
    pub port: Option<i32>,
}

impl Default for CreateCacheSpec {
    fn default() -> Self {
        Self {
            cluster_identifier: None,
            node_type: default_node_type(),
            engine_version: None,
            port: None,
        }
    }
}

fn default_node_type() -> String {
    "cache.t3.micro".to_string()
}

// -----------------------------------------------------------------------------
// Remote resource structures

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct DatabaseInstance {
    pub identifier: String,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub database: Option<String>,
    pub status: Option<String>,
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct CacheCluster {
    pub identifier: String,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub status: Option<String>,
}

// -----------------------------------------------------------------------------
// Capability traits

/// object storage operations scoped to one region and credential pair
#[async_trait]
pub trait ObjectStorageApi: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<String>, Error>;

    async fn create_bucket(&self, name: &str) -> Result<(), Error>;

    async fn delete_bucket(&self, name: &str) -> Result<(), Error>;

    async fn bucket_exists(&self, name: &str) -> Result<bool, Error>;
}

/// managed database operations scoped to one region and credential pair
#[async_trait]
pub trait PostgresApi: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<DatabaseInstance>, Error>;

    async fn create_instance(
        &self,
        identifier: &str,
        spec: &CreateDatabaseSpec,
        username: &str,
        password: &str,
    ) -> Result<(), Error>;

    async fn delete_instance(&self, identifier: &str) -> Result<(), Error>;

    async fn instance_exists(&self, identifier: &str) -> Result<bool, Error>;
}

/// managed cache operations scoped to one region and credential pair
#[async_trait]
pub trait CacheApi: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<CacheCluster>, Error>;

    async fn create_cluster(&self, identifier: &str, spec: &CreateCacheSpec)
        -> Result<(), Error>;

    async fn delete_cluster(&self, identifier: &str) -> Result<(), Error>;

    async fn cluster_exists(&self, identifier: &str) -> Result<bool, Error>;
}

// -----------------------------------------------------------------------------
// Factory traits

/// builds an object storage session from provider credentials and a region
pub trait ObjectStorageApiFactory: Send + Sync {
    fn session(&self, credentials: &Credentials, region: &str) -> Arc<dyn ObjectStorageApi>;
}

pub trait PostgresApiFactory: Send + Sync {
    fn session(&self, credentials: &Credentials, region: &str) -> Arc<dyn PostgresApi>;
}

pub trait CacheApiFactory: Send + Sync {
    fn session(&self, credentials: &Credentials, region: &str) -> Arc<dyn CacheApi>;
}

// -----------------------------------------------------------------------------
// SdkFactory structure

/// default factory building aws-sdk clients with static credentials
#[derive(Clone, Default, Debug)]
pub struct SdkFactory {}

impl ObjectStorageApiFactory for SdkFactory {
    fn session(&self, credentials: &Credentials, region: &str) -> Arc<dyn ObjectStorageApi> {
        Arc::new(SdkObjectStorageApi::new(credentials, region))
    }
}

impl PostgresApiFactory for SdkFactory {
    fn session(&self, credentials: &Credentials, region: &str) -> Arc<dyn PostgresApi> {
        Arc::new(SdkPostgresApi::new(credentials, region))
    }
}

impl CacheApiFactory for SdkFactory {
    fn session(&self, credentials: &Credentials, region: &str) -> Arc<dyn CacheApi> {
        Arc::new(SdkCacheApi::new(credentials, region))
    }
}

fn sdk_credentials(credentials: &Credentials) -> s3::config::Credentials {
    s3::config::Credentials::new(
        credentials.access_key_id.to_owned(),
        credentials.secret_access_key.to_owned(),
        None,
        None,
        env!("CARGO_PKG_NAME"),
    )
}

// -----------------------------------------------------------------------------
// SdkObjectStorageApi structure

pub struct SdkObjectStorageApi {
    client: s3::Client,
    region: String,
}

impl SdkObjectStorageApi {
    pub fn new(credentials: &Credentials, region: &str) -> Self {
        let config = s3::Config::builder()
            .behavior_version(s3::config::BehaviorVersion::latest())
            .region(s3::config::Region::new(region.to_owned()))
            .credentials_provider(sdk_credentials(credentials))
            .build();

        Self {
            client: s3::Client::from_conf(config),
            region: region.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStorageApi for SdkObjectStorageApi {
    async fn list_buckets(&self) -> Result<Vec<String>, Error> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|err| fold("buckets", err))?;

        Ok(output
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name().map(ToOwned::to_owned))
            .collect())
    }

    async fn create_bucket(&self, name: &str) -> Result<(), Error> {
        let mut request = self.client.create_bucket().bucket(name);

        // us-east-1 is the only region rejecting an explicit location
        // constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map(|_| ())
            .map_err(|err| fold(name, err))
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), Error> {
        self.client
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| fold(name, err))
    }

    async fn bucket_exists(&self, name: &str) -> Result<bool, Error> {
        match self.client.head_bucket().bucket(name).send().await {
            Ok(_) => Ok(true),
            // head responses carry no error body, the modeled variant is the
            // only reliable not-found signal here
            Err(err) => match err.into_service_error() {
                err if err.is_not_found() => Ok(false),
                err => Err(Error::Remote(DisplayErrorContext(&err).to_string())),
            },
        }
    }
}

// -----------------------------------------------------------------------------
// SdkPostgresApi structure

pub struct SdkPostgresApi {
    client: rds::Client,
}

impl SdkPostgresApi {
    pub fn new(credentials: &Credentials, region: &str) -> Self {
        let config = rds::Config::builder()
            .behavior_version(rds::config::BehaviorVersion::latest())
            .region(rds::config::Region::new(region.to_owned()))
            .credentials_provider(sdk_credentials(credentials))
            .build();

        Self {
            client: rds::Client::from_conf(config),
        }
    }
}

#[async_trait]
impl PostgresApi for SdkPostgresApi {
    async fn list_instances(&self) -> Result<Vec<DatabaseInstance>, Error> {
        let output = self
            .client
            .describe_db_instances()
            .send()
            .await
            .map_err(|err| fold("instances", err))?;

        Ok(output
            .db_instances()
            .iter()
            .map(|instance| DatabaseInstance {
                identifier: instance
                    .db_instance_identifier()
                    .unwrap_or_default()
                    .to_string(),
                host: instance
                    .endpoint()
                    .and_then(|endpoint| endpoint.address())
                    .map(ToOwned::to_owned),
                port: instance.endpoint().and_then(|endpoint| endpoint.port()),
                database: instance.db_name().map(ToOwned::to_owned),
                status: instance.db_instance_status().map(ToOwned::to_owned),
            })
            .collect())
    }

    async fn create_instance(
        &self,
        identifier: &str,
        spec: &CreateDatabaseSpec,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        let mut request = self
            .client
            .create_db_instance()
            .db_instance_identifier(identifier)
            .engine("postgres")
            .db_instance_class(&spec.instance_class)
            .allocated_storage(spec.allocated_storage)
            .db_name(&spec.database)
            .master_username(username)
            .master_user_password(password);

        if let Some(version) = &spec.engine_version {
            request = request.engine_version(version);
        }
        if let Some(port) = spec.port {
            request = request.port(port);
        }

        request
            .send()
            .await
            .map(|_| ())
            .map_err(|err| fold(identifier, err))
    }

    async fn delete_instance(&self, identifier: &str) -> Result<(), Error> {
        self.client
            .delete_db_instance()
            .db_instance_identifier(identifier)
            .skip_final_snapshot(true)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| fold(identifier, err))
    }

    async fn instance_exists(&self, identifier: &str) -> Result<bool, Error> {
        match self
            .client
            .describe_db_instances()
            .db_instance_identifier(identifier)
            .send()
            .await
        {
            Ok(output) => Ok(!output.db_instances().is_empty()),
            Err(err) => {
                let err = fold(identifier, err);
                if err.is_not_found() {
                    return Ok(false);
                }

                Err(err)
            }
        }
    }
}

// -----------------------------------------------------------------------------
// SdkCacheApi structure

pub struct SdkCacheApi {
    client: elasticache::Client,
}

impl SdkCacheApi {
    pub fn new(credentials: &Credentials, region: &str) -> Self {
        let config = elasticache::Config::builder()
            .behavior_version(elasticache::config::BehaviorVersion::latest())
            .region(elasticache::config::Region::new(region.to_owned()))
            .credentials_provider(sdk_credentials(credentials))
            .build();

        Self {
            client: elasticache::Client::from_conf(config),
        }
    }
}

#[async_trait]
impl CacheApi for SdkCacheApi {
    async fn list_clusters(&self) -> Result<Vec<CacheCluster>, Error> {
        let output = self
            .client
            .describe_cache_clusters()
            .show_cache_node_info(true)
            .send()
            .await
            .map_err(|err| fold("clusters", err))?;

        Ok(output
            .cache_clusters()
            .iter()
            .map(|cluster| CacheCluster {
                identifier: cluster.cache_cluster_id().unwrap_or_default().to_string(),
                host: cluster
                    .cache_nodes()
                    .first()
                    .and_then(|node| node.endpoint())
                    .and_then(|endpoint| endpoint.address())
                    .map(ToOwned::to_owned),
                port: cluster
                    .cache_nodes()
                    .first()
                    .and_then(|node| node.endpoint())
                    .and_then(|endpoint| endpoint.port()),
                status: cluster.cache_cluster_status().map(ToOwned::to_owned),
            })
            .collect())
    }

    async fn create_cluster(
        &self,
        identifier: &str,
        spec: &CreateCacheSpec,
    ) -> Result<(), Error> {
        let mut request = self
            .client
            .create_cache_cluster()
            .cache_cluster_id(identifier)
            .engine("redis")
            .cache_node_type(&spec.node_type)
            .num_cache_nodes(1);

        if let Some(version) = &spec.engine_version {
            request = request.engine_version(version);
        }
        if let Some(port) = spec.port {
            request = request.port(port);
        }

        request
            .send()
            .await
            .map(|_| ())
            .map_err(|err| fold(identifier, err))
    }

    async fn delete_cluster(&self, identifier: &str) -> Result<(), Error> {
        self.client
            .delete_cache_cluster()
            .cache_cluster_id(identifier)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| fold(identifier, err))
    }

    async fn cluster_exists(&self, identifier: &str) -> Result<bool, Error> {
        match self
            .client
            .describe_cache_clusters()
            .cache_cluster_id(identifier)
            .send()
            .await
        {
            Ok(output) => Ok(!output.cache_clusters().is_empty()),
            Err(err) => {
                let err = fold(identifier, err);
                if err.is_not_found() {
                    return Ok(false);
                }

                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CreateDatabaseSpec, Error};

    #[test]
    fn not_found_codes_classify_as_not_found() {
        let err = Error::classify("mydb", Some("DBInstanceNotFound"), "gone".to_string());
        assert!(err.is_not_found());

        let err = Error::classify("mydb", Some("AccessDenied"), "denied".to_string());
        assert!(!err.is_not_found());

        let err = Error::classify("mydb", None, "timeout".to_string());
        assert!(!err.is_not_found());
    }

    #[test]
    fn database_spec_defaults_apply_to_omitted_fields() {
        let spec: CreateDatabaseSpec =
            serde_json::from_str(r#"{"instanceIdentifier": "custom-db"}"#)
                .expect("spec to decode");

        assert_eq!(Some("custom-db".to_string()), spec.instance_identifier);
        assert_eq!("postgres", &spec.database);
        assert_eq!("db.t3.micro", &spec.instance_class);
        assert_eq!(20, spec.allocated_storage);
    }
}
