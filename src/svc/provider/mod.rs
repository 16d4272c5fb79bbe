//! # Provider module
//!
//! This module provide the strategy resolution and provider reconciliation
//! engine: the deployment strategy mapping, the provider capability traits
//! for each resource kind and the registry routing a resource request to
//! exactly one provider implementation

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::svc::{
    cfg::Configuration,
    crd::{blobstorage::BlobStorage, postgres::Postgres, redis::Redis, smtpcredentials::SmtpCredentialSet},
};

pub mod aws;
pub mod config;
pub mod openshift;
pub mod poll;

// -----------------------------------------------------------------------------
// Constants

/// requeue period once a resource reached a terminal phase
pub const DEFAULT_RECONCILE_TIME: Duration = Duration::from_secs(300);

/// requeue period while the remote resource is still materializing
pub const PENDING_RECONCILE_TIME: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// ResourceKind enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum ResourceKind {
    BlobStorage,
    Postgres,
    Redis,
    SmtpCredentials,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::BlobStorage => write!(f, "blobstorage"),
            Self::Postgres => write!(f, "postgres"),
            Self::Redis => write!(f, "redis"),
            Self::SmtpCredentials => write!(f, "smtpCredentials"),
        }
    }
}

// -----------------------------------------------------------------------------
// DeploymentStrategyMapping structure

/// maps each resource kind to the provider implementation selected for one
/// deployment type. Decoding fails unless all four kinds are present
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct DeploymentStrategyMapping {
    #[serde(rename = "blobstorage")]
    pub blob_storage: String,
    #[serde(rename = "smtpCredentials")]
    pub smtp_credentials: String,
    #[serde(rename = "redis")]
    pub redis: String,
    #[serde(rename = "postgres")]
    pub postgres: String,
}

impl DeploymentStrategyMapping {
    pub fn provider_for(&self, kind: ResourceKind) -> &str {
        match kind {
            ResourceKind::BlobStorage => &self.blob_storage,
            ResourceKind::Postgres => &self.postgres,
            ResourceKind::Redis => &self.redis,
            ResourceKind::SmtpCredentials => &self.smtp_credentials,
        }
    }
}

// -----------------------------------------------------------------------------
// StrategyConfig structure

/// per resource-kind and tier configuration resolved from the strategy store.
/// The raw strategy payload is kept opaque here, only the concrete provider
/// owning the resource kind decodes it
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StrategyConfig {
    #[serde(rename = "region", default)]
    pub region: String,
    #[serde(rename = "createStrategy", default)]
    pub raw_strategy: Option<Box<RawValue>>,
}

// -----------------------------------------------------------------------------
// DeploymentDetails trait

/// connection data of a provisioned resource, persisted as the data of a
/// kubernetes secret
pub trait DeploymentDetails: Debug + Send + Sync {
    fn data(&self) -> BTreeMap<String, Vec<u8>>;
}

// -----------------------------------------------------------------------------
// Instance structures

#[derive(Debug)]
pub struct BlobStorageInstance {
    pub deployment_details: Box<dyn DeploymentDetails>,
}

#[derive(Debug)]
pub struct PostgresInstance {
    pub deployment_details: Box<dyn DeploymentDetails>,
}

#[derive(Debug)]
pub struct RedisInstance {
    pub deployment_details: Box<dyn DeploymentDetails>,
}

#[derive(Debug)]
pub struct SmtpCredentialsInstance {
    pub deployment_details: Box<dyn DeploymentDetails>,
}

// -----------------------------------------------------------------------------
// Shared deployment details structures

/// connection details of a managed postgres database, whichever provider
/// created it
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct PostgresDeploymentDetails {
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl DeploymentDetails for PostgresDeploymentDetails {
    fn data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            ("host".to_string(), self.host.to_owned().into_bytes()),
            ("port".to_string(), self.port.to_string().into_bytes()),
            ("username".to_string(), self.username.to_owned().into_bytes()),
            ("password".to_string(), self.password.to_owned().into_bytes()),
            ("database".to_string(), self.database.to_owned().into_bytes()),
        ])
    }
}

/// connection details of a managed redis instance
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct RedisDeploymentDetails {
    pub host: String,
    pub port: i32,
}

impl DeploymentDetails for RedisDeploymentDetails {
    fn data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            ("host".to_string(), self.host.to_owned().into_bytes()),
            ("port".to_string(), self.port.to_string().into_bytes()),
        ])
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to update finalizer on resource '{namespace}/{name}', {source}")]
    Finalizer {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[error(
        "failed to resolve deployment strategy for tier '{tier}' of resource '{namespace}/{name}', {source}"
    )]
    Strategy {
        namespace: String,
        name: String,
        tier: String,
        source: config::Error,
    },
    #[error("failed to decode strategy payload for resource '{namespace}/{name}', {source}")]
    Payload {
        namespace: String,
        name: String,
        source: serde_json::Error,
    },
    #[error("failed to compute diff between the original and modified resource '{namespace}/{name}', {source}")]
    Diff {
        namespace: String,
        name: String,
        source: serde_json::Error,
    },
    #[error("failed to provision credentials for resource '{namespace}/{name}', {source}")]
    Credentials {
        namespace: String,
        name: String,
        source: aws::credentials::Error,
    },
    #[error(
        "failed to execute request on the cloud provider api for resource '{namespace}/{name}', {source}"
    )]
    Remote {
        namespace: String,
        name: String,
        source: aws::client::Error,
    },
    #[error(
        "failed to execute request on the kubernetes api for resource '{namespace}/{name}', {source}"
    )]
    Kube {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[error("timed out waiting on the cloud provider api for resource '{namespace}/{name}', {source}")]
    Timeout {
        namespace: String,
        name: String,
        source: poll::TimeoutError,
    },
}

impl Error {
    fn context<T>(obj: &T) -> (String, String)
    where
        T: ResourceExt,
    {
        (
            obj.namespace().unwrap_or_else(|| "<none>".to_string()),
            obj.name_any(),
        )
    }

    pub fn finalizer<T: ResourceExt>(obj: &T, source: kube::Error) -> Self {
        let (namespace, name) = Self::context(obj);
        Self::Finalizer {
            namespace,
            name,
            source,
        }
    }

    pub fn strategy<T: ResourceExt>(obj: &T, tier: &str, source: config::Error) -> Self {
        let (namespace, name) = Self::context(obj);
        Self::Strategy {
            namespace,
            name,
            tier: tier.to_string(),
            source,
        }
    }

    pub fn payload<T: ResourceExt>(obj: &T, source: serde_json::Error) -> Self {
        let (namespace, name) = Self::context(obj);
        Self::Payload {
            namespace,
            name,
            source,
        }
    }

    pub fn diff<T: ResourceExt>(obj: &T, source: serde_json::Error) -> Self {
        let (namespace, name) = Self::context(obj);
        Self::Diff {
            namespace,
            name,
            source,
        }
    }

    pub fn credentials<T: ResourceExt>(obj: &T, source: aws::credentials::Error) -> Self {
        let (namespace, name) = Self::context(obj);
        Self::Credentials {
            namespace,
            name,
            source,
        }
    }

    pub fn remote<T: ResourceExt>(obj: &T, source: aws::client::Error) -> Self {
        let (namespace, name) = Self::context(obj);
        Self::Remote {
            namespace,
            name,
            source,
        }
    }

    pub fn kube<T: ResourceExt>(obj: &T, source: kube::Error) -> Self {
        let (namespace, name) = Self::context(obj);
        Self::Kube {
            namespace,
            name,
            source,
        }
    }

    pub fn timeout<T: ResourceExt>(obj: &T, source: poll::TimeoutError) -> Self {
        let (namespace, name) = Self::context(obj);
        Self::Timeout {
            namespace,
            name,
            source,
        }
    }
}

// -----------------------------------------------------------------------------
// Provider traits

/// lifecycle management of object storage buckets for one cloud vendor
#[async_trait]
pub trait BlobStorageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_strategy(&self, strategy: &str) -> bool;

    fn reconcile_time(&self, obj: &BlobStorage) -> Duration;

    /// returns the instance once the bucket is usable, or `None` while the
    /// remote resource is still materializing
    async fn create_storage(&self, obj: &BlobStorage)
        -> Result<Option<BlobStorageInstance>, Error>;

    async fn delete_storage(&self, obj: &BlobStorage) -> Result<(), Error>;
}

/// lifecycle management of managed postgres databases for one cloud vendor
#[async_trait]
pub trait PostgresProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_strategy(&self, strategy: &str) -> bool;

    fn reconcile_time(&self, obj: &Postgres) -> Duration;

    async fn create_postgres(&self, obj: &Postgres) -> Result<Option<PostgresInstance>, Error>;

    async fn delete_postgres(&self, obj: &Postgres) -> Result<(), Error>;
}

/// lifecycle management of managed redis instances for one cloud vendor
#[async_trait]
pub trait RedisProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_strategy(&self, strategy: &str) -> bool;

    fn reconcile_time(&self, obj: &Redis) -> Duration;

    async fn create_redis(&self, obj: &Redis) -> Result<Option<RedisInstance>, Error>;

    async fn delete_redis(&self, obj: &Redis) -> Result<(), Error>;
}

/// lifecycle management of smtp credential sets for one cloud vendor
#[async_trait]
pub trait SmtpCredentialsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_strategy(&self, strategy: &str) -> bool;

    fn reconcile_time(&self, obj: &SmtpCredentialSet) -> Duration;

    async fn create_smtp_credentials(
        &self,
        obj: &SmtpCredentialSet,
    ) -> Result<Option<SmtpCredentialsInstance>, Error>;

    async fn delete_smtp_credentials(&self, obj: &SmtpCredentialSet) -> Result<(), Error>;
}

// -----------------------------------------------------------------------------
// Registry structure

/// closed set of provider implementations, resolved once at startup. The
/// reconcilers route each resource request to the single provider answering
/// for the strategy selected by the deployment strategy mapping
pub struct Registry {
    blob_storage: Vec<Arc<dyn BlobStorageProvider>>,
    postgres: Vec<Arc<dyn PostgresProvider>>,
    redis: Vec<Arc<dyn RedisProvider>>,
    smtp_credentials: Vec<Arc<dyn SmtpCredentialsProvider>>,
}

impl Registry {
    pub fn new(kube: &kube::Client, config: &Arc<Configuration>) -> Self {
        let credentials = Arc::new(aws::credentials::CredentialMinterCredentialManager::new(
            kube.to_owned(),
        ));
        let aws_strategies = Arc::new(aws::config::ConfigManager::new(kube.to_owned(), config));
        let openshift_strategies =
            Arc::new(openshift::ConfigManager::new(kube.to_owned(), config));
        let factory = Arc::new(aws::client::SdkFactory::default());

        Self {
            blob_storage: vec![Arc::new(aws::blobstorage::BlobStorageProvider::new(
                kube.to_owned(),
                aws_strategies.to_owned(),
                credentials.to_owned(),
                factory.to_owned(),
            ))],
            postgres: vec![
                Arc::new(aws::postgres::PostgresProvider::new(
                    kube.to_owned(),
                    aws_strategies.to_owned(),
                    credentials.to_owned(),
                    factory.to_owned(),
                )),
                Arc::new(openshift::postgres::PostgresProvider::new(
                    kube.to_owned(),
                    openshift_strategies.to_owned(),
                )),
            ],
            redis: vec![
                Arc::new(aws::redis::RedisProvider::new(
                    kube.to_owned(),
                    aws_strategies.to_owned(),
                    credentials.to_owned(),
                    factory.to_owned(),
                )),
                Arc::new(openshift::redis::RedisProvider::new(
                    kube.to_owned(),
                    openshift_strategies,
                )),
            ],
            smtp_credentials: vec![Arc::new(
                aws::smtpcredentials::SmtpCredentialsProvider::new(
                    kube.to_owned(),
                    aws_strategies,
                    credentials,
                ),
            )],
        }
    }

    pub fn blob_storage(&self, strategy: &str) -> Option<Arc<dyn BlobStorageProvider>> {
        self.blob_storage
            .iter()
            .find(|provider| provider.supports_strategy(strategy))
            .map(Arc::to_owned)
    }

    pub fn postgres(&self, strategy: &str) -> Option<Arc<dyn PostgresProvider>> {
        self.postgres
            .iter()
            .find(|provider| provider.supports_strategy(strategy))
            .map(Arc::to_owned)
    }

    pub fn redis(&self, strategy: &str) -> Option<Arc<dyn RedisProvider>> {
        self.redis
            .iter()
            .find(|provider| provider.supports_strategy(strategy))
            .map(Arc::to_owned)
    }

    pub fn smtp_credentials(&self, strategy: &str) -> Option<Arc<dyn SmtpCredentialsProvider>> {
        self.smtp_credentials
            .iter()
            .find(|provider| provider.supports_strategy(strategy))
            .map(Arc::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::{DeploymentDetails, DeploymentStrategyMapping, PostgresDeploymentDetails, ResourceKind};

    #[test]
    fn mapping_decodes_with_all_kinds() {
        let mapping: DeploymentStrategyMapping = serde_json::from_str(
            r#"{"blobstorage":"aws", "smtpCredentials": "aws", "redis":"aws", "postgres":"aws"}"#,
        )
        .expect("mapping to decode");

        assert_eq!("aws", mapping.provider_for(ResourceKind::BlobStorage));
        assert_eq!("aws", mapping.provider_for(ResourceKind::Postgres));
    }

    #[test]
    fn mapping_requires_all_kinds() {
        let result: Result<DeploymentStrategyMapping, _> =
            serde_json::from_str(r#"{"blobstorage":"aws", "redis":"aws", "postgres":"aws"}"#);

        assert!(result.is_err());
    }

    #[test]
    fn postgres_details_expose_connection_data() {
        let details = PostgresDeploymentDetails {
            host: "mydb.cluster.local".to_string(),
            port: 5432,
            username: "admin".to_string(),
            password: "secret".to_string(),
            database: "postgres".to_string(),
        };

        let data = details.data();

        assert_eq!(b"mydb.cluster.local".to_vec(), data["host"]);
        assert_eq!(b"5432".to_vec(), data["port"]);
        assert_eq!(5, data.len());
    }
}
