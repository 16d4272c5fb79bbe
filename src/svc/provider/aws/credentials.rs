//! # Credential module
//!
//! This module provide the credential manager issuing aws credentials through
//! credentials request resources, minted by the cluster credential operator

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{api::PostParams, Api, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::svc::{k8s::resource, provider::poll};

// -----------------------------------------------------------------------------
// Constants

/// name of the credentials request carrying the operator's own provider
/// credentials, one per namespace
pub const PROVIDER_CREDENTIALS_NAME: &str = "cloud-resources-aws-credentials";

pub const ACCESS_KEY_ID: &str = "aws_access_key_id";
pub const SECRET_ACCESS_KEY: &str = "aws_secret_access_key";

// -----------------------------------------------------------------------------
// CredentialsRequest custom resource

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretRef {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "namespace")]
    pub namespace: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct StatementEntry {
    #[serde(rename = "effect")]
    pub effect: String,
    #[serde(rename = "action")]
    pub action: Vec<String>,
    #[serde(rename = "resource")]
    pub resource: String,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct AwsProviderSpec {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    #[serde(rename = "statementEntries")]
    pub statement_entries: Vec<StatementEntry>,
}

/// request for the cluster credential operator to mint an access key pair
/// scoped by the given statement entries and to materialize it in the
/// referenced secret
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "cloudcredential.openshift.io")]
#[kube(version = "v1")]
#[kube(kind = "CredentialsRequest")]
#[kube(singular = "credentialsrequest")]
#[kube(plural = "credentialsrequests")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct CredentialsRequestSpec {
    #[serde(rename = "secretRef")]
    pub secret_ref: SecretRef,
    #[serde(rename = "providerSpec")]
    pub provider_spec: AwsProviderSpec,
}

// -----------------------------------------------------------------------------
// Credentials structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to reconcile credentials request '{0}/{1}', {2}")]
    Reconcile(String, String, #[source] kube::Error),
    #[error("timed out waiting for credentials secret '{0}/{1}' to be provisioned, {2}")]
    Provision(String, String, #[source] poll::TimeoutError),
    #[error("credentials secret '{0}/{1}' is missing key '{2}'")]
    MissingKey(String, String, String),
}

// -----------------------------------------------------------------------------
// CredentialManager trait

/// issues and reconciles the two credential classes used by the providers:
/// provider-level credentials scoped to a namespace and end-user credentials
/// scoped to one created resource. Converges to one credential identity per
/// scope, repeated or concurrent calls never mint a second one
#[async_trait]
pub trait CredentialManager: Send + Sync {
    /// returns stable namespace-wide credentials used by the operator itself
    /// to call the cloud provider api
    async fn reconcile_provider_credentials(&self, namespace: &str)
        -> Result<Credentials, Error>;

    /// returns credentials restricted to the given bucket, handed to the
    /// requester of the blob storage resource
    async fn reconcile_bucket_owner_credentials(
        &self,
        name: &str,
        namespace: &str,
        bucket: &str,
    ) -> Result<Credentials, Error>;

    /// returns credentials restricted to sending mail, handed to the
    /// requester of the smtp credential set
    async fn reconcile_send_mail_credentials(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Credentials, Error>;

    /// removes the credential-issuance artifacts created exclusively for one
    /// resource, an already removed artifact is not an error
    async fn delete_owner_credentials(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

// -----------------------------------------------------------------------------
// CredentialMinterCredentialManager structure

/// [`CredentialManager`] implementation delegating the actual minting to the
/// cluster credential operator through [`CredentialsRequest`] resources
pub struct CredentialMinterCredentialManager {
    client: kube::Client,
}

impl CredentialMinterCredentialManager {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// ensure a credentials request with the given statement entries exists,
    /// then wait for the minted secret and read the access key pair from it
    async fn reconcile(
        &self,
        name: &str,
        namespace: &str,
        statement_entries: Vec<StatementEntry>,
    ) -> Result<Credentials, Error> {
        let existing =
            resource::get::<CredentialsRequest>(self.client.to_owned(), namespace, name)
                .await
                .map_err(|err| Error::Reconcile(namespace.to_string(), name.to_string(), err))?;

        if existing.is_none() {
            info!(
                namespace = namespace,
                name = name,
                "Create credentials request for resource",
            );

            let mut request = CredentialsRequest::new(
                name,
                CredentialsRequestSpec {
                    secret_ref: SecretRef {
                        name: name.to_string(),
                        namespace: namespace.to_string(),
                    },
                    provider_spec: AwsProviderSpec {
                        api_version: "cloudcredential.openshift.io/v1".to_string(),
                        kind: "AWSProviderSpec".to_string(),
                        statement_entries,
                    },
                },
            );
            request.metadata.namespace = Some(namespace.to_string());

            let api: Api<CredentialsRequest> =
                Api::namespaced(self.client.to_owned(), namespace);

            match api.create(&PostParams::default(), &request).await {
                Ok(_) => {}
                // a concurrent reconciliation created the request first, the
                // existing one carries the same identity
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    debug!(
                        namespace = namespace,
                        name = name,
                        "Credentials request was created concurrently, use it",
                    );
                }
                Err(err) => {
                    return Err(Error::Reconcile(
                        namespace.to_string(),
                        name.to_string(),
                        err,
                    ))
                }
            }
        }

        // the credential operator materializes the secret asynchronously
        let client = self.client.to_owned();
        poll::immediate(poll::DEFAULT_INTERVAL, poll::DEFAULT_CEILING, || {
            let client = client.to_owned();

            async move {
                matches!(
                    resource::get::<Secret>(client, namespace, name).await,
                    Ok(Some(secret)) if key(&secret, ACCESS_KEY_ID).is_some()
                        && key(&secret, SECRET_ACCESS_KEY).is_some()
                )
            }
        })
        .await
        .map_err(|err| Error::Provision(namespace.to_string(), name.to_string(), err))?;

        let secret = resource::get::<Secret>(self.client.to_owned(), namespace, name)
            .await
            .map_err(|err| Error::Reconcile(namespace.to_string(), name.to_string(), err))?
            .ok_or_else(|| {
                Error::MissingKey(
                    namespace.to_string(),
                    name.to_string(),
                    ACCESS_KEY_ID.to_string(),
                )
            })?;

        Ok(Credentials {
            access_key_id: key(&secret, ACCESS_KEY_ID).ok_or_else(|| {
                Error::MissingKey(
                    namespace.to_string(),
                    name.to_string(),
                    ACCESS_KEY_ID.to_string(),
                )
            })?,
            secret_access_key: key(&secret, SECRET_ACCESS_KEY).ok_or_else(|| {
                Error::MissingKey(
                    namespace.to_string(),
                    name.to_string(),
                    SECRET_ACCESS_KEY.to_string(),
                )
            })?,
        })
    }
}

#[async_trait]
impl CredentialManager for CredentialMinterCredentialManager {
    async fn reconcile_provider_credentials(
        &self,
        namespace: &str,
    ) -> Result<Credentials, Error> {
        self.reconcile(
            PROVIDER_CREDENTIALS_NAME,
            namespace,
            vec![StatementEntry {
                effect: "Allow".to_string(),
                action: vec![
                    "s3:*".to_string(),
                    "rds:*".to_string(),
                    "elasticache:*".to_string(),
                    "ses:*".to_string(),
                ],
                resource: "*".to_string(),
            }],
        )
        .await
    }

    async fn reconcile_bucket_owner_credentials(
        &self,
        name: &str,
        namespace: &str,
        bucket: &str,
    ) -> Result<Credentials, Error> {
        self.reconcile(
            name,
            namespace,
            vec![
                StatementEntry {
                    effect: "Allow".to_string(),
                    action: vec!["s3:*".to_string()],
                    resource: format!("arn:aws:s3:::{}", bucket),
                },
                StatementEntry {
                    effect: "Allow".to_string(),
                    action: vec!["s3:*".to_string()],
                    resource: format!("arn:aws:s3:::{}/*", bucket),
                },
            ],
        )
        .await
    }

    async fn reconcile_send_mail_credentials(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Credentials, Error> {
        self.reconcile(
            name,
            namespace,
            vec![StatementEntry {
                effect: "Allow".to_string(),
                action: vec!["ses:SendRawEmail".to_string()],
                resource: "*".to_string(),
            }],
        )
        .await
    }

    async fn delete_owner_credentials(&self, name: &str, namespace: &str) -> Result<(), Error> {
        resource::delete::<CredentialsRequest>(self.client.to_owned(), namespace, name)
            .await
            .map_err(|err| Error::Reconcile(namespace.to_string(), name.to_string(), err))
    }
}

// -----------------------------------------------------------------------------
// helpers

fn key(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::{
        CredentialManager, CredentialMinterCredentialManager, PROVIDER_CREDENTIALS_NAME,
    };
    use crate::svc::k8s::mock;

    fn secret(name: &str) -> (String, serde_json::Value) {
        (
            format!("/api/v1/namespaces/ns1/secrets/{}", name),
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": name, "namespace": "ns1"},
                "data": {
                    // base64 of "AKIACCESS" and "SECRETKEY"
                    "aws_access_key_id": "QUtJQUNDRVNT",
                    "aws_secret_access_key": "U0VDUkVUS0VZ",
                },
            }),
        )
    }

    fn request(name: &str) -> (String, serde_json::Value) {
        (
            format!(
                "/apis/cloudcredential.openshift.io/v1/namespaces/ns1/credentialsrequests/{}",
                name
            ),
            json!({
                "apiVersion": "cloudcredential.openshift.io/v1",
                "kind": "CredentialsRequest",
                "metadata": {"name": name, "namespace": "ns1"},
                "spec": {
                    "secretRef": {"name": name, "namespace": "ns1"},
                    "providerSpec": {
                        "apiVersion": "cloudcredential.openshift.io/v1",
                        "kind": "AWSProviderSpec",
                        "statementEntries": [],
                    },
                },
            }),
        )
    }

    #[tokio::test]
    async fn provider_credentials_converge_to_one_identity() {
        let (client, server) = mock::client();
        let (secret_path, secret) = secret(PROVIDER_CREDENTIALS_NAME);
        let (request_path, request) = request(PROVIDER_CREDENTIALS_NAME);
        let handle = server.run(HashMap::from([
            (secret_path, secret),
            (request_path.to_owned(), request),
        ]));

        let manager = CredentialMinterCredentialManager::new(client);

        let first = manager
            .reconcile_provider_credentials("ns1")
            .await
            .expect("credentials to be reconciled");
        let second = manager
            .reconcile_provider_credentials("ns1")
            .await
            .expect("credentials to be reconciled");

        assert_eq!(first, second);
        assert_eq!("AKIACCESS", &first.access_key_id);
        assert_eq!("SECRETKEY", &first.secret_access_key);

        drop(manager);
        let store = handle.await.expect("mock api server to stop");
        assert!(store.contains_key(&request_path));
    }

    #[tokio::test]
    async fn missing_request_is_created_before_waiting_on_the_secret() {
        let (client, server) = mock::client();
        let (secret_path, secret) = secret("mybucket-credentials");
        let handle = server.run(HashMap::from([(secret_path, secret)]));

        let manager = CredentialMinterCredentialManager::new(client);

        manager
            .reconcile_bucket_owner_credentials("mybucket-credentials", "ns1", "ns1-mybucket")
            .await
            .expect("credentials to be reconciled");

        drop(manager);
        let store = handle.await.expect("mock api server to stop");
        let request = store
            .get("/apis/cloudcredential.openshift.io/v1/namespaces/ns1/credentialsrequests/mybucket-credentials")
            .expect("credentials request to be created");

        assert_eq!(
            "arn:aws:s3:::ns1-mybucket",
            request["spec"]["providerSpec"]["statementEntries"][0]["resource"]
        );
    }

    #[tokio::test]
    async fn delete_tolerates_an_already_removed_request() {
        let (client, server) = mock::client();
        let _handle = server.run(HashMap::new());

        let manager = CredentialMinterCredentialManager::new(client);

        manager
            .delete_owner_credentials("mybucket-credentials", "ns1")
            .await
            .expect("an absent credentials request to be a success");
    }
}
