//! # Smtp credentials provider
//!
//! This module provide the smtp credential set provider implementation backed
//! by aws ses. The only remote artifact is the credential identity itself,
//! the smtp password is derived from the minted secret access key

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;

use crate::svc::{
    crd::smtpcredentials::SmtpCredentialSet,
    k8s::{finalizer, resource},
    provider::{
        self,
        aws::{config::ConfigManager, credentials::CredentialManager, DEPLOYMENT_STRATEGY},
        DeploymentDetails, Error, SmtpCredentialsInstance, DEFAULT_RECONCILE_TIME,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const SMTP_FINALIZER: &str = "cloud-resources.dev/aws-smtpcredentials";

pub const SMTP_PORT: i32 = 587;

/// message and version byte of the legacy ses smtp password derivation
const SMTP_MESSAGE: &[u8] = b"SendRawEmail";
const SMTP_VERSION: u8 = 0x02;

const DATA_HOST: &str = "host";
const DATA_PORT: &str = "port";
const DATA_USERNAME: &str = "username";
const DATA_PASSWORD: &str = "password";

// -----------------------------------------------------------------------------
// SmtpCredentialsDeploymentDetails structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct SmtpCredentialsDeploymentDetails {
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
}

impl DeploymentDetails for SmtpCredentialsDeploymentDetails {
    fn data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            (DATA_HOST.to_string(), self.host.to_owned().into_bytes()),
            (DATA_PORT.to_string(), self.port.to_string().into_bytes()),
            (
                DATA_USERNAME.to_string(),
                self.username.to_owned().into_bytes(),
            ),
            (
                DATA_PASSWORD.to_string(),
                self.password.to_owned().into_bytes(),
            ),
        ])
    }
}

// -----------------------------------------------------------------------------
// SmtpCredentialsProvider structure

pub struct SmtpCredentialsProvider {
    client: kube::Client,
    strategies: Arc<ConfigManager>,
    credentials: Arc<dyn CredentialManager>,
}

impl SmtpCredentialsProvider {
    pub fn new(
        client: kube::Client,
        strategies: Arc<ConfigManager>,
        credentials: Arc<dyn CredentialManager>,
    ) -> Self {
        Self {
            client,
            strategies,
            credentials,
        }
    }
}

fn end_user_credentials_name(name: &str) -> String {
    format!("cloud-resources-aws-smtp-{}-credentials", name)
}

/// derive the smtp password from the secret access key, the way ses expects
/// it for legacy smtp credentials
pub fn smtp_password(secret_access_key: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret_access_key.as_bytes())
        .expect("hmac to accept keys of any length");
    mac.update(SMTP_MESSAGE);

    let signature = mac.finalize().into_bytes();
    let mut bytes = vec![SMTP_VERSION];
    bytes.extend_from_slice(&signature);

    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[async_trait]
impl provider::SmtpCredentialsProvider for SmtpCredentialsProvider {
    fn name(&self) -> &'static str {
        DEPLOYMENT_STRATEGY
    }

    fn supports_strategy(&self, strategy: &str) -> bool {
        strategy == DEPLOYMENT_STRATEGY
    }

    fn reconcile_time(&self, _obj: &SmtpCredentialSet) -> Duration {
        DEFAULT_RECONCILE_TIME
    }

    async fn create_smtp_credentials(
        &self,
        obj: &SmtpCredentialSet,
    ) -> Result<Option<SmtpCredentialsInstance>, Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: attach the finalizer before any remote side effect

        if !resource::deleted(obj) && !finalizer::contains(obj, SMTP_FINALIZER) {
            info!(
                namespace = &namespace,
                name = &name,
                "Attach finalizer to smtp credential set resource",
            );

            let modified = finalizer::add(obj.to_owned(), SMTP_FINALIZER);
            let patch = resource::diff(obj, &modified).map_err(|err| Error::diff(obj, err))?;

            resource::patch(self.client.to_owned(), &modified, patch)
                .await
                .map_err(|err| Error::finalizer(obj, err))?;
        }

        // ---------------------------------------------------------------------
        // Step 2: resolve the strategy, only the region matters here

        let strategy = self
            .strategies
            .read_smtp_credentials_strategy(&obj.spec.tier)
            .await
            .map_err(|err| Error::strategy(obj, &obj.spec.tier, err))?;

        // ---------------------------------------------------------------------
        // Step 3: reconcile the end-user credential identity and derive the
        // smtp password from it

        let credentials_name = end_user_credentials_name(&name);

        info!(
            namespace = &namespace,
            name = &name,
            credentials = &credentials_name,
            "Reconcile send-mail credentials",
        );

        let end_user = self
            .credentials
            .reconcile_send_mail_credentials(&credentials_name, &namespace)
            .await
            .map_err(|err| Error::credentials(obj, err))?;

        Ok(Some(SmtpCredentialsInstance {
            deployment_details: Box::new(SmtpCredentialsDeploymentDetails {
                host: format!("email-smtp.{}.amazonaws.com", strategy.region),
                port: SMTP_PORT,
                username: end_user.access_key_id,
                password: smtp_password(&end_user.secret_access_key),
            }),
        }))
    }

    async fn delete_smtp_credentials(&self, obj: &SmtpCredentialSet) -> Result<(), Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        // ---------------------------------------------------------------------
        // Step 1: remove the credential-issuance artifacts

        let credentials_name = end_user_credentials_name(&name);

        info!(
            namespace = &namespace,
            name = &name,
            credentials = &credentials_name,
            "Delete send-mail credentials request",
        );

        self.credentials
            .delete_owner_credentials(&credentials_name, &namespace)
            .await
            .map_err(|err| Error::credentials(obj, err))?;

        // ---------------------------------------------------------------------
        // Step 2: release the finalizer, this must stay the last step

        info!(
            namespace = &namespace,
            name = &name,
            "Remove finalizer from smtp credential set resource",
        );

        let modified = finalizer::remove(obj.to_owned(), SMTP_FINALIZER);
        let patch = resource::diff(obj, &modified).map_err(|err| Error::diff(obj, err))?;

        resource::patch(self.client.to_owned(), &modified, patch)
            .await
            .map_err(|err| Error::finalizer(obj, err))?;

        Ok(())
    }
}
