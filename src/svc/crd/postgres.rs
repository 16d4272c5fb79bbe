//! # Postgres resource request
//!
//! This module provide the postgres custom resource, its definition and
//! reconciliation loop

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use kube::{
    runtime::{controller, watcher, Controller},
    Api, CustomResource, Resource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::svc::{
    crd::{Phase, Status},
    k8s::{self, recorder, resource, secret, Context, ControllerBuilder},
    provider::{self, ResourceKind},
};

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "cloud-resources.dev")]
#[kube(version = "v1")]
#[kube(kind = "Postgres")]
#[kube(singular = "postgres")]
#[kube(plural = "postgres")]
#[kube(shortname = "pg")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"tier", "type":"string", "description":"Tier", "jsonPath":".spec.tier"}"#
)]
#[kube(
    printcolumn = r#"{"name":"phase", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#
)]
pub struct Spec {
    #[serde(rename = "tier")]
    pub tier: String,
    #[serde(rename = "secretName", default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

// -----------------------------------------------------------------------------
// Action structure

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Action {
    UpsertPostgres,
    UpsertSecret,
    DeletePostgres,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::UpsertPostgres => write!(f, "UpsertPostgres"),
            Self::UpsertSecret => write!(f, "UpsertSecret"),
            Self::DeletePostgres => write!(f, "DeletePostgres"),
        }
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to resolve deployment strategy mapping, {0}")]
    Strategy(provider::config::Error),
    #[error("no provider supports strategy '{0}' for postgres")]
    UnsupportedStrategy(String),
    #[error("failed to execute provider workflow, {0}")]
    Provider(provider::Error),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<provider::Error> for ReconcilerError {
    fn from(err: provider::Error) -> Self {
        Self::Provider(err)
    }
}

impl From<provider::config::Error> for ReconcilerError {
    fn from(err: provider::config::Error) -> Self {
        Self::Strategy(err)
    }
}

impl From<controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: controller::Error<ReconcilerError, watcher::Error>) -> Self {
        Self::Reconcile(err.to_string())
    }
}

// -----------------------------------------------------------------------------
// helpers

async fn update_status(
    kube: &kube::Client,
    obj: &Postgres,
    status: Status,
) -> Result<(), ReconcilerError> {
    let (namespace, name) = resource::namespaced_name(obj);

    let current: Option<Postgres> = resource::get(kube.to_owned(), &namespace, &name).await?;
    let Some(mut modified) = current else {
        return Ok(());
    };

    let origin = modified.to_owned();

    modified.status = Some(status);

    let patch = resource::diff(&origin, &modified).map_err(ReconcilerError::Diff)?;
    resource::patch_status(kube.to_owned(), modified, patch).await?;

    Ok(())
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<Postgres> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<Postgres> {
        Controller::new(Api::all(context.kube.to_owned()), watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<Postgres> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(
        ctx: Arc<Context>,
        origin: Arc<Postgres>,
    ) -> Result<controller::Action, ReconcilerError> {
        let Context {
            kube,
            strategies,
            providers,
            config: _,
        } = ctx.as_ref();

        let kind = Postgres::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);
        let tier = origin.spec.tier.to_owned();

        // ---------------------------------------------------------------------
        // Step 1: resolve the provider selected for the tier

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            tier = &tier,
            "Resolve deployment strategy mapping for custom resource",
        );

        let mapping = strategies
            .strategy_mapping_for_deployment_type(&tier)
            .await?;
        let strategy = mapping.provider_for(ResourceKind::Postgres);
        let provider = providers
            .postgres(strategy)
            .ok_or_else(|| ReconcilerError::UnsupportedStrategy(strategy.to_string()))?;

        // ---------------------------------------------------------------------
        // Step 2: drive the provider create workflow

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            provider = provider.name(),
            "Create postgres through provider",
        );

        let instance = match provider.create_postgres(&origin).await {
            Ok(instance) => instance,
            Err(err) => {
                update_status(
                    kube,
                    &origin,
                    Status::new(Phase::Failed, &err.to_string(), provider.name(), &tier),
                )
                .await?;

                return Err(ReconcilerError::Provider(err));
            }
        };

        let Some(instance) = instance else {
            update_status(
                kube,
                &origin,
                Status::new(
                    Phase::InProgress,
                    "postgres creation in progress",
                    provider.name(),
                    &tier,
                ),
            )
            .await?;

            return Ok(controller::Action::requeue(
                provider.reconcile_time(&origin),
            ));
        };

        // ---------------------------------------------------------------------
        // Step 3: persist the deployment details as a secret

        let current: Postgres = resource::get(kube.to_owned(), &namespace, &name)
            .await?
            .ok_or_else(|| {
                ReconcilerError::Reconcile("resource disappeared during reconciliation".into())
            })?;

        let secret_name = current
            .spec
            .secret_name
            .to_owned()
            .unwrap_or_else(|| secret::name(&current));
        let s = secret::new(&current, &secret_name, instance.deployment_details.data());

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            secret = &secret_name,
            "Upsert kubernetes secret with deployment details",
        );

        resource::upsert(kube.to_owned(), &s, false).await?;

        let action = &Action::UpsertSecret;
        let message = &format!("Create kubernetes secret '{}'", secret_name);
        recorder::normal(kube.to_owned(), &current, action, message).await?;

        // ---------------------------------------------------------------------
        // Step 4: expose the outcome through the status

        update_status(
            kube,
            &current,
            Status::new(
                Phase::Complete,
                "postgres provisioned",
                provider.name(),
                &tier,
            ),
        )
        .await?;

        let action = &Action::UpsertPostgres;
        let message = &format!("Create postgres for tier '{}'", tier);
        recorder::normal(kube.to_owned(), &current, action, message).await?;

        Ok(controller::Action::requeue(
            provider.reconcile_time(&current),
        ))
    }

    async fn delete(
        ctx: Arc<Context>,
        origin: Arc<Postgres>,
    ) -> Result<controller::Action, ReconcilerError> {
        let Context {
            kube,
            strategies,
            providers,
            config: _,
        } = ctx.as_ref();

        let kind = Postgres::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);
        let tier = origin.spec.tier.to_owned();

        let mapping = strategies
            .strategy_mapping_for_deployment_type(&tier)
            .await?;
        let strategy = mapping.provider_for(ResourceKind::Postgres);
        let provider = providers
            .postgres(strategy)
            .ok_or_else(|| ReconcilerError::UnsupportedStrategy(strategy.to_string()))?;

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            provider = provider.name(),
            "Delete postgres through provider",
        );

        if let Err(err) = provider.delete_postgres(&origin).await {
            update_status(
                kube,
                &origin,
                Status::new(Phase::Failed, &err.to_string(), provider.name(), &tier),
            )
            .await?;

            return Err(ReconcilerError::Provider(err));
        }

        let action = &Action::DeletePostgres;
        let message = "Delete postgres and its credentials";
        recorder::normal(kube.to_owned(), &*origin, action, message).await?;

        Ok(controller::Action::await_change())
    }
}
