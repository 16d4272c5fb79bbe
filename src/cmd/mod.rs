//! # Command module
//!
//! This module provide command line interface structures and helpers

use std::{io, path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::svc::{
    cfg::Configuration,
    crd::{blobstorage, postgres, redis, smtpcredentials},
    k8s::{client, Context, Watcher},
    provider::{config::ConfigMapConfigManager, Registry},
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// CommandError enum

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<CommandError>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::CustomResourceDefinitionError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(subcommand, name = "custom-resource-definition", aliases = &["crd"])]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = CommandError;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(CommandError::CustomResourceDefinition)
                .map_err(|err| {
                    CommandError::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Create the strategy store manager and the provider registry, resolved
    // once for the whole process
    let strategies = Arc::new(ConfigMapConfigManager::with_defaults(
        kube.to_owned(),
        &config,
    ));
    let providers = Arc::new(Registry::new(&kube, &config));

    // -------------------------------------------------------------------------
    // Create the context given to each reconciler
    let context = Arc::new(Context::new(kube, strategies, providers, config));

    // -------------------------------------------------------------------------
    // Create reconcilers
    let mut handles = vec![];

    let ctx = context.to_owned();
    handles.push(tokio::spawn(async move {
        let reconciler = blobstorage::Reconciler::default();

        info!("Start to listen for events of blob storage custom resource");
        if let Err(err) = reconciler.watch(ctx).await {
            error!(
                error = err.to_string(),
                "Could not reconcile blob storage custom resource",
            );
        }

        abort();
    }));

    let ctx = context.to_owned();
    handles.push(tokio::spawn(async move {
        let reconciler = postgres::Reconciler::default();

        info!("Start to listen for events of postgres custom resource");
        if let Err(err) = reconciler.watch(ctx).await {
            error!(
                error = err.to_string(),
                "Could not reconcile postgres custom resource",
            );
        }

        abort();
    }));

    let ctx = context.to_owned();
    handles.push(tokio::spawn(async move {
        let reconciler = redis::Reconciler::default();

        info!("Start to listen for events of redis custom resource");
        if let Err(err) = reconciler.watch(ctx).await {
            error!(
                error = err.to_string(),
                "Could not reconcile redis custom resource",
            );
        }

        abort();
    }));

    let ctx = context.to_owned();
    handles.push(tokio::spawn(async move {
        let reconciler = smtpcredentials::Reconciler::default();

        info!("Start to listen for events of smtp credential set custom resource");
        if let Err(err) = reconciler.watch(ctx).await {
            error!(
                error = err.to_string(),
                "Could not reconcile smtp credential set custom resource",
            );
        }

        abort();
    }));

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c()
        .await
        .map_err(DaemonError::SigTerm)?;

    // -------------------------------------------------------------------------
    // Cancel reconcilers
    handles.iter().for_each(|handle| handle.abort());

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(
                    error = err.to_string(),
                    "Could not wait for the task to complete",
                );
            }
        }
    }

    Ok(())
}
