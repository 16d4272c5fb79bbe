//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface
//! function implementation

use std::{error::Error, str::FromStr, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use kube::CustomResourceExt;

use crate::{
    cmd::Executor,
    svc::{
        cfg::Configuration,
        crd::{
            blobstorage::BlobStorage, postgres::Postgres, redis::Redis,
            smtpcredentials::SmtpCredentialSet,
        },
    },
};

// -----------------------------------------------------------------------------
// CustomResource enum

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum CustomResource {
    BlobStorage,
    Postgres,
    Redis,
    SmtpCredentialSet,
}

impl FromStr for CustomResource {
    type Err = Box<dyn Error + Send + Sync>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blobstorage" => Ok(Self::BlobStorage),
            "postgres" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            "smtpcredentialset" => Ok(Self::SmtpCredentialSet),
            _ => Err(format!(
                "failed to parse '{}', available options are 'blobstorage', 'postgres', 'redis' or 'smtpcredentialset'",
                s
            )
            .into()),
        }
    }
}

// -----------------------------------------------------------------------------
// CustomResourceDefinitionError enum

#[derive(thiserror::Error, Debug)]
pub enum CustomResourceDefinitionError {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// CustomResourceDefinition enum

#[derive(Subcommand, Clone, Debug)]
pub enum CustomResourceDefinition {
    /// View custom resource definition
    #[clap(name = "view", aliases = &["v"])]
    View {
        #[clap(name = "custom-resource")]
        custom_resource: Option<CustomResource>,
    },
}

#[async_trait]
impl Executor for CustomResourceDefinition {
    type Error = CustomResourceDefinitionError;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::View { custom_resource } => view(config, custom_resource).await,
        }
    }
}

// -----------------------------------------------------------------------------
// view function

pub async fn view(
    _config: Arc<Configuration>,
    custom_resource: &Option<CustomResource>,
) -> Result<(), CustomResourceDefinitionError> {
    let crds = match custom_resource {
        Some(cr) => {
            vec![match cr {
                CustomResource::BlobStorage => serde_yaml::to_string(&BlobStorage::crd())
                    .map_err(CustomResourceDefinitionError::Serialize)?,
                CustomResource::Postgres => serde_yaml::to_string(&Postgres::crd())
                    .map_err(CustomResourceDefinitionError::Serialize)?,
                CustomResource::Redis => serde_yaml::to_string(&Redis::crd())
                    .map_err(CustomResourceDefinitionError::Serialize)?,
                CustomResource::SmtpCredentialSet => {
                    serde_yaml::to_string(&SmtpCredentialSet::crd())
                        .map_err(CustomResourceDefinitionError::Serialize)?
                }
            }]
        }
        None => vec![
            serde_yaml::to_string(&BlobStorage::crd())
                .map_err(CustomResourceDefinitionError::Serialize)?,
            serde_yaml::to_string(&Postgres::crd())
                .map_err(CustomResourceDefinitionError::Serialize)?,
            serde_yaml::to_string(&Redis::crd())
                .map_err(CustomResourceDefinitionError::Serialize)?,
            serde_yaml::to_string(&SmtpCredentialSet::crd())
                .map_err(CustomResourceDefinitionError::Serialize)?,
        ],
    };

    print!("{}", crds.join(""));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use kube::CustomResourceExt;

    use super::CustomResource;
    use crate::svc::crd::postgres::Postgres;

    #[test]
    fn custom_resource_parses_from_kind_name() {
        assert_eq!(
            CustomResource::Postgres,
            CustomResource::from_str("postgres").expect("kind to parse"),
        );
        assert!(CustomResource::from_str("mongodb").is_err());
    }

    #[test]
    fn crd_generation_carries_the_status_sub_resource() {
        let crd = Postgres::crd();

        assert_eq!("postgres.cloud-resources.dev", crd.metadata.name.as_deref().unwrap());
        assert!(crd.spec.versions[0].subresources.is_some());
    }
}
