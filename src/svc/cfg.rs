//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::path::PathBuf;

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_STRATEGY_CONFIGMAP: &str = "cloud-resource-config";
pub const DEFAULT_STRATEGY_NAMESPACE: &str = "kube-system";
pub const DEFAULT_AWS_STRATEGY_CONFIGMAP: &str = "cloud-resources-aws-strategies";
pub const DEFAULT_OPENSHIFT_STRATEGY_CONFIGMAP: &str = "cloud-resources-openshift-strategies";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
}

// -----------------------------------------------------------------------------
// Strategies structure

/// coordinates of the strategy store configmap holding the per deployment-type
/// provider mapping
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Strategies {
    #[serde(rename = "configmap")]
    pub configmap: String,
    #[serde(rename = "namespace")]
    pub namespace: String,
}

// -----------------------------------------------------------------------------
// Aws structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Aws {
    #[serde(rename = "strategies")]
    pub strategies: String,
}

// -----------------------------------------------------------------------------
// OpenShift structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct OpenShift {
    #[serde(rename = "strategies")]
    pub strategies: String,
}

// -----------------------------------------------------------------------------
// Configuration structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "strategies")]
    pub strategies: Strategies,
    #[serde(rename = "aws")]
    pub aws: Aws,
    #[serde(rename = "openshift")]
    pub openshift: OpenShift,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults(Config::builder())?
            .add_source(
                Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_"))
                    .separator("__"),
            )
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut builder = defaults(Config::builder())?.add_source(
            Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_")).separator("__"),
        );

        for path in [
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from("config"),
        ] {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Cast)
    }
}

// -----------------------------------------------------------------------------
// helpers

fn defaults(builder: ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, Error> {
    [
        ("strategies.configmap", DEFAULT_STRATEGY_CONFIGMAP),
        ("strategies.namespace", DEFAULT_STRATEGY_NAMESPACE),
        ("aws.strategies", DEFAULT_AWS_STRATEGY_CONFIGMAP),
        ("openshift.strategies", DEFAULT_OPENSHIFT_STRATEGY_CONFIGMAP),
    ]
    .into_iter()
    .try_fold(builder, |builder, (key, value)| {
        builder
            .set_default(key, value)
            .map_err(|err| Error::Default(key.into(), err))
    })
}

#[cfg(test)]
mod tests {
    use super::Configuration;

    #[test]
    fn configuration_defaults() {
        let configuration = Configuration::try_default().expect("configuration to load");

        assert_eq!("cloud-resource-config", &configuration.strategies.configmap);
        assert_eq!("kube-system", &configuration.strategies.namespace);
        assert_eq!(
            "cloud-resources-aws-strategies",
            &configuration.aws.strategies
        );
    }
}
