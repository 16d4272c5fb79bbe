//! # AWS provider module
//!
//! This module provide the provider implementations backed by amazon web
//! services, their strategy resolution and credential management

pub mod blobstorage;
pub mod client;
pub mod config;
pub mod credentials;
pub mod postgres;
pub mod redis;
pub mod smtpcredentials;

// -----------------------------------------------------------------------------
// Constants

/// name advertised by every aws provider implementation and matched against
/// the deployment strategy mapping
pub const DEPLOYMENT_STRATEGY: &str = "aws";

/// region used when the strategy payload does not set one explicitly
pub const DEFAULT_REGION: &str = "eu-west-2";
