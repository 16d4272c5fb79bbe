//! # Custom resource definition module
//!
//! This module provide the resource request custom resources managed by the
//! operator, their structures, implementation and reconciliation loop

use std::fmt::{self, Display, Formatter};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod blobstorage;
pub mod postgres;
pub mod redis;
pub mod smtpcredentials;

// -----------------------------------------------------------------------------
// Phase enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Phase {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// -----------------------------------------------------------------------------
// Status structure

/// status sub-resource shared by the four resource request kinds
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "phase", default)]
    pub phase: Phase,
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "provider", skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "strategy", skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl Status {
    pub fn new(phase: Phase, message: &str, provider: &str, strategy: &str) -> Self {
        Self {
            phase,
            message: Some(message.to_string()),
            provider: Some(provider.to_string()),
            strategy: Some(strategy.to_string()),
        }
    }
}
