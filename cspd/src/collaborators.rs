//! Business-logic collaborators consumed by the connection manager.
//!
//! The manager decides nothing about deployments, push persistence or test
//! execution itself; it calls these capability traits, injected at
//! construction. [`crate::standalone`] provides the in-tree implementations.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use csp_common::{PushRecord, PushStatus};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::standalone::{AlwaysValidVerifier, InMemoryPushRepository, QueuedVerificationRunner};

/// Outcome of a deployment check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentVerdict {
    pub is_valid: bool,
    pub error_message: String,
    /// Extra context logged when the connection is admitted.
    pub log_fields: BTreeMap<String, String>,
}

impl DeploymentVerdict {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn invalid(error_message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error_message: error_message.into(),
            log_fields: BTreeMap::new(),
        }
    }
}

#[async_trait]
pub trait DeploymentVerifier: Send + Sync {
    /// Decide whether `(app_id, deployment_id)` may be paired.
    async fn verify(&self, app_id: &str, deployment_id: &str) -> DeploymentVerdict;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("push {0} not found")]
    UnknownPush(String),

    #[error("push {0} already exists")]
    Duplicate(String),

    #[error("push {push_id} cannot move from {from} to {to}")]
    IllegalTransition {
        push_id: String,
        from: PushStatus,
        to: PushStatus,
    },
}

#[async_trait]
pub trait PushRepository: Send + Sync {
    async fn create(&self, record: PushRecord) -> Result<PushRecord, RepositoryError>;

    async fn update(&self, push_id: &str, status: PushStatus) -> Result<(), RepositoryError>;
}

/// A verification accepted from an IDE, handed to the runner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationJob {
    pub user_id: Option<String>,
    pub app_id: String,
    pub deployment_id: String,
    pub push_id: String,
    pub tests: Map<String, Value>,
}

#[async_trait]
pub trait VerificationRunner: Send + Sync {
    /// Enqueue a verification. An error is reported back to the IDE.
    async fn run(&self, job: VerificationJob) -> anyhow::Result<()>;
}

/// The three collaborators the manager is built with.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn DeploymentVerifier>,
    pub pushes: Arc<dyn PushRepository>,
    pub runner: Arc<dyn VerificationRunner>,
}

impl Collaborators {
    /// In-process implementations for standalone deployments.
    pub fn standalone() -> Self {
        Self {
            verifier: Arc::new(AlwaysValidVerifier),
            pushes: Arc::new(InMemoryPushRepository::new()),
            runner: Arc::new(QueuedVerificationRunner::new()),
        }
    }
}
