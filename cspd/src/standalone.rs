//! In-process collaborators used when the proxy runs on its own.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csp_common::{PushRecord, PushStatus};
use tracing::{debug, info};

use crate::collaborators::{
    DeploymentVerdict, DeploymentVerifier, PushRepository, RepositoryError, VerificationJob,
    VerificationRunner,
};

/// Accepts every deployment.
pub struct AlwaysValidVerifier;

#[async_trait]
impl DeploymentVerifier for AlwaysValidVerifier {
    async fn verify(&self, app_id: &str, deployment_id: &str) -> DeploymentVerdict {
        debug!("Standalone mode: accepting deployment {}/{}", app_id, deployment_id);
        DeploymentVerdict::valid()
    }
}

/// Push records kept in memory, with the status progression enforced.
#[derive(Default)]
pub struct InMemoryPushRepository {
    records: Mutex<HashMap<String, PushRecord>>,
}

impl InMemoryPushRepository {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)] // Inspection for tests and embedders
    pub fn get(&self, push_id: &str) -> Option<PushRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(push_id)
            .cloned()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl PushRepository for InMemoryPushRepository {
    async fn create(&self, record: PushRecord) -> Result<PushRecord, RepositoryError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.id) {
            return Err(RepositoryError::Duplicate(record.id));
        }
        if record.status.is_terminal() {
            return Err(RepositoryError::IllegalTransition {
                push_id: record.id,
                from: PushStatus::Pending,
                to: record.status,
            });
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, push_id: &str, status: PushStatus) -> Result<(), RepositoryError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(push_id)
            .ok_or_else(|| RepositoryError::UnknownPush(push_id.to_string()))?;
        if !record.status.can_transition_to(status) {
            return Err(RepositoryError::IllegalTransition {
                push_id: push_id.to_string(),
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        Ok(())
    }
}

/// A verification job accepted by [`QueuedVerificationRunner`].
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: VerificationJob,
    pub queued_at: DateTime<Utc>,
}

/// Records accepted verification jobs in memory.
#[derive(Default)]
pub struct QueuedVerificationRunner {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl QueuedVerificationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)] // Inspection for tests and embedders
    pub fn jobs(&self) -> Vec<QueuedJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl VerificationRunner for QueuedVerificationRunner {
    async fn run(&self, job: VerificationJob) -> anyhow::Result<()> {
        let queued = QueuedJob {
            job,
            queued_at: Utc::now(),
        };
        info!(
            push_id = %queued.job.push_id,
            app_id = %queued.job.app_id,
            deployment_id = %queued.job.deployment_id,
            tests = queued.job.tests.len(),
            queued_at = %queued.queued_at.to_rfc3339(),
            "Verification job queued"
        );
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(queued);
        Ok(())
    }
}
