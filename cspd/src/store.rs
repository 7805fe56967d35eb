//! Worker ownership of live connections.
//!
//! The store maps (role, key) to the worker currently serving that
//! connection and is the sole arbiter of ownership across processes.
//! Both backends share the same contract:
//!
//! - `register` never overwrites a live claim, including this worker's own.
//! - `deregister` is compare-and-delete: only the owning worker removes an
//!   entry; a mismatched caller is logged and the entry left in place.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use csp_common::{ConnectionKey, ConnectionRole, WorkerId};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{RedisSettings, StoreBackend};

pub const SIDECAR_PREFIX: &str = "ws_code_sync_proxy:sidecar:";
pub const IDE_PREFIX: &str = "ws_code_sync_proxy:ide:";

/// Deletes KEYS[1] only while it still holds ARGV[1]; returns the holder seen ("" if none).
const COMPARE_AND_DELETE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return ''
end
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
end
return current
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another live claim holds the slot.
    #[error("{role} session already active (handled by worker {owner})")]
    Conflict { role: ConnectionRole, owner: WorkerId },

    #[error("connection store backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Result of a deregistration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deregistration {
    Removed,
    Absent,
    /// The slot belongs to another worker and was left untouched.
    HeldBy(WorkerId),
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Claim (role, key) for `worker_id`.
    async fn register(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        worker_id: &WorkerId,
    ) -> Result<(), StoreError>;

    /// Release the claim if `worker_id` still holds it.
    async fn deregister(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        worker_id: &WorkerId,
    ) -> Result<Deregistration, StoreError>;

    /// Current owner, if any live claim exists.
    async fn get_owner(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
    ) -> Result<Option<WorkerId>, StoreError>;

    /// Short backend name for health reporting.
    fn backend_name(&self) -> &'static str;
}

/// Build the store selected by configuration.
pub async fn connect_store(
    backend: &StoreBackend,
    ttl: Duration,
) -> Result<std::sync::Arc<dyn ConnectionStore>, StoreError> {
    match backend {
        StoreBackend::Local => {
            info!("Using in-memory connection store (single worker)");
            Ok(std::sync::Arc::new(LocalConnectionStore::new()))
        }
        StoreBackend::Redis(settings) => {
            let store = RedisConnectionStore::connect(settings, ttl).await?;
            Ok(std::sync::Arc::new(store))
        }
    }
}

/// Distributed store key: role prefix + `org:user:app:deployment`.
pub fn store_key(role: ConnectionRole, key: &ConnectionKey) -> String {
    let prefix = match role {
        ConnectionRole::Sidecar => SIDECAR_PREFIX,
        ConnectionRole::Ide => IDE_PREFIX,
    };
    format!("{}{}", prefix, key.storage_suffix())
}

/// In-memory store for single-process deployments and tests.
#[derive(Default)]
pub struct LocalConnectionStore {
    owners: RwLock<HashMap<(ConnectionRole, ConnectionKey), WorkerId>>,
}

impl LocalConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for LocalConnectionStore {
    async fn register(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        worker_id: &WorkerId,
    ) -> Result<(), StoreError> {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(owner) = owners.get(&(role, key.clone())) {
            return Err(StoreError::Conflict {
                role,
                owner: owner.clone(),
            });
        }
        owners.insert((role, key.clone()), worker_id.clone());
        Ok(())
    }

    async fn deregister(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        worker_id: &WorkerId,
    ) -> Result<Deregistration, StoreError> {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        let slot = (role, key.clone());
        match owners.get(&slot) {
            None => Ok(Deregistration::Absent),
            Some(owner) if owner == worker_id => {
                owners.remove(&slot);
                Ok(Deregistration::Removed)
            }
            Some(owner) => {
                warn!(
                    "Worker {} tried to remove local {} connection for {}, but it was held by {}",
                    worker_id, role, key, owner
                );
                Ok(Deregistration::HeldBy(owner.clone()))
            }
        }
    }

    async fn get_owner(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
    ) -> Result<Option<WorkerId>, StoreError> {
        let owners = self.owners.read().unwrap_or_else(PoisonError::into_inner);
        Ok(owners.get(&(role, key.clone())).cloned())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

/// Redis-backed store shared by every worker.
///
/// Entries expire after the configured TTL so a crashed worker's claim heals
/// without explicit cleanup.
pub struct RedisConnectionStore {
    connection: redis::aio::ConnectionManager,
    ttl_secs: u64,
    compare_and_delete: redis::Script,
}

impl RedisConnectionStore {
    pub async fn connect(settings: &RedisSettings, ttl: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(settings.connection_info()?)?;
        let store = Self::from_client(client, ttl).await?;
        info!(
            "Redis connection store initialized with Redis host {}:{}, db {}",
            settings.host, settings.port, settings.db
        );
        Ok(store)
    }

    async fn from_client(client: redis::Client, ttl: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            connection: redis::aio::ConnectionManager::new(client).await?,
            ttl_secs: ttl.as_secs().max(1),
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }
}

/// `SET key worker NX EX ttl`: succeeds only when nobody holds the key.
fn claim_command(redis_key: &str, worker_id: &WorkerId, ttl_secs: u64) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(redis_key)
        .arg(worker_id.as_str())
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs);
    cmd
}

#[async_trait]
impl ConnectionStore for RedisConnectionStore {
    async fn register(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        worker_id: &WorkerId,
    ) -> Result<(), StoreError> {
        let redis_key = store_key(role, key);
        let mut conn = self.connection.clone();
        let reply: Option<String> = claim_command(&redis_key, worker_id, self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        if reply.is_some() {
            return Ok(());
        }

        let holder: Option<String> = redis::cmd("GET")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;
        Err(StoreError::Conflict {
            role,
            // The claim may have expired between SET and GET; report it anyway.
            owner: WorkerId::new(holder.unwrap_or_else(|| "unknown".to_string())),
        })
    }

    async fn deregister(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
        worker_id: &WorkerId,
    ) -> Result<Deregistration, StoreError> {
        let redis_key = store_key(role, key);
        let mut conn = self.connection.clone();
        let holder: String = self
            .compare_and_delete
            .key(&redis_key)
            .arg(worker_id.as_str())
            .invoke_async(&mut conn)
            .await?;

        if holder.is_empty() {
            Ok(Deregistration::Absent)
        } else if holder == worker_id.as_str() {
            info!("Connection {} deregistered from Redis by worker {}", redis_key, worker_id);
            Ok(Deregistration::Removed)
        } else {
            warn!(
                "Worker {} tried to remove {} from Redis, but it was held by {}",
                worker_id, redis_key, holder
            );
            Ok(Deregistration::HeldBy(WorkerId::new(holder)))
        }
    }

    async fn get_owner(
        &self,
        role: ConnectionRole,
        key: &ConnectionKey,
    ) -> Result<Option<WorkerId>, StoreError> {
        let mut conn = self.connection.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(store_key(role, key))
            .query_async(&mut conn)
            .await?;
        Ok(holder.map(WorkerId::new))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
