//! Daemon configuration assembled from `CSP_` environment variables and
//! command-line overrides.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use csp_common::WorkerId;
use csp_common::config::{EnvError, EnvParser, Sourced};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_BIND_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000);
pub const DEFAULT_CONNECTION_TTL_SECS: u64 = 7200;
const MIN_CONNECTION_TTL_SECS: u64 = 60;
const MAX_CONNECTION_TTL_SECS: u64 = 604_800;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n{}", format_errors(.0))]
    Invalid(Vec<EnvError>),
}

fn format_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Where connection ownership is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-memory; a single worker.
    Local,
    /// Shared Redis instance; any number of workers.
    Redis(RedisSettings),
}

#[derive(Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl RedisSettings {
    pub fn connection_info(&self) -> redis::RedisResult<redis::ConnectionInfo> {
        use redis::IntoConnectionInfo;

        let mut info = format!("redis://{}:{}/{}", self.host, self.port, self.db)
            .into_connection_info()?;
        info.redis.password = self.password.clone();
        Ok(info)
    }
}

// Keeps the password out of logs.
impl fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for RedisSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Values the command line may override.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub bind: Option<SocketAddr>,
    pub worker_id: Option<String>,
    pub redis: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub worker_id: Sourced<WorkerId>,
    pub bind_addr: Sourced<SocketAddr>,
    pub store: Sourced<StoreBackend>,
    /// Parsed even when Redis is disabled so `--redis` can enable it.
    pub redis: RedisSettings,
    pub connection_ttl: Sourced<Duration>,
    pub log_level: Sourced<String>,
    pub log_json: Sourced<bool>,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_parser(&mut EnvParser::new())
    }

    /// Read every setting, failing with all problems found.
    pub fn from_parser(parser: &mut EnvParser) -> Result<Self, ConfigError> {
        let worker_id = parser
            .get_optional_string("WORKER_ID")
            .map(|id| id.map_or_else(WorkerId::generate, WorkerId::new));
        let bind_addr = parser.get_socket_addr("BIND_ADDR", DEFAULT_BIND_ADDR);

        let redis_enabled = parser.get_bool("REDIS_ENABLED", false);
        let settings = RedisSettings {
            host: parser.get_string("REDIS_HOST", "localhost").value,
            port: parser
                .get_range("REDIS_PORT", 6379u16, 1, u16::MAX, "port number")
                .value,
            db: parser
                .get_range("REDIS_DB", 0i64, 0, i64::MAX, "non-negative integer")
                .value,
            password: parser.get_optional_string("REDIS_PASSWORD").value,
        };
        let store = redis_enabled.map(|enabled| {
            if enabled {
                StoreBackend::Redis(settings.clone())
            } else {
                StoreBackend::Local
            }
        });

        let connection_ttl = parser
            .get_range(
                "CONNECTION_TTL_SECS",
                DEFAULT_CONNECTION_TTL_SECS,
                MIN_CONNECTION_TTL_SECS,
                MAX_CONNECTION_TTL_SECS,
                "seconds",
            )
            .map(Duration::from_secs);
        let log_level = parser.get_log_level("LOG_LEVEL", "info");
        let log_json = parser.get_bool("LOG_JSON", false);

        if parser.has_errors() {
            return Err(ConfigError::Invalid(parser.take_errors()));
        }

        Ok(Self {
            worker_id,
            bind_addr,
            store,
            redis: settings,
            connection_ttl,
            log_level,
            log_json,
        })
    }

    /// Command-line flags take precedence over the environment.
    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(bind) = cli.bind {
            self.bind_addr = Sourced::from_cli(bind, "--bind");
        }
        if let Some(worker_id) = &cli.worker_id {
            self.worker_id = Sourced::from_cli(WorkerId::new(worker_id.clone()), "--worker-id");
        }
        if cli.redis && self.store.value == StoreBackend::Local {
            self.store = Sourced::from_cli(StoreBackend::Redis(self.redis.clone()), "--redis");
        }
        if cli.verbose {
            self.log_level = Sourced::from_cli("debug".to_string(), "--verbose");
        }
    }

    /// Log the effective configuration and where each value came from.
    pub fn log_summary(&self) {
        info!(
            "Worker ID: {} [{}]",
            self.worker_id.value,
            self.worker_id.describe_source()
        );
        info!(
            "Listen address: {} [{}]",
            self.bind_addr.value,
            self.bind_addr.describe_source()
        );
        match &self.store.value {
            StoreBackend::Local => info!(
                "Connection store: local [{}]",
                self.store.describe_source()
            ),
            StoreBackend::Redis(settings) => info!(
                "Connection store: redis {} (ttl {}s) [{}]",
                settings,
                self.connection_ttl.value.as_secs(),
                self.store.describe_source()
            ),
        }
    }
}
