use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub storage: Storage,
    pub ledger: Ledger,
    pub shutdown: Shutdown,
    pub logging: Logging,
    pub observability: Observability,
    pub dashboard: Dashboard,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    /// "fs" for a locally mounted mirror of the bucket, "http" for the
    /// object store's HTTP gateway.
    pub backend: String,
    /// Root directory (fs) or base URL (http). `{region}` is substituted
    /// from the environment for gateways addressed per region.
    pub location: String,
    pub vendor: String,
    pub product: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Ledger {
    /// A `started` claim older than this is treated as abandoned by a dead
    /// process and may be reclaimed in idempotent mode.
    pub claim_stale_hours: i64,
}

#[derive(Debug, Deserialize)]
pub struct Shutdown {
    pub flag_path: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Logging {
    pub dir: String,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    /// 0 disables the Prometheus scrape listener.
    pub prometheus_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct Dashboard {
    pub port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Object-store credentials, environment-only. Absent credentials are fine
/// for public buckets and the fs backend.
#[derive(Debug, Clone)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

pub fn storage_credentials_from_env() -> Option<StorageCredentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
    Some(StorageCredentials {
        access_key_id,
        secret_access_key,
    })
}

pub fn storage_region_from_env() -> Option<String> {
    std::env::var("AWS_REGION").ok()
}

/// Remote ledger connection, environment-only. `None` when the host or user
/// is missing; the caller degrades the mirror instead of failing the run.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl RemoteConfig {
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("REMOTE_DB_HOST").ok()?;
        let user = std::env::var("REMOTE_DB_USER").ok()?;
        let password = std::env::var("REMOTE_DB_PASSWORD").unwrap_or_default();
        let port = std::env::var("REMOTE_DB_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6543);
        let dbname = std::env::var("REMOTE_DB_NAME").unwrap_or_else(|_| "postgres".to_string());
        Some(Self {
            host,
            port,
            user,
            password,
            dbname,
        })
    }
}
