//! Configuration types.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::federation::RetryPolicy;

/// Runtime configuration of one party instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// This party's id.
    pub party_id: String,
    /// Identifies this process among instances serving the same party.
    pub instance_id: String,
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    /// `party_id` → base URL of every peer (may include this party).
    pub peers: HashMap<String, String>,
    pub schedule_interval: Duration,
    pub detect_interval: Duration,
    /// Lease of a schedule lock before the detector may clear it.
    pub lock_lease: Duration,
    /// Jobs scheduled in parallel per tick.
    pub max_concurrent_jobs: usize,
    /// Core pool of each resource-accounting engine.
    pub total_cores: u32,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Root directory of worker outputs.
    pub output_dir: PathBuf,
    /// Shell command the process engine runs per task.
    pub task_command: String,
}

impl Config {
    /// Defaults for a party, suitable for tests and local runs.
    pub fn for_party(party_id: impl Into<String>) -> Self {
        let party_id = party_id.into();
        Self {
            instance_id: format!("{party_id}-0"),
            party_id,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9380)),
            db_path: PathBuf::from("./data/fedflow.db"),
            peers: HashMap::new(),
            schedule_interval: Duration::from_secs(2),
            detect_interval: Duration::from_secs(5),
            lock_lease: Duration::from_secs(300),
            max_concurrent_jobs: 8,
            total_cores: 16,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            output_dir: PathBuf::from("./data/outputs"),
            task_command: "true".to_string(),
        }
    }

    /// Build config from `FEDFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let party_id = lookup("FEDFLOW_PARTY_ID")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("FEDFLOW_PARTY_ID".to_string()))?;
        let mut config = Self::for_party(party_id.trim());

        if let Some(instance_id) = lookup("FEDFLOW_INSTANCE_ID") {
            config.instance_id = instance_id;
        }
        if let Some(addr) = lookup("FEDFLOW_BIND_ADDR") {
            config.bind_addr = parse("FEDFLOW_BIND_ADDR", &addr)?;
        }
        if let Some(path) = lookup("FEDFLOW_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(peers) = lookup("FEDFLOW_PEERS") {
            config.peers = parse_peers(&peers)?;
        }
        if let Some(v) = lookup("FEDFLOW_SCHEDULE_INTERVAL_SECS") {
            config.schedule_interval = Duration::from_secs(parse("FEDFLOW_SCHEDULE_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("FEDFLOW_DETECT_INTERVAL_SECS") {
            config.detect_interval = Duration::from_secs(parse("FEDFLOW_DETECT_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("FEDFLOW_LOCK_LEASE_SECS") {
            config.lock_lease = Duration::from_secs(parse("FEDFLOW_LOCK_LEASE_SECS", &v)?);
        }
        if let Some(v) = lookup("FEDFLOW_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse("FEDFLOW_MAX_CONCURRENT_JOBS", &v)?;
        }
        if let Some(v) = lookup("FEDFLOW_TOTAL_CORES") {
            config.total_cores = parse("FEDFLOW_TOTAL_CORES", &v)?;
        }
        if let Some(v) = lookup("FEDFLOW_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse("FEDFLOW_REQUEST_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("FEDFLOW_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(parse("FEDFLOW_RETRY_BASE_MS", &v)?);
        }
        if let Some(v) = lookup("FEDFLOW_RETRY_MAX_MS") {
            config.retry.max_delay = Duration::from_millis(parse("FEDFLOW_RETRY_MAX_MS", &v)?);
        }
        if let Some(dir) = lookup("FEDFLOW_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(command) = lookup("FEDFLOW_TASK_COMMAND") {
            config.task_command = command;
        }

        if config.max_concurrent_jobs == 0 {
            return Err(invalid("FEDFLOW_MAX_CONCURRENT_JOBS", "must be at least 1"));
        }
        if config.schedule_interval.is_zero() || config.detect_interval.is_zero() {
            return Err(invalid("FEDFLOW_*_INTERVAL_SECS", "must be at least 1"));
        }
        // A pass may wait on one federated call for this long; a shorter
        // lease lets a second pass in while the first is still running.
        let slowest_call = config.retry.worst_case(config.request_timeout);
        if config.lock_lease <= slowest_call {
            return Err(invalid(
                "FEDFLOW_LOCK_LEASE_SECS",
                format!(
                    "{}s does not outlast one federated call ({}ms with retries)",
                    config.lock_lease.as_secs(),
                    slowest_call.as_millis()
                ),
            ));
        }
        Ok(config)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, format!("'{raw}': {e}")))
}

/// Parse `party=url,party=url`.
fn parse_peers(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (party, url) = entry
                .split_once('=')
                .ok_or_else(|| invalid("FEDFLOW_PEERS", format!("expected party=url, got '{entry}'")))?;
            let url = url.trim();
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(invalid("FEDFLOW_PEERS", format!("'{url}' is not an http(s) URL")));
            }
            Ok((party.trim().to_string(), url.to_string()))
        })
        .collect()
}
