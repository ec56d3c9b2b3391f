use std::{collections::HashMap, env, fmt, path::PathBuf, time::Duration};

use figment::{providers::Env, Figment};
use serde::Deserialize;

use crate::Error;

pub(crate) const DEFAULT_BASE_DOMAIN: &str = "docker.local";

const HOST_RECORDS_FILE: &str = "/etc/unbound/docker-records.conf";
const RELOAD_SENTINEL: &str = "/etc/unbound/reload-signal";

/// Raw environment layer. Every recognized variable lands here before being
/// shaped into the immutable [`Config`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
struct EnvConfig {
    opnsense_url: Option<String>,
    opnsense_key: Option<String>,
    opnsense_secret: Option<String>,
    verify_ssl: Option<bool>,
    connect_timeout: Option<u64>,
    read_timeout: Option<u64>,
    api_retry_count: Option<u32>,
    api_backoff_factor: Option<f64>,
    min_call_interval: Option<f64>,
    dns_cache_ttl: Option<u64>,
    dns_sync_interval: Option<u64>,
    dns_cleanup_interval: Option<u64>,
    dns_cleanup_batch_size: Option<usize>,
    dns_cleanup_max_hostnames: Option<usize>,
    cleanup_on_startup: Option<bool>,
    restart_threshold: Option<u32>,
    restart_interval: Option<u64>,
    max_reconfigure_time: Option<u64>,
    verification_delay: Option<u64>,
    dns_role: Option<String>,
    host_name: Option<String>,
    local_unbound_enabled: Option<bool>,
    local_unbound_type: Option<String>,
    local_unbound_container: Option<String>,
    opnsense_fallback_enabled: Option<bool>,
    dns_replication_port: Option<u16>,
    state_cleanup_cycles: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.pad("master"),
            Role::Client => f.pad("client"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestConfig {
    pub url: String,
    pub key: String,
    pub secret: String,
    pub verify_ssl: bool,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub retry_count: u32,
    pub backoff_factor: f64,
    pub min_call_interval: Duration,
    pub cache_ttl: Duration,
    pub restart_threshold: u32,
    pub restart_interval: Duration,
    pub max_reconfigure_time: Duration,
    pub verification_delay: Duration,
}

/// How the local resolver is told to pick up a fragment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadAction {
    Command(Vec<String>),
    Sentinel(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBackendConfig {
    pub records_file: PathBuf,
    pub reload: ReloadAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    pub sync_interval: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_on_startup: bool,
    pub cleanup_batch_size: usize,
    pub cleanup_max_hostnames: usize,
    pub state_cleanup_cycles: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host_name: String,
    pub role: Role,
    pub base_domain: String,
    pub rest: Option<RestConfig>,
    pub file: Option<FileBackendConfig>,
    pub replication_port: u16,
    pub peers: HashMap<String, String>,
    pub reconcile: ReconcileConfig,
}

impl Config {
    pub fn from_env(base_domain: Option<String>) -> Result<Config, Error> {
        let raw: EnvConfig = Figment::new()
            .merge(Env::prefixed("").lowercase(false))
            .extract()?;

        Config::build(raw, env::vars(), base_domain)
    }

    fn build(
        raw: EnvConfig,
        vars: impl Iterator<Item = (String, String)>,
        base_domain: Option<String>,
    ) -> Result<Config, Error> {
        let role = match raw.dns_role.as_deref() {
            None | Some("client") => Role::Client,
            Some("master") => Role::Master,
            Some(other) => {
                return Err(Error::config(format!(
                    "DNS_ROLE must be 'master' or 'client', got '{other}'"
                )))
            }
        };

        let file = if raw.local_unbound_enabled.unwrap_or(false) {
            Some(file_backend(&raw)?)
        } else {
            None
        };

        // A host with no local resolver has only the appliance to write to,
        // so the REST backend is implied there; otherwise it participates
        // only when the fallback is switched on.
        let rest_enabled = raw.opnsense_fallback_enabled.unwrap_or(false) || file.is_none();
        let rest = if rest_enabled {
            Some(rest_backend(&raw)?)
        } else {
            None
        };

        let replication_port = raw.dns_replication_port.unwrap_or(8080);
        let peers = if role == Role::Master {
            peers_from_vars(vars, replication_port)?
        } else {
            HashMap::new()
        };

        Ok(Config {
            host_name: raw.host_name.unwrap_or_else(|| "unknown".to_owned()),
            role,
            base_domain: base_domain.unwrap_or_else(|| DEFAULT_BASE_DOMAIN.to_owned()),
            rest,
            file,
            replication_port,
            peers,
            reconcile: ReconcileConfig {
                sync_interval: Duration::from_secs(raw.dns_sync_interval.unwrap_or(60)),
                cleanup_interval: Duration::from_secs(raw.dns_cleanup_interval.unwrap_or(3600)),
                cleanup_on_startup: raw.cleanup_on_startup.unwrap_or(true),
                cleanup_batch_size: raw.dns_cleanup_batch_size.unwrap_or(50),
                cleanup_max_hostnames: raw.dns_cleanup_max_hostnames.unwrap_or(25),
                state_cleanup_cycles: raw.state_cleanup_cycles.unwrap_or(3),
            },
        })
    }
}

fn rest_backend(raw: &EnvConfig) -> Result<RestConfig, Error> {
    let required = |value: &Option<String>, name: &str| {
        value
            .as_ref()
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| Error::config(format!("{name} must be set")))
    };

    Ok(RestConfig {
        url: required(&raw.opnsense_url, "OPNSENSE_URL")?
            .trim_end_matches('/')
            .to_owned(),
        key: required(&raw.opnsense_key, "OPNSENSE_KEY")?,
        secret: required(&raw.opnsense_secret, "OPNSENSE_SECRET")?,
        verify_ssl: raw.verify_ssl.unwrap_or(true),
        connect_timeout: Duration::from_secs(raw.connect_timeout.unwrap_or(5)),
        read_timeout: Duration::from_secs(raw.read_timeout.unwrap_or(30)),
        retry_count: raw.api_retry_count.unwrap_or(3),
        backoff_factor: raw.api_backoff_factor.unwrap_or(0.3),
        min_call_interval: Duration::from_secs_f64(raw.min_call_interval.unwrap_or(1.0)),
        cache_ttl: Duration::from_secs(raw.dns_cache_ttl.unwrap_or(60)),
        restart_threshold: raw.restart_threshold.unwrap_or(100),
        restart_interval: Duration::from_secs(raw.restart_interval.unwrap_or(86400)),
        max_reconfigure_time: Duration::from_secs(raw.max_reconfigure_time.unwrap_or(120).max(120)),
        verification_delay: Duration::from_secs(raw.verification_delay.unwrap_or(0)),
    })
}

fn file_backend(raw: &EnvConfig) -> Result<FileBackendConfig, Error> {
    let reload = match raw.local_unbound_type.as_deref() {
        None | Some("host") => ReloadAction::Command(
            ["systemctl", "reload", "unbound"]
                .map(str::to_owned)
                .to_vec(),
        ),
        Some("docker") => {
            let container = raw
                .local_unbound_container
                .clone()
                .ok_or_else(|| Error::config("LOCAL_UNBOUND_CONTAINER must be set"))?;
            ReloadAction::Command(
                ["docker", "exec", container.as_str(), "unbound-control", "reload"]
                    .map(str::to_owned)
                    .to_vec(),
            )
        }
        Some("sentinel") => ReloadAction::Sentinel(PathBuf::from(RELOAD_SENTINEL)),
        Some(other) => {
            return Err(Error::config(format!(
                "LOCAL_UNBOUND_TYPE must be 'host', 'docker' or 'sentinel', got '{other}'"
            )))
        }
    };

    Ok(FileBackendConfig {
        records_file: PathBuf::from(HOST_RECORDS_FILE),
        reload,
    })
}

/// Collects replication peers from `REPLICATE_TO_<NAME>=true` switches and
/// their matching `<NAME>_IP` addresses.
fn peers_from_vars(
    vars: impl Iterator<Item = (String, String)>,
    port: u16,
) -> Result<HashMap<String, String>, Error> {
    let vars: HashMap<String, String> = vars.collect();
    let mut peers = HashMap::new();

    for (key, value) in &vars {
        let Some(name) = key.strip_prefix("REPLICATE_TO_") else {
            continue;
        };

        if value.to_lowercase() != "true" {
            continue;
        }

        let ip = vars
            .get(&format!("{name}_IP"))
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::config(format!("{name}_IP must be set to replicate to {name}")))?;

        peers.insert(name.to_lowercase(), format!("http://{ip}:{port}"));
    }

    Ok(peers)
}
