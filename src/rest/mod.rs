use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{sync::Mutex, time::sleep};
use tracing::instrument;

use crate::{
    cache::Cache,
    config::RestConfig,
    record::{origin_tag, DnsRecord, Removal},
    Error,
};

mod client;

pub(crate) use client::redact;
use client::RestClient;

const ENTRIES_CACHE_KEY: &str = "host_overrides";

/// A host-override row as the appliance reports it, keyed by its UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostOverride {
    pub(crate) uuid: String,
    pub(crate) ip: String,
    pub(crate) domain: String,
    pub(crate) description: String,
}

/// Hostname to rows, the shape every lookup and mutation works against.
pub(crate) type OverrideMap = HashMap<String, Vec<HostOverride>>;

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    rows: Vec<OverrideRow>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OverrideRow {
    uuid: String,
    hostname: String,
    domain: String,
    server: String,
    description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MutationResponse {
    result: Option<String>,
    validations: Option<Value>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceStatus {
    running: Option<bool>,
    start_time: Option<f64>,
}

struct ReloadState {
    updates_since_restart: u32,
    last_restart: Instant,
}

/// Host-override backend against the appliance REST API.
///
/// Lookups go through a TTL cache that every successful mutation
/// invalidates. Reloads follow the restart-threshold discipline: after
/// enough updates, or once the resolver has been up longer than
/// `restart_interval`, a full restart replaces the cheaper reconfigure.
pub(crate) struct RestBackend {
    client: RestClient,
    host_name: String,
    cache: Cache<OverrideMap>,
    restart_threshold: u32,
    restart_interval: Duration,
    verification_delay: Duration,
    reload_state: Mutex<ReloadState>,
    batch_lock: Mutex<()>,
}

impl RestBackend {
    pub(crate) fn new(config: &RestConfig, host_name: impl Into<String>) -> Result<Self, Error> {
        Ok(Self {
            client: RestClient::new(config)?,
            host_name: host_name.into(),
            cache: Cache::new(config.cache_ttl),
            restart_threshold: config.restart_threshold,
            restart_interval: config.restart_interval,
            verification_delay: config.verification_delay,
            reload_state: Mutex::new(ReloadState {
                updates_since_restart: 0,
                last_restart: Instant::now(),
            }),
            batch_lock: Mutex::new(()),
        })
    }

    fn origin_tag(&self) -> String {
        origin_tag(&self.host_name)
    }

    /// One-shot connection probe used at startup.
    pub(crate) async fn test_connection(&self) -> Result<(), Error> {
        self.client
            .get::<Value>("core/firmware/status")
            .await
            .map(|_| ())
    }

    /// Logs a summary of the overrides currently on the appliance.
    pub(crate) async fn startup_diagnostics(&self) {
        match self.list_all(true).await {
            Ok(entries) => {
                let rows: usize = entries.values().map(Vec::len).sum();
                let mut domains: Vec<&str> = entries
                    .values()
                    .flatten()
                    .map(|row| row.domain.as_str())
                    .collect();
                domains.sort_unstable();
                domains.dedup();

                tracing::info!(
                    hostnames = entries.len(),
                    rows,
                    domains = domains.join(", "),
                    "Existing appliance host overrides"
                );
            }
            Err(e) => tracing::warn!(error = %e, "Could not list appliance host overrides"),
        }
    }

    pub(crate) async fn list_all(&self, force_refresh: bool) -> Result<OverrideMap, Error> {
        if !force_refresh {
            if let Some(entries) = self.cache.get(ENTRIES_CACHE_KEY).await {
                tracing::trace!("Using cached host overrides");
                return Ok(entries);
            }
        }

        let response: SearchResponse = self
            .client
            .get("unbound/settings/searchHostOverride")
            .await?;

        let mut entries = OverrideMap::new();
        for row in response.rows {
            let OverrideRow {
                uuid,
                hostname,
                domain,
                server,
                description,
            } = row;

            entries.entry(hostname).or_default().push(HostOverride {
                uuid,
                ip: server,
                domain,
                description,
            });
        }

        self.cache.set(ENTRIES_CACHE_KEY, entries.clone(), None).await;
        Ok(entries)
    }

    pub(crate) async fn exists(&self, hostname: &str, domain: &str, ip: &str) -> bool {
        match self.list_all(false).await {
            Ok(entries) => entry_exists(&entries, hostname, domain, ip),
            Err(e) => {
                tracing::error!(error = %e, "Failed to list host overrides");
                false
            }
        }
    }

    /// Adds a record, first deleting any rows for the same name that carry a
    /// stale address. `entries` is the batch's pre-fetched view and is kept
    /// in step so later operations in the batch see this change.
    #[instrument(level = "debug", skip(self, entries), fields(record = %record))]
    pub(crate) async fn add(&self, record: &DnsRecord, entries: &mut OverrideMap) -> bool {
        let ip = record.ip.to_string();

        if entry_exists(entries, &record.hostname, &record.domain, &ip) {
            tracing::debug!("Host override already present");
            return false;
        }

        self.clean_old_entries(record, entries).await;

        let payload = json!({
            "host": {
                "enabled": "1",
                "hostname": record.hostname,
                "domain": record.domain,
                "server": ip,
                "description": record.description(&self.host_name),
            }
        });

        let response: MutationResponse = match self
            .client
            .post("unbound/settings/addHostOverride", payload)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Host override add failed");
                return false;
            }
        };

        if response.result.as_deref() == Some("failed") {
            tracing::error!(
                validations = %response.validations.unwrap_or_default(),
                "Appliance rejected host override"
            );
            return false;
        }

        self.cache.invalidate(ENTRIES_CACHE_KEY).await;

        entries
            .entry(record.hostname.clone())
            .or_default()
            .push(HostOverride {
                uuid: String::new(),
                ip,
                domain: record.domain.clone(),
                description: record.description(&self.host_name),
            });

        tracing::info!("Host override added");
        true
    }

    async fn clean_old_entries(&self, record: &DnsRecord, entries: &mut OverrideMap) {
        let new_ip = record.ip.to_string();

        let obsolete: Vec<HostOverride> = entries
            .get(&record.hostname)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.domain == record.domain && row.ip != new_ip)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if obsolete.is_empty() {
            return;
        }

        tracing::info!(
            hostname = record.hostname,
            domain = record.domain,
            count = obsolete.len(),
            "Removing obsolete host overrides"
        );

        for row in obsolete {
            if self
                .delete_uuid(&row.uuid, &record.hostname, &row.domain, &row.ip)
                .await
            {
                remove_row(entries, &record.hostname, &row.uuid);
            }
        }
    }

    /// Deletes one row by UUID. Only timeouts get two further attempts, with
    /// 5 s and 10 s pauses; any other failure is definitive and surfaces
    /// immediately. A vanished endpoint counts as success because the row is
    /// gone either way.
    #[instrument(level = "debug", skip(self))]
    pub(crate) async fn delete_uuid(
        &self,
        uuid: &str,
        hostname: &str,
        domain: &str,
        ip: &str,
    ) -> bool {
        let endpoint = format!("unbound/settings/delHostOverride/{uuid}");

        let mut attempt = 0u32;
        let success = loop {
            if attempt > 0 {
                let wait = Duration::from_secs(5u64 << (attempt - 1));
                tracing::info!(
                    attempt,
                    wait_s = wait.as_secs(),
                    "Retrying host override delete after timeout"
                );
                sleep(wait).await;
            }

            match self.client.post::<MutationResponse>(&endpoint, json!({})).await {
                Ok(response) => {
                    if response.error_message.as_deref() == Some("Endpoint not found") {
                        tracing::warn!("Delete endpoint not found, row already gone");
                        break true;
                    }

                    if response.result.as_deref() == Some("deleted") {
                        tracing::info!("Host override deleted");
                        break true;
                    }

                    tracing::error!(result = ?response.result, "Host override delete failed");
                    break false;
                }
                Err(Error::TimeoutError { message }) => {
                    tracing::warn!(error = %message, "Host override delete timed out");
                    if attempt >= 2 {
                        break false;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    if message.contains("Endpoint not found") {
                        tracing::warn!("Delete endpoint not found, row already gone");
                        break true;
                    }

                    tracing::error!(error = %redact(&message), "Host override delete failed");
                    break false;
                }
            }
        };

        if success {
            self.cache.invalidate(ENTRIES_CACHE_KEY).await;

            if !self.verification_delay.is_zero() {
                return self.verify_deleted(uuid, hostname, domain).await;
            }
        }

        success
    }

    async fn verify_deleted(&self, uuid: &str, hostname: &str, domain: &str) -> bool {
        sleep(self.verification_delay).await;

        match self.list_all(true).await {
            Ok(entries) => {
                let still_present = entries
                    .get(hostname)
                    .map(|rows| rows.iter().any(|row| row.uuid == uuid))
                    .unwrap_or(false);

                if still_present {
                    tracing::warn!(
                        hostname,
                        domain,
                        uuid,
                        "Delete reported success but the row is still present"
                    );
                }

                !still_present
            }
            Err(e) => {
                // The delete itself succeeded; verification is best-effort.
                tracing::warn!(error = %e, "Could not verify host override removal");
                true
            }
        }
    }

    pub(crate) async fn reconfigure(&self) -> bool {
        match self
            .client
            .post::<Value>("unbound/service/reconfigure", json!({}))
            .await
        {
            Ok(_) => {
                tracing::info!("Resolver reconfigured");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Resolver reconfigure failed");
                false
            }
        }
    }

    pub(crate) async fn restart(&self) -> bool {
        let mut state = self.reload_state.lock().await;
        self.restart_locked(&mut state).await
    }

    async fn restart_locked(&self, state: &mut ReloadState) -> bool {
        match self
            .client
            .post::<Value>("unbound/service/restart", json!({}))
            .await
        {
            Ok(_) => {
                tracing::info!("Resolver restarted");
                state.updates_since_restart = 0;
                state.last_restart = Instant::now();
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Resolver restart failed");
                false
            }
        }
    }

    /// Applies pending changes to the resolver. Issued once per batch; a
    /// reconfigure that fails or times out escalates to a restart.
    pub(crate) async fn reload(&self) -> bool {
        let mut state = self.reload_state.lock().await;
        state.updates_since_restart += 1;

        let restart = should_restart(
            state.updates_since_restart,
            self.restart_threshold,
            self.service_uptime().await,
            state.last_restart.elapsed(),
            self.restart_interval,
        );

        if restart {
            tracing::info!(
                updates = state.updates_since_restart,
                "Restarting resolver instead of reconfiguring"
            );
            return self.restart_locked(&mut state).await;
        }

        if self.reconfigure().await {
            true
        } else {
            tracing::warn!("Falling back to resolver restart");
            self.restart_locked(&mut state).await
        }
    }

    async fn service_uptime(&self) -> Option<Duration> {
        let status: ServiceStatus = self.client.get("unbound/service/status").await.ok()?;

        if !status.running.unwrap_or(false) {
            return None;
        }

        let start_time = status.start_time?;
        let uptime = Utc::now().timestamp() as f64 - start_time;
        if uptime > 0.0 {
            Some(Duration::from_secs_f64(uptime))
        } else {
            None
        }
    }

    /// The critical-record batch path: removals then additions against one
    /// freshly fetched view, deduplicated, with a single reload at the end.
    pub(crate) async fn apply_batch(&self, additions: &[DnsRecord], removals: &[Removal]) -> bool {
        if additions.is_empty() && removals.is_empty() {
            return false;
        }

        let _guard = self.batch_lock.lock().await;

        let mut entries = match self.list_all(true).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list host overrides, assuming none");
                OverrideMap::new()
            }
        };

        let mut changed = false;

        for removal in removals {
            match removal {
                Removal::Container { hostname } => {
                    if self.remove_container(hostname, &mut entries).await {
                        changed = true;
                    }
                }
                Removal::Record {
                    hostname,
                    domain,
                    ip,
                } => {
                    // With a known address only that row goes; otherwise every
                    // agent-owned row under the (hostname, domain) pair does.
                    let tag = self.origin_tag();
                    let ip = ip.map(|ip| ip.to_string());
                    let rows: Vec<HostOverride> = entries
                        .get(hostname)
                        .map(|rows| {
                            rows.iter()
                                .filter(|row| {
                                    row.domain == *domain
                                        && match &ip {
                                            Some(ip) => row.ip == *ip,
                                            None => row.description.contains(&tag),
                                        }
                                })
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();

                    for row in rows {
                        if self.delete_uuid(&row.uuid, hostname, domain, &row.ip).await {
                            changed = true;
                            remove_row(&mut entries, hostname, &row.uuid);
                        }
                    }
                }
            }
        }

        for record in additions {
            if self.add(record, &mut entries).await {
                changed = true;
            }
        }

        if changed {
            self.reload().await;
        } else {
            tracing::debug!("No appliance changes committed, skipping reload");
        }

        changed
    }

    /// Deletes every agent-owned row for a hostname. Hand-authored rows are
    /// recognizable by their descriptions and never touched.
    async fn remove_container(&self, hostname: &str, entries: &mut OverrideMap) -> bool {
        let tag = self.origin_tag();
        let rows: Vec<HostOverride> = entries
            .get(hostname)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.description.contains(&tag))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if rows.is_empty() {
            tracing::debug!(hostname, "No agent-owned host overrides to remove");
            return false;
        }

        let mut changed = false;
        for row in rows {
            if self
                .delete_uuid(&row.uuid, hostname, &row.domain, &row.ip)
                .await
            {
                changed = true;
                remove_row(entries, hostname, &row.uuid);
            }
        }

        changed
    }

    /// Periodic duplicate sweep: prunes repeated (hostname, domain) rows,
    /// keeping the first row holding the canonical address. Returns how many
    /// rows were deleted.
    pub(crate) async fn cleanup(&self, batch_size: usize, max_hostnames: usize) -> usize {
        let _guard = self.batch_lock.lock().await;

        tracing::info!(batch_size, max_hostnames, "Starting host override cleanup");

        let entries = match self.list_all(true).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list host overrides for cleanup");
                return 0;
            }
        };

        let plan = plan_duplicate_removals(&entries, &self.origin_tag(), max_hostnames);
        if plan.is_empty() {
            tracing::info!("No duplicate host overrides found");
            self.cache.cleanup().await;
            return 0;
        }

        tracing::info!(duplicates = plan.len(), "Removing duplicate host overrides");

        let mut total = 0;
        let batch_size = batch_size.max(1);
        for batch in plan.chunks(batch_size) {
            let mut removed = 0;
            for duplicate in batch {
                tracing::info!(
                    hostname = duplicate.hostname,
                    domain = duplicate.domain,
                    ip = duplicate.ip,
                    "Removing duplicate host override"
                );

                if self
                    .delete_uuid(
                        &duplicate.uuid,
                        &duplicate.hostname,
                        &duplicate.domain,
                        &duplicate.ip,
                    )
                    .await
                {
                    removed += 1;
                }
            }

            total += removed;
            if removed > 0 {
                self.reload().await;
            }
        }

        self.cache.cleanup().await;

        tracing::info!(removed = total, "Host override cleanup complete");
        total
    }
}

fn entry_exists(entries: &OverrideMap, hostname: &str, domain: &str, ip: &str) -> bool {
    entries
        .get(hostname)
        .map(|rows| rows.iter().any(|row| row.domain == domain && row.ip == ip))
        .unwrap_or(false)
}

fn remove_row(entries: &mut OverrideMap, hostname: &str, uuid: &str) {
    if let Some(rows) = entries.get_mut(hostname) {
        rows.retain(|row| row.uuid != uuid);
        if rows.is_empty() {
            entries.remove(hostname);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DuplicateRemoval {
    uuid: String,
    hostname: String,
    domain: String,
    ip: String,
}

/// Decides which duplicate rows to delete. For each (hostname, domain) with
/// more than one row, the first row holding the canonical address (the
/// address of the first row seen) survives; the rest are deleted if and only
/// if they carry the agent's origin tag. Groups with the most duplicates are
/// processed first, capped at `max_hostnames` groups per run.
fn plan_duplicate_removals(
    entries: &OverrideMap,
    origin_tag: &str,
    max_hostnames: usize,
) -> Vec<DuplicateRemoval> {
    let mut groups: Vec<(&String, &str, Vec<&HostOverride>)> = Vec::new();

    for (hostname, rows) in entries {
        let mut by_domain: Vec<(&str, Vec<&HostOverride>)> = Vec::new();
        for row in rows {
            match by_domain.iter_mut().find(|(domain, _)| *domain == row.domain) {
                Some((_, group)) => group.push(row),
                None => by_domain.push((row.domain.as_str(), vec![row])),
            }
        }

        for (domain, group) in by_domain {
            if group.len() > 1 {
                groups.push((hostname, domain, group));
            }
        }
    }

    groups.sort_by(|(h1, d1, g1), (h2, d2, g2)| {
        g2.len()
            .cmp(&g1.len())
            .then_with(|| h1.cmp(h2))
            .then_with(|| d1.cmp(d2))
    });

    let mut plan = Vec::new();
    for (hostname, domain, group) in groups.into_iter().take(max_hostnames) {
        let canonical_ip = &group[0].ip;
        let mut kept = false;

        for row in group {
            if !kept && row.ip == *canonical_ip {
                kept = true;
                continue;
            }

            if !row.description.contains(origin_tag) {
                tracing::debug!(
                    hostname = hostname.as_str(),
                    domain,
                    "Skipping row without origin tag"
                );
                continue;
            }

            plan.push(DuplicateRemoval {
                uuid: row.uuid.clone(),
                hostname: hostname.clone(),
                domain: domain.to_owned(),
                ip: row.ip.clone(),
            });
        }
    }

    plan
}

/// Reload escalation: restart once enough updates have accumulated or the
/// resolver has been up longer than the restart interval. The locally
/// tracked elapsed time stands in when the appliance will not report uptime.
fn should_restart(
    updates: u32,
    threshold: u32,
    uptime: Option<Duration>,
    elapsed: Duration,
    interval: Duration,
) -> bool {
    if updates >= threshold {
        return true;
    }

    match uptime {
        Some(uptime) => uptime > interval,
        None => elapsed > interval,
    }
}
