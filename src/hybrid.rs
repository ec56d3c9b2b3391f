use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    record::{DnsRecord, Removal},
    replication::ReplicationClient,
    rest::RestBackend,
};

/// Containers whose records must also reach the appliance so they stay
/// resolvable when a host's local resolver is down.
const CRITICAL_PREFIXES: [&str; 4] = ["caddy-public", "smtp-proxy", "traefik", "nginx-proxy"];

pub(crate) fn is_critical(hostname: &str) -> bool {
    CRITICAL_PREFIXES
        .iter()
        .any(|prefix| hostname.starts_with(prefix))
}

/// A backend that commits records on this host. Mutations report whether
/// they changed anything; `reload` is issued at most once per batch.
#[async_trait]
pub(crate) trait LocalBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply_add(&self, record: &DnsRecord) -> bool;

    async fn apply_remove(&self, removal: &Removal) -> bool;

    async fn reload(&self) -> bool;
}

/// Routes record batches to the configured backends.
///
/// Local backends receive every record; the appliance receives critical
/// records only, unless it is the sole backend, in which case the full batch
/// falls through to it. A mutex per backend keeps one
/// remove-add-reload sequence in flight at a time.
pub(crate) struct Hybrid {
    locals: Vec<Mutex<Box<dyn LocalBackend>>>,
    rest: Option<Arc<RestBackend>>,
    replication: Option<ReplicationClient>,
}

impl Hybrid {
    pub(crate) fn new(
        locals: Vec<Box<dyn LocalBackend>>,
        rest: Option<Arc<RestBackend>>,
        replication: Option<ReplicationClient>,
    ) -> Self {
        Self {
            locals: locals.into_iter().map(Mutex::new).collect(),
            rest,
            replication,
        }
    }

    pub(crate) fn has_local(&self) -> bool {
        !self.locals.is_empty()
    }

    /// Applies one batch: removals before additions on every local backend,
    /// one reload per backend that committed anything, then replication,
    /// then the appliance pass. Returns whether any backend committed.
    pub(crate) async fn apply_batch(&self, additions: &[DnsRecord], removals: &[Removal]) -> bool {
        if additions.is_empty() && removals.is_empty() {
            tracing::debug!("Empty batch, nothing to apply");
            return false;
        }

        tracing::info!(
            additions = additions.len(),
            removals = removals.len(),
            "Applying record batch"
        );

        let mut committed = false;

        for backend in &self.locals {
            let backend = backend.lock().await;
            let mut backend_committed = false;

            for removal in removals {
                if backend.apply_remove(removal).await {
                    backend_committed = true;
                }
            }

            for record in additions {
                if backend.apply_add(record).await {
                    backend_committed = true;
                }
            }

            if backend_committed {
                committed = true;
                if !backend.reload().await {
                    tracing::warn!(backend = backend.name(), "Backend reload failed");
                }
            } else {
                tracing::debug!(backend = backend.name(), "No changes committed, skipping reload");
            }
        }

        // Peers replicate only what this host has already committed, so they
        // may lag but never lead.
        if let Some(replication) = &self.replication {
            replication.fan_out(additions, removals).await;
        }

        if let Some(rest) = &self.rest {
            let (rest_additions, rest_removals) = if self.locals.is_empty() {
                (additions.to_vec(), removals.to_vec())
            } else {
                critical_subset(additions, removals)
            };

            if rest.apply_batch(&rest_additions, &rest_removals).await {
                committed = true;
            }
        }

        committed
    }

    /// Duplicate sweep over the appliance. A no-op on hosts without the REST
    /// backend.
    pub(crate) async fn cleanup(&self, batch_size: usize, max_hostnames: usize) -> usize {
        match &self.rest {
            Some(rest) => rest.cleanup(batch_size, max_hostnames).await,
            None => {
                tracing::debug!("No appliance backend, skipping cleanup");
                0
            }
        }
    }
}

fn critical_subset(
    additions: &[DnsRecord],
    removals: &[Removal],
) -> (Vec<DnsRecord>, Vec<Removal>) {
    (
        additions
            .iter()
            .filter(|record| is_critical(&record.hostname))
            .cloned()
            .collect(),
        removals
            .iter()
            .filter(|removal| is_critical(removal.hostname()))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{MockBackend, MockOp};

    fn record(hostname: &str) -> DnsRecord {
        DnsRecord::new(hostname, "docker.local", "10.0.0.2".parse().unwrap(), None)
    }

    fn removal(hostname: &str) -> Removal {
        Removal::Container {
            hostname: hostname.to_owned(),
        }
    }

    #[test]
    fn critical_classification() {
        assert!(is_critical("traefik"));
        assert!(is_critical("traefik-public"));
        assert!(is_critical("caddy-public-2"));
        assert!(is_critical("nginx-proxy"));
        assert!(!is_critical("web"));
        assert!(!is_critical("caddy"));
        assert!(!is_critical("my-traefik"));
    }

    #[test]
    fn critical_subset_filters_both_sides() {
        let additions = [record("traefik"), record("web")];
        let removals = [removal("smtp-proxy"), removal("db")];

        let (critical_additions, critical_removals) = critical_subset(&additions, &removals);

        assert_eq!(critical_additions.len(), 1);
        assert_eq!(critical_additions[0].hostname, "traefik");
        assert_eq!(critical_removals.len(), 1);
        assert_eq!(critical_removals[0].hostname(), "smtp-proxy");
    }

    #[tokio::test]
    async fn removals_precede_additions_with_one_reload() {
        let (backend, ops) = MockBackend::new(true);
        let hybrid = Hybrid::new(vec![Box::new(backend)], None, None);

        let committed = hybrid
            .apply_batch(
                &[record("web"), record("db")],
                &[removal("old"), removal("stale")],
            )
            .await;

        assert!(committed);
        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                MockOp::Remove("old".to_owned()),
                MockOp::Remove("stale".to_owned()),
                MockOp::Add("web.docker.local".to_owned()),
                MockOp::Add("db.docker.local".to_owned()),
                MockOp::Reload,
            ]
        );
    }

    #[tokio::test]
    async fn uncommitted_batch_skips_reload() {
        let (backend, ops) = MockBackend::new(false);
        let hybrid = Hybrid::new(vec![Box::new(backend)], None, None);

        let committed = hybrid.apply_batch(&[record("web")], &[]).await;

        assert!(!committed);
        assert_eq!(
            *ops.lock().unwrap(),
            vec![MockOp::Add("web.docker.local".to_owned())]
        );
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let (backend, ops) = MockBackend::new(true);
        let hybrid = Hybrid::new(vec![Box::new(backend)], None, None);

        assert!(!hybrid.apply_batch(&[], &[]).await);
        assert!(ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_backend_batch_end_to_end() {
        use tempfile::TempDir;

        use crate::{
            config::{FileBackendConfig, ReloadAction},
            zonefile::ZoneFileBackend,
        };

        let temp = TempDir::new().unwrap();
        let records_file = temp.path().join("docker-records.conf");
        let sentinel = temp.path().join("reload-signal");

        let backend = ZoneFileBackend::new(&FileBackendConfig {
            records_file: records_file.clone(),
            reload: ReloadAction::Sentinel(sentinel.clone()),
        });
        backend.ensure_file().await.unwrap();

        let hybrid = Hybrid::new(vec![Box::new(backend)], None, None);

        // A container on two networks publishes the base domain once per
        // address, so the last address wins there.
        let additions = vec![
            DnsRecord::new(
                "traefik",
                "docker.local",
                "10.0.0.5".parse().unwrap(),
                Some("bridge".to_owned()),
            ),
            DnsRecord::new(
                "traefik",
                "docker.local",
                "172.20.0.5".parse().unwrap(),
                Some("frontend_net".to_owned()),
            ),
            DnsRecord::new(
                "traefik",
                "frontend.docker.local",
                "172.20.0.5".parse().unwrap(),
                Some("frontend_net".to_owned()),
            ),
        ];

        assert!(hybrid.apply_batch(&additions, &[]).await);

        let contents = tokio::fs::read_to_string(&records_file).await.unwrap();
        let lines: Vec<&str> = contents
            .lines()
            .filter(|line| line.starts_with("local-data:"))
            .collect();
        assert_eq!(
            lines,
            vec![
                r#"local-data: "traefik.docker.local. IN A 172.20.0.5""#,
                r#"local-data: "traefik.frontend.docker.local. IN A 172.20.0.5""#,
            ]
        );
        assert!(tokio::fs::try_exists(&sentinel).await.unwrap());

        // The container stops and everything it published is retracted.
        assert!(
            hybrid
                .apply_batch(
                    &[],
                    &[Removal::Container {
                        hostname: "traefik".to_owned()
                    }]
                )
                .await
        );

        let contents = tokio::fs::read_to_string(&records_file).await.unwrap();
        assert!(!contents.contains("traefik"));

        // Re-applying the retraction commits nothing.
        assert!(
            !hybrid
                .apply_batch(
                    &[],
                    &[Removal::Container {
                        hostname: "traefik".to_owned()
                    }]
                )
                .await
        );
    }

    #[tokio::test]
    async fn each_backend_reloads_independently() {
        let (committing, committing_ops) = MockBackend::new(true);
        let (inert, inert_ops) = MockBackend::new(false);
        let hybrid = Hybrid::new(vec![Box::new(committing), Box::new(inert)], None, None);

        assert!(hybrid.apply_batch(&[record("web")], &[]).await);

        let reloads = |ops: &std::sync::Mutex<Vec<MockOp>>| {
            ops.lock()
                .unwrap()
                .iter()
                .filter(|op| **op == MockOp::Reload)
                .count()
        };

        assert_eq!(reloads(&committing_ops), 1);
        assert_eq!(reloads(&inert_ops), 0);
    }
}
