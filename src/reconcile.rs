use std::{net::IpAddr, sync::Arc, time::Duration};

use bollard::Docker;
use futures::StreamExt;
use tokio::{
    select,
    sync::watch,
    time::{interval, sleep, MissedTickBehavior},
};

use crate::{
    config::ReconcileConfig,
    docker,
    domain::{DomainResolver, FLANNEL_NETWORK},
    hybrid::Hybrid,
    record::{DnsRecord, Removal},
    state::{ChangeSet, NetworkState, Snapshot},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Owns the reconcile loop: the single task that feeds the state tracker and
/// hands batches to the dispatcher. Container events only flag that a sync is
/// worth logging; every sync tick runs a full reconciliation regardless.
pub(crate) struct Reconciler {
    docker: Docker,
    state: NetworkState,
    resolver: DomainResolver,
    hybrid: Arc<Hybrid>,
    config: ReconcileConfig,
    changes_detected: bool,
}

impl Reconciler {
    pub(crate) fn new(
        docker: Docker,
        resolver: DomainResolver,
        hybrid: Arc<Hybrid>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            docker,
            state: NetworkState::new(config.state_cleanup_cycles),
            resolver,
            hybrid,
            config,
            changes_detected: false,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            sync_interval_s = self.config.sync_interval.as_secs(),
            cleanup_interval_s = self.config.cleanup_interval.as_secs(),
            "Reconciler starting"
        );

        self.reconcile().await;

        if self.config.cleanup_on_startup {
            tracing::info!("Performing startup cleanup");
            self.cleanup().await;
        }

        let mut sync = interval(self.config.sync_interval);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sync.tick().await;

        let mut cleanup = interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cleanup.tick().await;

        'connection: loop {
            let docker = self.docker.clone();
            let mut events = docker.events::<&str>(None);

            loop {
                select! {
                    _ = shutdown.changed() => {
                        tracing::trace!("Reconciler shutting down");
                        return;
                    }
                    event = events.next() => match event {
                        Some(Ok(ev)) => {
                            if docker::useful_event(&ev) {
                                tracing::info!(
                                    action = ev.action.as_deref().unwrap_or_default(),
                                    container = docker::event_container(&ev).unwrap_or("unknown"),
                                    "Container event"
                                );
                                self.changes_detected = true;
                            }
                        }
                        _ => {
                            if !self.reconnect(&mut shutdown).await {
                                return;
                            }
                            continue 'connection;
                        }
                    },
                    _ = sync.tick() => {
                        if self.changes_detected {
                            tracing::debug!("Container events were seen since the last sync");
                        }
                        self.reconcile().await;
                        self.changes_detected = false;
                    }
                    _ = cleanup.tick() => {
                        self.cleanup().await;
                    }
                }
            }
        }
    }

    async fn reconnect(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tracing::warn!("Docker event stream ended, reconnecting");

        loop {
            select! {
                _ = shutdown.changed() => return false,
                _ = sleep(RECONNECT_DELAY) => {}
            }

            let docker = match docker::connect() {
                Ok(docker) => docker,
                Err(e) => {
                    tracing::error!(error = %e, "Docker reconnect failed");
                    continue;
                }
            };

            match docker::handshake(&docker).await {
                Ok(()) => {
                    self.docker = docker;
                    return true;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Docker reconnect failed");
                }
            }
        }
    }

    /// One full pass: inspect, diff, dispatch. An inspection failure leaves
    /// the tracker untouched so no spurious removals can fire.
    async fn reconcile(&mut self) {
        tracing::debug!("Starting DNS synchronization");

        let snapshot = match docker::fetch_snapshot(&self.docker).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Container inspection failed, keeping previous state");
                return;
            }
        };

        if !self.state.update(snapshot) {
            tracing::debug!("No container network changes detected");
            return;
        }

        let changes = self.state.changes();
        tracing::info!(
            added = changes.added_containers.len(),
            removed = changes.removed_containers.len(),
            modified = changes.network_changes.len(),
            "Container changes detected"
        );

        let (additions, removals) = plan_changes(&changes, self.state.snapshot(), &self.resolver);
        let committed = self.hybrid.apply_batch(&additions, &removals).await;

        let stats = self.state.statistics();
        tracing::info!(
            committed,
            containers = stats.container_count,
            networks = stats.total_networks,
            multi_network = stats.multi_network_containers,
            gone = stats.gone_containers,
            "DNS synchronization complete"
        );
    }

    async fn cleanup(&self) {
        self.hybrid
            .cleanup(
                self.config.cleanup_batch_size,
                self.config.cleanup_max_hostnames,
            )
            .await;
    }
}

fn records_for(
    resolver: &DomainResolver,
    hostname: &str,
    network: &str,
    ip: IpAddr,
) -> Vec<DnsRecord> {
    let flannel_domain = resolver.domain_for(Some(FLANNEL_NETWORK));

    resolver
        .domains_for(network, ip)
        .into_iter()
        .map(|domain| {
            let network_label = if domain == flannel_domain && network != FLANNEL_NETWORK {
                FLANNEL_NETWORK.to_owned()
            } else {
                network.to_owned()
            };

            DnsRecord::new(hostname, domain, ip, Some(network_label))
        })
        .collect()
}

/// Turns a change set into the batch handed to the dispatcher. Outputs are
/// ordered for deterministic batches.
fn plan_changes(
    changes: &ChangeSet,
    snapshot: &Snapshot,
    resolver: &DomainResolver,
) -> (Vec<DnsRecord>, Vec<Removal>) {
    let mut additions = Vec::new();
    let mut removals = Vec::new();

    let mut added: Vec<&String> = changes.added_containers.iter().collect();
    added.sort();

    for container in added {
        let Some(networks) = snapshot.get(container) else {
            continue;
        };

        let mut networks: Vec<(&String, &IpAddr)> = networks.iter().collect();
        networks.sort();

        for (network, ip) in networks {
            additions.extend(records_for(resolver, container, network, *ip));
        }
    }

    let mut removed: Vec<&String> = changes.removed_containers.iter().collect();
    removed.sort();

    for container in removed {
        removals.push(Removal::Container {
            hostname: container.clone(),
        });
    }

    let mut modified: Vec<_> = changes.network_changes.iter().collect();
    modified.sort_by_key(|(container, _)| container.as_str());

    for (container, delta) in modified {
        let mut detached: Vec<(&String, &IpAddr)> = delta.removed.iter().collect();
        detached.sort();

        for (network, ip) in detached {
            for domain in resolver.domains_for(network, *ip) {
                removals.push(Removal::Record {
                    hostname: container.clone(),
                    domain,
                    ip: Some(*ip),
                });
            }
        }

        let mut attached: Vec<(&String, &IpAddr)> = delta.added.iter().collect();
        attached.sort();

        for (network, ip) in attached {
            additions.extend(records_for(resolver, container, network, *ip));
        }
    }

    (additions, removals)
}
