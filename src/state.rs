use std::{
    collections::{HashMap, HashSet},
    mem,
    net::IpAddr,
};

use chrono::{DateTime, Utc};

/// Container name to network name to address, as observed in one inspection
/// pass.
pub(crate) type Snapshot = HashMap<String, HashMap<String, IpAddr>>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct NetworkDelta {
    pub(crate) added: HashMap<String, IpAddr>,
    pub(crate) removed: HashMap<String, IpAddr>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ChangeSet {
    pub(crate) added_containers: HashSet<String>,
    pub(crate) removed_containers: HashSet<String>,
    pub(crate) network_changes: HashMap<String, NetworkDelta>,
}

impl ChangeSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.added_containers.is_empty()
            && self.removed_containers.is_empty()
            && self.network_changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateStats {
    pub(crate) container_count: usize,
    pub(crate) total_networks: usize,
    pub(crate) multi_network_containers: usize,
    pub(crate) gone_containers: usize,
    pub(crate) last_change: Option<DateTime<Utc>>,
}

/// Tracks container network state between reconcile cycles.
///
/// Holds the current and the immediately preceding snapshot so a diff can be
/// computed after each update. Containers that vanish are remembered in a
/// gone table for `cleanup_cycles` cycles to absorb transient inspection
/// hiccups; the removal itself is emitted only in the cycle a container first
/// disappears.
pub(crate) struct NetworkState {
    current: Snapshot,
    previous: Snapshot,
    gone: HashMap<String, u32>,
    cleanup_cycles: u32,
    last_change: Option<DateTime<Utc>>,
}

impl NetworkState {
    pub(crate) fn new(cleanup_cycles: u32) -> Self {
        Self {
            current: Snapshot::new(),
            previous: Snapshot::new(),
            gone: HashMap::new(),
            cleanup_cycles: cleanup_cycles.max(1),
            last_change: None,
        }
    }

    /// Replaces the current snapshot, retaining the old one for diffing.
    /// Returns true when the container set or any retained container's
    /// network map differs from the previous cycle. An empty snapshot is a
    /// legitimate state (the last container stopped); failed inspections
    /// never reach this method.
    pub(crate) fn update(&mut self, new_snapshot: Snapshot) -> bool {
        self.previous = mem::replace(&mut self.current, new_snapshot);
        self.track_gone();

        let changed = self.current != self.previous;
        if changed {
            self.last_change = Some(Utc::now());
        }

        changed
    }

    fn track_gone(&mut self) {
        let mut forgotten = Vec::new();
        for (container, cycles) in self.gone.iter_mut() {
            if self.current.contains_key(container) {
                forgotten.push(container.clone());
            } else {
                *cycles += 1;
                if *cycles >= self.cleanup_cycles {
                    tracing::info!(
                        container,
                        cycles = self.cleanup_cycles,
                        "Forgetting absent container"
                    );
                    forgotten.push(container.clone());
                }
            }
        }
        for container in forgotten {
            self.gone.remove(&container);
        }

        for container in self.previous.keys() {
            if !self.current.contains_key(container) && !self.gone.contains_key(container) {
                tracing::debug!(container, "Container absent this cycle");
                self.gone.insert(container.clone(), 1);
            }
        }
    }

    /// The diff between the two most recent snapshots. Valid immediately
    /// after `update` and deterministic given the two snapshots.
    pub(crate) fn changes(&self) -> ChangeSet {
        let current: HashSet<&String> = self.current.keys().collect();
        let previous: HashSet<&String> = self.previous.keys().collect();

        let mut changes = ChangeSet {
            added_containers: current
                .difference(&previous)
                .map(|name| (*name).clone())
                .collect(),
            removed_containers: previous
                .difference(&current)
                .map(|name| (*name).clone())
                .collect(),
            network_changes: HashMap::new(),
        };

        for container in current.intersection(&previous) {
            let current_networks = &self.current[*container];
            let previous_networks = &self.previous[*container];

            if current_networks == previous_networks {
                continue;
            }

            let mut delta = NetworkDelta::default();

            for (network, ip) in current_networks {
                if previous_networks.get(network) != Some(ip) {
                    delta.added.insert(network.clone(), *ip);
                }
            }

            for (network, ip) in previous_networks {
                if current_networks.get(network) != Some(ip) {
                    delta.removed.insert(network.clone(), *ip);
                }
            }

            changes.network_changes.insert((*container).clone(), delta);
        }

        changes
    }

    pub(crate) fn snapshot(&self) -> &Snapshot {
        &self.current
    }

    pub(crate) fn statistics(&self) -> StateStats {
        let total_networks = self.current.values().map(|networks| networks.len()).sum();

        StateStats {
            container_count: self.current.len(),
            total_networks,
            multi_network_containers: self
                .current
                .values()
                .filter(|networks| networks.len() > 1)
                .count(),
            gone_containers: self.gone.len(),
            last_change: self.last_change,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn snapshot(entries: &[(&str, &[(&str, &str)])]) -> Snapshot {
        entries
            .iter()
            .map(|(name, networks)| {
                (
                    name.to_string(),
                    networks
                        .iter()
                        .map(|(net, addr)| (net.to_string(), ip(addr)))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn added_and_removed_containers() {
        let mut state = NetworkState::new(3);

        assert!(state.update(snapshot(&[("web", &[("bridge", "10.0.0.2")])])));

        let changes = state.changes();
        assert_eq!(changes.added_containers.len(), 1);
        assert!(changes.added_containers.contains("web"));
        assert!(changes.removed_containers.is_empty());
        assert!(changes.network_changes.is_empty());

        assert!(state.update(snapshot(&[("db", &[("bridge", "10.0.0.3")])])));

        let changes = state.changes();
        assert!(changes.added_containers.contains("db"));
        assert!(changes.removed_containers.contains("web"));
    }

    #[test]
    fn ip_change_yields_add_and_remove_on_same_network() {
        let mut state = NetworkState::new(3);

        state.update(snapshot(&[("db", &[("bridge", "10.0.0.3")])]));
        assert!(state.update(snapshot(&[("db", &[("bridge", "10.0.0.4")])])));

        let changes = state.changes();
        assert!(changes.added_containers.is_empty());
        assert!(changes.removed_containers.is_empty());

        // An address shift emits both sides so backends retract the stale
        // record before the replacement lands.
        let delta = &changes.network_changes["db"];
        assert_eq!(delta.added["bridge"], ip("10.0.0.4"));
        assert_eq!(delta.removed["bridge"], ip("10.0.0.3"));
    }

    #[test]
    fn detached_network_is_removed() {
        let mut state = NetworkState::new(3);

        state.update(snapshot(&[(
            "app",
            &[("bridge", "10.0.0.5"), ("frontend_net", "172.20.0.5")],
        )]));
        assert!(state.update(snapshot(&[("app", &[("bridge", "10.0.0.5")])])));

        let delta = &state.changes().network_changes["app"];
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed["frontend_net"], ip("172.20.0.5"));
    }

    #[test]
    fn unchanged_snapshot_reports_no_change() {
        let mut state = NetworkState::new(3);

        let snap = snapshot(&[("web", &[("bridge", "10.0.0.2")])]);
        state.update(snap.clone());
        assert!(!state.update(snap));
        assert!(state.changes().is_empty());
    }

    #[test]
    fn empty_updates_are_stable() {
        let mut state = NetworkState::new(3);

        assert!(!state.update(Snapshot::new()));
        assert!(!state.update(Snapshot::new()));
        assert!(state.changes().is_empty());
    }

    #[test]
    fn empty_snapshot_removes_every_container() {
        let mut state = NetworkState::new(3);

        state.update(snapshot(&[
            ("web", &[("bridge", "10.0.0.2")]),
            ("db", &[("bridge", "10.0.0.3")]),
        ]));

        // The last containers stopping is a real state, not an inspection
        // glitch; everything previously known gets a removal.
        assert!(state.update(Snapshot::new()));

        let changes = state.changes();
        assert!(changes.added_containers.is_empty());
        assert_eq!(changes.removed_containers.len(), 2);
        assert!(changes.removed_containers.contains("web"));
        assert!(changes.removed_containers.contains("db"));
    }

    #[test]
    fn removal_emitted_once_then_gone_counter_runs() {
        let mut state = NetworkState::new(3);

        let snap = snapshot(&[("a", &[("bridge", "1.1.1.1")])]);
        state.update(snap.clone());

        // t+1: the container disappears and the removal is emitted.
        assert!(state.update(Snapshot::new()));
        assert!(state.changes().removed_containers.contains("a"));
        assert_eq!(state.statistics().gone_containers, 1);

        // t+2: still absent, nothing further is emitted.
        assert!(!state.update(Snapshot::new()));
        assert!(state.changes().is_empty());
        assert_eq!(state.statistics().gone_containers, 1);

        // t+3: it returns; an addition is emitted and the counter clears.
        assert!(state.update(snap));
        assert!(state.changes().added_containers.contains("a"));
        assert_eq!(state.statistics().gone_containers, 0);
    }

    #[tracing_test::traced_test]
    #[test]
    fn gone_container_forgotten_after_cleanup_cycles() {
        let mut state = NetworkState::new(2);

        state.update(snapshot(&[("a", &[("bridge", "1.1.1.1")])]));

        state.update(Snapshot::new());
        assert_eq!(state.statistics().gone_containers, 1);

        // Second absent cycle reaches cleanup_cycles and drops the entry.
        state.update(Snapshot::new());
        assert_eq!(state.statistics().gone_containers, 0);
        assert!(logs_contain("Forgetting absent container"));
    }

    #[test]
    fn diff_replays_onto_reference_set() {
        fn reference(snap: &Snapshot) -> HashSet<(String, String, IpAddr)> {
            snap.iter()
                .flat_map(|(container, networks)| {
                    networks
                        .iter()
                        .map(|(network, ip)| (container.clone(), network.clone(), *ip))
                })
                .collect()
        }

        // One container removed, one added, one with an address change, one
        // attaching and one detaching a network.
        let s1 = snapshot(&[
            ("gone", &[("bridge", "10.0.0.1")]),
            ("db", &[("bridge", "10.0.0.3")]),
            ("app", &[("bridge", "10.0.0.5"), ("frontend_net", "172.20.0.5")]),
            ("solo", &[("bridge", "10.0.0.7")]),
        ]);
        let s2 = snapshot(&[
            ("fresh", &[("bridge", "10.0.0.9")]),
            ("db", &[("bridge", "10.0.0.4")]),
            ("app", &[("bridge", "10.0.0.5")]),
            ("solo", &[("bridge", "10.0.0.7"), ("backend_net", "172.21.0.7")]),
        ]);

        let mut state = NetworkState::new(3);
        state.update(s1.clone());
        state.update(s2.clone());
        let changes = state.changes();

        let mut replayed = reference(&s1);

        for container in &changes.removed_containers {
            replayed.retain(|(name, _, _)| name != container);
        }

        for (container, delta) in &changes.network_changes {
            for (network, ip) in &delta.removed {
                replayed.remove(&(container.clone(), network.clone(), *ip));
            }
            for (network, ip) in &delta.added {
                replayed.retain(|(name, net, _)| !(name == container && net == network));
                replayed.insert((container.clone(), network.clone(), *ip));
            }
        }

        for container in &changes.added_containers {
            for (network, ip) in &s2[container] {
                replayed.insert((container.clone(), network.clone(), *ip));
            }
        }

        assert_eq!(replayed, reference(&s2));
    }

    #[test]
    fn statistics_counts() {
        let mut state = NetworkState::new(3);

        assert_eq!(state.statistics().container_count, 0);
        assert!(state.statistics().last_change.is_none());

        state.update(snapshot(&[
            ("web", &[("bridge", "10.0.0.2")]),
            (
                "traefik",
                &[("bridge", "10.0.0.5"), ("frontend_net", "172.20.0.5")],
            ),
        ]));

        let stats = state.statistics();
        assert_eq!(stats.container_count, 2);
        assert_eq!(stats.total_networks, 3);
        assert_eq!(stats.multi_network_containers, 1);
        assert!(stats.last_change.is_some());
    }
}
