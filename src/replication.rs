use std::{collections::HashMap, time::Duration};

use reqwest::Client;
use serde::Serialize;

use crate::{
    record::{DnsRecord, Removal},
    Error,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
struct ReplicationBody<'a> {
    hostname: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_name: Option<&'a str>,
}

/// Master-side fan-out to peer agents. One POST per mutation per peer; a
/// failing peer is reported per-peer and never retried here.
pub(crate) struct ReplicationClient {
    client: Client,
    peers: HashMap<String, String>,
}

impl ReplicationClient {
    pub(crate) fn new(peers: HashMap<String, String>) -> Result<Self, Error> {
        tracing::info!(
            peers = peers.keys().cloned().collect::<Vec<_>>().join(", "),
            "Replicating DNS records to peers"
        );

        Ok(Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(READ_TIMEOUT)
                .build()?,
            peers,
        })
    }

    /// Pushes a committed batch to every peer, removals first. Failures are
    /// logged per peer; the batch outcome is unaffected.
    pub(crate) async fn fan_out(&self, additions: &[DnsRecord], removals: &[Removal]) {
        for removal in removals {
            let results = self.replicate_remove(removal).await;
            log_failures("remove", &removal.to_string(), &results);
        }

        for record in additions {
            let results = self.replicate_add(record).await;
            log_failures("add", &record.to_string(), &results);
        }
    }

    pub(crate) async fn replicate_add(&self, record: &DnsRecord) -> HashMap<String, bool> {
        self.post(
            "add",
            &ReplicationBody {
                hostname: &record.hostname,
                ip: Some(record.ip.to_string()),
                domain: Some(&record.domain),
                network_name: record.network.as_deref(),
            },
        )
        .await
    }

    pub(crate) async fn replicate_remove(&self, removal: &Removal) -> HashMap<String, bool> {
        let body = match removal {
            Removal::Container { hostname } => ReplicationBody {
                hostname,
                ip: None,
                domain: None,
                network_name: None,
            },
            Removal::Record {
                hostname, domain, ..
            } => ReplicationBody {
                hostname,
                ip: None,
                domain: Some(domain),
                network_name: None,
            },
        };

        self.post("remove", &body).await
    }

    async fn post(&self, action: &str, body: &ReplicationBody<'_>) -> HashMap<String, bool> {
        let mut results = HashMap::new();

        for (peer, base_url) in &self.peers {
            let url = format!("{base_url}/dns/{action}");

            let success = match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let ok = response.status().is_success();
                    if !ok {
                        tracing::warn!(peer, action, status = %response.status(), "Peer rejected replication");
                    }
                    ok
                }
                Err(e) => {
                    tracing::error!(peer, action, error = %e, "Replication request failed");
                    false
                }
            };

            results.insert(peer.clone(), success);
        }

        results
    }
}

fn log_failures(action: &str, subject: &str, results: &HashMap<String, bool>) {
    let failed: Vec<&str> = results
        .iter()
        .filter(|(_, success)| !**success)
        .map(|(peer, _)| peer.as_str())
        .collect();

    if !failed.is_empty() {
        tracing::warn!(
            action,
            subject,
            peers = failed.join(", "),
            "Replication failed to some peers"
        );
    }
}
