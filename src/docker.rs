use std::{collections::HashMap, net::IpAddr};

use bollard::{models, Docker};

use crate::{state::Snapshot, Error};

pub(crate) fn connect() -> Result<Docker, Error> {
    tracing::trace!("Attempting to connect to local docker daemon");

    Ok(Docker::connect_with_local_defaults()?)
}

/// Verifies the daemon is reachable and logs what we connected to.
pub(crate) async fn handshake(docker: &Docker) -> Result<(), Error> {
    let version = docker.version().await?;

    match (version.version, version.api_version) {
        (Some(v), Some(a)) => {
            tracing::debug!(version = v, api_version = a, "Connected to docker daemon.")
        }
        _ => tracing::debug!("Connected to docker daemon."),
    }

    Ok(())
}

fn container_name(state: &models::ContainerSummary) -> Option<String> {
    state
        .names
        .as_ref()?
        .first()
        .map(|name| name.trim_start_matches('/').to_owned())
        .filter(|name| !name.is_empty())
}

/// Inspects the running containers into a name, network, address snapshot.
pub(crate) async fn fetch_snapshot(docker: &Docker) -> Result<Snapshot, Error> {
    let containers = docker.list_containers::<&str>(None).await?;

    let mut snapshot = Snapshot::new();

    for container in containers {
        let Some(name) = container_name(&container) else {
            continue;
        };

        let mut networks = HashMap::new();

        let endpoints = container
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();

        for (network, endpoint) in endpoints {
            let Some(address) = endpoint.ip_address.filter(|address| !address.is_empty()) else {
                continue;
            };

            match address.parse::<IpAddr>() {
                Ok(ip) => {
                    networks.insert(network, ip);
                }
                Err(e) => {
                    tracing::warn!(
                        container = name,
                        network,
                        address,
                        error = %e,
                        "Ignoring unparseable container address"
                    );
                }
            }
        }

        snapshot.insert(name, networks);
    }

    Ok(snapshot)
}

/// Only lifecycle events that can change a container's published addresses
/// are interesting; everything else on the stream is noise.
pub(crate) fn useful_event(ev: &models::EventMessage) -> bool {
    matches!(ev.typ, Some(models::EventMessageTypeEnum::CONTAINER))
        && matches!(
            ev.action.as_deref(),
            Some("start" | "die" | "destroy" | "create")
        )
}

pub(crate) fn event_container(ev: &models::EventMessage) -> Option<&str> {
    ev.actor
        .as_ref()?
        .attributes
        .as_ref()?
        .get("name")
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(typ: Option<models::EventMessageTypeEnum>, action: &str) -> models::EventMessage {
        models::EventMessage {
            typ,
            action: Some(action.to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn lifecycle_events_are_useful() {
        for action in ["start", "die", "destroy", "create"] {
            assert!(useful_event(&event(
                Some(models::EventMessageTypeEnum::CONTAINER),
                action
            )));
        }
    }

    #[test]
    fn other_events_are_ignored() {
        assert!(!useful_event(&event(
            Some(models::EventMessageTypeEnum::CONTAINER),
            "exec_create"
        )));
        assert!(!useful_event(&event(
            Some(models::EventMessageTypeEnum::NETWORK),
            "start"
        )));
        assert!(!useful_event(&event(None, "start")));
    }

    #[test]
    fn names_are_unprefixed() {
        let summary = models::ContainerSummary {
            names: Some(vec!["/web".to_owned()]),
            ..Default::default()
        };

        assert_eq!(container_name(&summary), Some("web".to_owned()));

        let unnamed = models::ContainerSummary::default();
        assert_eq!(container_name(&unnamed), None);
    }
}
