#![deny(unreachable_pub)]
mod api;
mod cache;
pub mod config;
mod docker;
mod domain;
mod error;
mod hybrid;
mod reconcile;
mod record;
mod replication;
mod rest;
mod state;
mod zonefile;

use std::{path::Path, sync::Arc};

use tokio::{sync::watch, task::JoinHandle};

pub use config::Config;
pub use error::Error;

use crate::{
    api::{ApiServer, AppData},
    config::Role,
    domain::{detect_flannel, DomainResolver},
    hybrid::{Hybrid, LocalBackend},
    reconcile::Reconciler,
    replication::ReplicationClient,
    rest::RestBackend,
    zonefile::ZoneFileBackend,
};

const FLANNEL_SUBNET_FILE: &str = "/var/run/flannel/subnet.env";

/// The running daemon: backends wired into the dispatcher, the reconcile
/// task, and the replication server where one belongs.
pub struct Agent {
    api_server: Option<ApiServer>,
    shutdown: watch::Sender<bool>,
    reconciler: JoinHandle<()>,
}

impl Agent {
    pub async fn new(config: Config) -> Result<Self, Error> {
        let docker = docker::connect()?;
        docker::handshake(&docker).await?;

        let flannel = detect_flannel(Path::new(FLANNEL_SUBNET_FILE));
        let resolver = DomainResolver::new(config.base_domain.clone(), flannel);

        let rest = match &config.rest {
            Some(rest_config) => {
                let backend = Arc::new(RestBackend::new(rest_config, &config.host_name)?);

                match backend.test_connection().await {
                    Ok(()) => {
                        tracing::info!("Appliance connection successful");
                        backend.startup_diagnostics().await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Appliance connection test failed");
                    }
                }

                Some(backend)
            }
            None => None,
        };

        let mut locals: Vec<Box<dyn LocalBackend>> = Vec::new();
        if let Some(file_config) = &config.file {
            let backend = ZoneFileBackend::new(file_config);
            backend.ensure_file().await?;
            locals.push(Box::new(backend));
        }

        let replication = if config.role == Role::Master && !config.peers.is_empty() {
            Some(ReplicationClient::new(config.peers.clone())?)
        } else {
            None
        };

        let replication_enabled = replication.is_some();
        let api_fallback_enabled = rest.is_some();
        let hybrid = Arc::new(Hybrid::new(locals, rest, replication));

        // Only a host with a file backend can satisfy replicated requests
        // locally, so only such hosts expose the replication server.
        let api_server = if config.file.is_some() {
            ApiServer::new(
                config.replication_port,
                AppData {
                    hybrid: hybrid.clone(),
                    resolver: resolver.clone(),
                    role: config.role,
                    host_name: config.host_name.clone(),
                    replication_enabled,
                    api_fallback_enabled,
                },
            )
        } else {
            None
        };

        tracing::info!(
            host = config.host_name,
            role = %config.role,
            base_domain = config.base_domain,
            "Agent started"
        );

        let (shutdown, receiver) = watch::channel(false);
        let reconciler = Reconciler::new(docker, resolver, hybrid, config.reconcile.clone());
        let handle = tokio::spawn(reconciler.run(receiver));

        Ok(Self {
            api_server,
            shutdown,
            reconciler: handle,
        })
    }

    /// Stops the reconcile loop, letting in-flight backend calls run to
    /// their own deadlines, then stops the replication server.
    pub async fn shutdown(self) {
        tracing::info!("Agent shutting down");

        let _ = self.shutdown.send(true);
        if let Err(e) = self.reconciler.await {
            tracing::error!(error = %e, "Reconciler task failed");
        }

        if let Some(api_server) = self.api_server {
            api_server.shutdown().await;
        }
    }
}
