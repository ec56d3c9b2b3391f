use std::{net::IpAddr, sync::Arc};

use actix_web::{dev, get, post, web, App, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};

use crate::{
    config::Role,
    domain::DomainResolver,
    hybrid::Hybrid,
    record::{DnsRecord, Removal},
};

#[derive(Clone)]
pub(crate) struct AppData {
    pub(crate) hybrid: Arc<Hybrid>,
    pub(crate) resolver: DomainResolver,
    pub(crate) role: Role,
    pub(crate) host_name: String,
    pub(crate) replication_enabled: bool,
    pub(crate) api_fallback_enabled: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    role: String,
}

#[derive(Serialize)]
struct StatusResponse {
    role: String,
    host_name: String,
    local_unbound_enabled: bool,
    replication_enabled: bool,
    api_fallback_enabled: bool,
}

#[derive(Serialize)]
struct ActionResponse {
    status: &'static str,
    action: &'static str,
}

#[derive(Debug, Deserialize)]
struct AddRequest {
    hostname: String,
    ip: IpAddr,
    #[serde(default)]
    network_name: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    hostname: String,
    #[serde(default)]
    network_name: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

#[get("/health")]
async fn health(app_data: web::Data<AppData>) -> impl Responder {
    web::Json(HealthResponse {
        status: "healthy",
        role: app_data.role.to_string(),
    })
}

#[get("/status")]
async fn status(app_data: web::Data<AppData>) -> impl Responder {
    web::Json(StatusResponse {
        role: app_data.role.to_string(),
        host_name: app_data.host_name.clone(),
        local_unbound_enabled: app_data.hybrid.has_local(),
        replication_enabled: app_data.replication_enabled,
        api_fallback_enabled: app_data.api_fallback_enabled,
    })
}

#[post("/dns/add")]
async fn dns_add(
    app_data: web::Data<AppData>,
    request: web::Json<AddRequest>,
) -> impl Responder {
    if request.hostname.is_empty() {
        return HttpResponse::BadRequest().json(ActionResponse {
            status: "error",
            action: "add",
        });
    }

    if !app_data.hybrid.has_local() {
        return HttpResponse::InternalServerError().json(ActionResponse {
            status: "error",
            action: "add",
        });
    }

    // An explicit domain replicates exactly one record; otherwise the same
    // domain derivation as for locally observed containers applies.
    let additions: Vec<DnsRecord> = match &request.domain {
        Some(domain) => vec![DnsRecord::new(
            request.hostname.clone(),
            domain.clone(),
            request.ip,
            request.network_name.clone(),
        )],
        None => app_data
            .resolver
            .domains_for(request.network_name.as_deref().unwrap_or(""), request.ip)
            .into_iter()
            .map(|domain| {
                DnsRecord::new(
                    request.hostname.clone(),
                    domain,
                    request.ip,
                    request.network_name.clone(),
                )
            })
            .collect(),
    };

    tracing::info!(
        hostname = request.hostname,
        ip = %request.ip,
        records = additions.len(),
        "Replicated add received"
    );

    app_data.hybrid.apply_batch(&additions, &[]).await;

    HttpResponse::Ok().json(ActionResponse {
        status: "success",
        action: "add",
    })
}

#[post("/dns/remove")]
async fn dns_remove(
    app_data: web::Data<AppData>,
    request: web::Json<RemoveRequest>,
) -> impl Responder {
    if request.hostname.is_empty() {
        return HttpResponse::BadRequest().json(ActionResponse {
            status: "error",
            action: "remove",
        });
    }

    if !app_data.hybrid.has_local() {
        return HttpResponse::InternalServerError().json(ActionResponse {
            status: "error",
            action: "remove",
        });
    }

    let removal = match (&request.domain, &request.network_name) {
        (Some(domain), _) => Removal::Record {
            hostname: request.hostname.clone(),
            domain: domain.clone(),
            ip: None,
        },
        (None, Some(network)) => Removal::Record {
            hostname: request.hostname.clone(),
            domain: app_data.resolver.domain_for(Some(network)),
            ip: None,
        },
        (None, None) => Removal::Container {
            hostname: request.hostname.clone(),
        },
    };

    tracing::info!(hostname = request.hostname, "Replicated remove received");

    app_data.hybrid.apply_batch(&[], &[removal]).await;

    HttpResponse::Ok().json(ActionResponse {
        status: "success",
        action: "remove",
    })
}

fn create_server(port: u16, app_data: AppData) -> Option<dev::Server> {
    tracing::info!(port, "Starting replication server");

    let server = match HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_data.clone()))
            .service(health)
            .service(status)
            .service(dns_add)
            .service(dns_remove)
    })
    .disable_signals()
    .bind(("0.0.0.0", port))
    {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create replication server");
            return None;
        }
    };

    Some(server.run())
}

pub(crate) struct ApiServer {
    server: dev::ServerHandle,
}

impl ApiServer {
    pub(crate) fn new(port: u16, app_data: AppData) -> Option<Self> {
        create_server(port, app_data).map(|server| {
            let handle = server.handle();
            tokio::spawn(server);

            Self { server: handle }
        })
    }

    pub(crate) async fn shutdown(self) {
        self.server.stop(!cfg!(test)).await;
    }
}
