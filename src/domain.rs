use std::{fs, net::IpAddr, path::Path};

use ipnet::Ipv4Net;

/// Network name synthesized for addresses that fall inside the detected
/// overlay subnet.
pub(crate) const FLANNEL_NETWORK: &str = "flannel";

const STRIPPED_SUFFIXES: [&str; 4] = ["_net", "-net", "_default", "-default"];

/// Reduces a Docker network name to a DNS-safe label. Common compose
/// suffixes are stripped, anything outside `[A-Za-z0-9-]` becomes a hyphen,
/// hyphen runs collapse, and an empty result falls back to `network`.
pub(crate) fn sanitize_network_name(name: &str) -> String {
    let mut name = name;
    for suffix in STRIPPED_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped;
            break;
        }
    }

    let mut sanitized = String::with_capacity(name.len());
    for ch in name.chars() {
        let mapped = if ch.is_ascii_alphanumeric() { ch } else { '-' };
        if mapped == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(mapped);
    }

    let sanitized = sanitized.trim_matches('-');
    if sanitized.is_empty() {
        "network".to_owned()
    } else {
        sanitized.to_owned()
    }
}

/// Reads the overlay CIDR from a flannel subnet descriptor, a shell-style
/// `KEY=VALUE` file. A missing file means no overlay network.
pub(crate) fn detect_flannel(path: &Path) -> Option<Ipv4Net> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => {
            tracing::info!(path = %path.display(), "No overlay subnet descriptor");
            return None;
        }
    };

    for line in contents.lines() {
        if let Some(cidr) = line.trim().strip_prefix("FLANNEL_NETWORK=") {
            match cidr.parse::<Ipv4Net>() {
                Ok(network) => {
                    tracing::info!(%network, "Detected flannel overlay network");
                    return Some(network);
                }
                Err(e) => {
                    tracing::error!(cidr, error = %e, "Failed to parse overlay network");
                    return None;
                }
            }
        }
    }

    None
}

/// Derives the DNS domains a record should be published under.
#[derive(Debug, Clone)]
pub(crate) struct DomainResolver {
    base: String,
    flannel: Option<Ipv4Net>,
}

impl DomainResolver {
    pub(crate) fn new(base: impl Into<String>, flannel: Option<Ipv4Net>) -> Self {
        Self {
            base: base.into(),
            flannel,
        }
    }

    pub(crate) fn is_flannel_ip(&self, ip: IpAddr) -> bool {
        match (self.flannel, ip) {
            (Some(network), IpAddr::V4(ip)) => network.contains(&ip),
            _ => false,
        }
    }

    /// The single domain for an optionally network-qualified record, as used
    /// by replicated single-record operations.
    pub(crate) fn domain_for(&self, network: Option<&str>) -> String {
        match network {
            None => self.base.clone(),
            Some(FLANNEL_NETWORK) => format!("{}.{}", FLANNEL_NETWORK, self.base),
            Some(network) => format!("{}.{}", sanitize_network_name(network), self.base),
        }
    }

    /// Every domain an endpoint should be published under: the base domain
    /// always, the network subdomain for named non-bridge networks, and the
    /// flannel subdomain when the address sits in the overlay.
    pub(crate) fn domains_for(&self, network: &str, ip: IpAddr) -> Vec<String> {
        let mut domains = vec![self.base.clone()];

        if !network.is_empty() && network != "bridge" {
            let domain = self.domain_for(Some(network));
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        if self.is_flannel_ip(ip) {
            let domain = self.domain_for(Some(FLANNEL_NETWORK));
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        domains
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_network_name("frontend_net"), "frontend");
        assert_eq!(sanitize_network_name("backend-net"), "backend");
        assert_eq!(sanitize_network_name("myapp_default"), "myapp");
        assert_eq!(sanitize_network_name("a!@#$b"), "a-b");
        assert_eq!(sanitize_network_name("_default"), "network");
        assert_eq!(sanitize_network_name(""), "network");
        assert_eq!(sanitize_network_name("---"), "network");
        assert_eq!(sanitize_network_name("web--proxy"), "web-proxy");
        assert_eq!(sanitize_network_name("a..b"), "a-b");
        // Only the first matching suffix is stripped.
        assert_eq!(sanitize_network_name("mesh_net_default"), "mesh_net");
    }

    #[test]
    fn domain_derivation() {
        let resolver = DomainResolver::new("docker.local", None);

        assert_eq!(resolver.domain_for(None), "docker.local");
        assert_eq!(
            resolver.domain_for(Some("frontend_net")),
            "frontend.docker.local"
        );
        assert_eq!(
            resolver.domain_for(Some("flannel")),
            "flannel.docker.local"
        );
    }

    #[test]
    fn bridge_gets_base_domain_only() {
        let resolver = DomainResolver::new("docker.local", None);

        assert_eq!(
            resolver.domains_for("bridge", "10.0.0.2".parse().unwrap()),
            vec!["docker.local".to_owned()]
        );
    }

    #[test]
    fn named_network_adds_subdomain() {
        let resolver = DomainResolver::new("docker.local", None);

        assert_eq!(
            resolver.domains_for("frontend_net", "172.20.0.5".parse().unwrap()),
            vec!["docker.local".to_owned(), "frontend.docker.local".to_owned()]
        );
    }

    #[test]
    fn flannel_ip_adds_overlay_domain() {
        let flannel: Ipv4Net = "10.244.0.0/16".parse().unwrap();
        let resolver = DomainResolver::new("docker.local", Some(flannel));

        assert_eq!(
            resolver.domains_for("overlay", "10.244.5.9".parse().unwrap()),
            vec![
                "docker.local".to_owned(),
                "overlay.docker.local".to_owned(),
                "flannel.docker.local".to_owned(),
            ]
        );

        // Outside the overlay CIDR no flannel domain appears.
        assert_eq!(
            resolver.domains_for("overlay", "192.168.1.9".parse().unwrap()),
            vec!["docker.local".to_owned(), "overlay.docker.local".to_owned()]
        );
    }

    #[test]
    fn ipv6_is_never_overlay() {
        let flannel: Ipv4Net = "10.244.0.0/16".parse().unwrap();
        let resolver = DomainResolver::new("docker.local", Some(flannel));

        assert!(!resolver.is_flannel_ip("fe80::1".parse().unwrap()));
    }

    #[test]
    fn detect_flannel_from_descriptor() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "FLANNEL_SUBNET=10.244.5.1/24").unwrap();
        writeln!(file, "FLANNEL_NETWORK=10.244.0.0/16").unwrap();
        writeln!(file, "FLANNEL_MTU=1450").unwrap();

        let network = detect_flannel(file.path()).unwrap();
        assert_eq!(network, "10.244.0.0/16".parse().unwrap());
    }

    #[test]
    fn missing_descriptor_means_no_overlay() {
        assert!(detect_flannel(Path::new("/nonexistent/subnet.env")).is_none());
    }
}
