use std::{fmt, net::IpAddr};

/// A DNS A-mapping the agent intends to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DnsRecord {
    pub(crate) hostname: String,
    pub(crate) domain: String,
    pub(crate) ip: IpAddr,
    /// Original network attachment, kept for record descriptions.
    pub(crate) network: Option<String>,
}

impl DnsRecord {
    pub(crate) fn new(
        hostname: impl Into<String>,
        domain: impl Into<String>,
        ip: IpAddr,
        network: Option<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            domain: domain.into(),
            ip,
            network,
        }
    }

    pub(crate) fn fqdn(&self) -> String {
        format!("{}.{}", self.hostname, self.domain)
    }

    /// The description written into appliance rows. Its prefix is the origin
    /// tag used to tell agent-owned rows apart from hand-authored ones.
    pub(crate) fn description(&self, host_name: &str) -> String {
        format!(
            "{} ({})",
            origin_tag(host_name),
            self.network.as_deref().unwrap_or("default")
        )
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!("{} -> {}", self.fqdn(), self.ip))
    }
}

/// A record retraction. A vanished container drops everything published for
/// it; a detached network drops the (hostname, domain) mapping, pinned to a
/// specific address when the retiring address is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Removal {
    Container {
        hostname: String,
    },
    Record {
        hostname: String,
        domain: String,
        ip: Option<IpAddr>,
    },
}

impl Removal {
    pub(crate) fn hostname(&self) -> &str {
        match self {
            Removal::Container { hostname } => hostname,
            Removal::Record { hostname, .. } => hostname,
        }
    }
}

impl fmt::Display for Removal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Removal::Container { hostname } => f.pad(&format!("{hostname} (all records)")),
            Removal::Record {
                hostname,
                domain,
                ip: Some(ip),
            } => f.pad(&format!("{hostname}.{domain} -> {ip}")),
            Removal::Record {
                hostname, domain, ..
            } => f.pad(&format!("{hostname}.{domain}")),
        }
    }
}

pub(crate) fn origin_tag(host_name: &str) -> String {
    format!("Docker container on {host_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_carries_origin_tag() {
        let record = DnsRecord::new(
            "web",
            "docker.local",
            "10.0.0.2".parse().unwrap(),
            Some("frontend_net".to_owned()),
        );

        let description = record.description("pita");
        assert!(description.starts_with(&origin_tag("pita")));
        assert_eq!(description, "Docker container on pita (frontend_net)");

        let bare = DnsRecord::new("web", "docker.local", "10.0.0.2".parse().unwrap(), None);
        assert_eq!(bare.description("pita"), "Docker container on pita (default)");
    }

    #[test]
    fn display_forms() {
        let record = DnsRecord::new("web", "docker.local", "10.0.0.2".parse().unwrap(), None);
        assert_eq!(record.to_string(), "web.docker.local -> 10.0.0.2");

        let removal = Removal::Record {
            hostname: "web".to_owned(),
            domain: "docker.local".to_owned(),
            ip: Some("10.0.0.2".parse().unwrap()),
        };
        assert_eq!(removal.to_string(), "web.docker.local -> 10.0.0.2");
    }
}
