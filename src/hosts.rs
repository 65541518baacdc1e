//! Reads the routed hosts, annotations and load balancer address of an Ingress.

use k8s_openapi::api::networking::v1::Ingress;
use std::net::IpAddr;

/// Annotation selecting the tunnel of an Ingress, formatted as `namespace/name`.
pub const TUNNEL_ANNOTATION: &str = "tunnel.cloudflare.com/tunnel";

/// Annotation removing the hosts of an Ingress from its tunnel without deleting the Ingress.
pub const IGNORE_ANNOTATION: &str = "tunnel.cloudflare.com/ignore";

/// A hostname declared by an Ingress rule and whether the Ingress terminates TLS for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: String,
    pub tls: bool,
}

/// Namespace and name of a tunnel referenced through [`TUNNEL_ANNOTATION`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for TunnelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub trait IngressExt {
    /// One entry per rule carrying a host, in rule order.
    fn host_entries(&self) -> Vec<HostEntry>;

    fn is_ignored(&self) -> bool;

    /// `Ok(None)` means the Ingress uses the default tunnel. A value that is not `namespace/name` is returned as
    /// `Err` with the raw annotation.
    fn tunnel_ref(&self) -> Result<Option<TunnelRef>, String>;

    /// First load balancer address the Ingress controller published.
    fn load_balancer_ip(&self) -> Option<IpAddr>;
}

impl IngressExt for Ingress {
    fn host_entries(&self) -> Vec<HostEntry> {
        let Some(spec) = self.spec.as_ref() else {
            return Vec::new();
        };

        let tls_hosts: Vec<&str> = spec
            .tls
            .iter()
            .flatten()
            .flat_map(|tls| tls.hosts.iter().flatten())
            .map(String::as_str)
            .collect();

        spec.rules
            .iter()
            .flatten()
            .filter_map(|rule| rule.host.as_deref())
            .filter(|host| !host.is_empty())
            .map(|host| HostEntry {
                hostname: host.to_string(),
                tls: tls_hosts.contains(&host),
            })
            .collect()
    }

    fn is_ignored(&self) -> bool {
        annotation(self, IGNORE_ANNOTATION).is_some_and(is_truthy)
    }

    fn tunnel_ref(&self) -> Result<Option<TunnelRef>, String> {
        let Some(value) = annotation(self, TUNNEL_ANNOTATION).filter(|value| !value.is_empty()) else {
            return Ok(None);
        };
        match value.split('/').collect::<Vec<_>>()[..] {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => Ok(Some(TunnelRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })),
            _ => Err(value.to_string()),
        }
    }

    fn load_balancer_ip(&self) -> Option<IpAddr> {
        self.status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|ingress| ingress.ip.as_deref())
            .and_then(|ip| ip.parse().ok())
    }
}

fn annotation<'a>(ingress: &'a Ingress, key: &str) -> Option<&'a str> {
    ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

fn is_truthy(value: &str) -> bool {
    !(value.eq_ignore_ascii_case("false") || value == "0")
}
