//! The parts of the Cloudflare API the operator depends on.
//!
//! [`RemoteConfigClient`] is everything the Ingress synchronization needs, [`TunnelProvisioner`] is what the tunnel
//! controller needs on top. [`api::CloudflareApi`] implements both over HTTP.

pub mod api;

use crate::rules::IngressRule;
use async_trait::async_trait;
use eyre::Result;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    Map,
    Value,
};

pub const CNAME: &str = "CNAME";

/// Written into the comment of every DNS record the operator creates.
pub const MANAGED_BY: &str = "cloudflare-tunnel-operator";

/// Remote ingress configuration of a tunnel. Fields besides `ingress` are passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A DNS record as returned by the Cloudflare API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub proxied: Option<bool>,
}

impl DnsRecord {
    /// A record is healthy when it is a CNAME pointing at the tunnel.
    pub fn is_healthy(&self, tunnel_id: &str) -> bool {
        !self.id.is_empty() && self.record_type == CNAME && self.content == tunnel_target(tunnel_id)
    }
}

/// Arguments for creating or updating a DNS record.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsRecordParams {
    pub name: String,
    pub record_type: String,
    pub content: String,
    pub proxied: bool,
    pub comment: String,
}

impl DnsRecordParams {
    /// A proxied CNAME for `hostname` pointing at the tunnel, tagged as managed by this operator.
    pub fn tunnel_cname(tunnel_id: &str, hostname: &str) -> Result<Self> {
        Ok(DnsRecordParams {
            name: hostname.to_string(),
            record_type: CNAME.to_string(),
            content: tunnel_target(tunnel_id),
            proxied: true,
            comment: DnsComment::new(tunnel_id).to_comment()?,
        })
    }
}

/// Ownership marker stored in the comment of managed DNS records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsComment {
    #[serde(rename = "managed-by")]
    pub managed_by: String,
    #[serde(rename = "tunnelID")]
    pub tunnel_id: String,
}

impl DnsComment {
    pub fn new(tunnel_id: &str) -> Self {
        DnsComment {
            managed_by: MANAGED_BY.to_string(),
            tunnel_id: tunnel_id.to_string(),
        }
    }

    pub fn to_comment(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Canonical CNAME target of a tunnel.
pub fn tunnel_target(tunnel_id: &str) -> String {
    format!("{tunnel_id}.cfargotunnel.com")
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteTunnel {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait RemoteConfigClient: Send + Sync {
    async fn get_tunnel_configuration(&self, tunnel_id: &str) -> Result<TunnelConfiguration>;

    async fn update_tunnel_configuration(&self, tunnel_id: &str, config: TunnelConfiguration) -> Result<()>;

    async fn get_dns_record(&self, name: &str, record_type: &str) -> Result<Option<DnsRecord>>;

    async fn create_dns_record(&self, params: DnsRecordParams) -> Result<()>;

    async fn update_dns_record(&self, id: &str, params: DnsRecordParams) -> Result<()>;

    async fn delete_dns_record(&self, id: &str) -> Result<()>;

    async fn list_dns_records_by_comment(&self, record_type: &str, comment: &str) -> Result<Vec<DnsRecord>>;
}

#[async_trait]
pub trait TunnelProvisioner: Send + Sync {
    /// The non-deleted tunnel called `name`, if there is one.
    async fn find_tunnel(&self, name: &str) -> Result<Option<RemoteTunnel>>;

    /// `secret` is the base64 encoded tunnel secret.
    async fn create_tunnel(&self, name: &str, secret: &str) -> Result<RemoteTunnel>;

    /// Deleting a tunnel that no longer exists succeeds.
    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()>;
}
