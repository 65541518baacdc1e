use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{
    Deserialize,
    Serialize,
};

/// Label that marks the tunnel used by Ingresses without an explicit tunnel annotation.
pub const DEFAULT_TUNNEL_LABEL: &str = "tunnel.cloudflare.com/default";

// Define the spec of our custom resource
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "tunnel.cloudflare.com",
    version = "v1alpha1",
    kind = "CloudflareTunnel",
    namespaced,
    status = "CloudflareTunnelStatus",
    shortname = "cft",
    printcolumn = r#"{"name":"TUNNEL ID", "type":"string", "jsonPath":".status.tunnelId"}"#,
    printcolumn = r#"{"name":"DEFAULT", "type":"boolean", "jsonPath":".spec.default"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareTunnelSpec {
    /// Use this tunnel for Ingresses that do not reference a tunnel explicitly. At most one tunnel in the cluster
    /// should be the default.
    #[serde(default)]
    pub default: bool,
    /// Settings applied to every ingress rule routed through this tunnel.
    #[serde(default)]
    pub settings: TunnelSettings,
}

/// Origin settings shared by all hosts of a tunnel.
///
/// See https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/configure-tunnels/origin-configuration/
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSettings {
    /// Service answering requests that match no hostname. Defaults to `http_status:404`.
    #[serde(default = "default_catch_all_rule")]
    pub catch_all_rule: String,
    /// Path to the CA for the certificate of your origin. Only needed if the certificate is not signed by Cloudflare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pool: Option<String>,
    /// Accept any certificate presented by the origin.
    #[serde(default, rename = "noTLSVerify")]
    pub no_tls_verify: bool,
    /// Timeout in seconds for completing a TLS handshake to the origin.
    #[serde(default = "default_tls_timeout_seconds")]
    pub tls_timeout_seconds: u32,
    /// Connect to the origin using HTTP2. The origin must be configured as https.
    #[serde(default)]
    pub http2_origin: bool,
    /// Disable chunked transfer encoding, e.g. for WSGI servers.
    #[serde(default)]
    pub disable_chunked_encoding: bool,
    /// Timeout in seconds for establishing a new TCP connection to the origin.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u32,
    /// Disable the happy eyeballs algorithm for IPv4/IPv6 fallback.
    #[serde(default)]
    pub no_happy_eyeballs: bool,
    /// "" for the regular proxy and "socks" for a SOCKS5 proxy.
    #[serde(default)]
    pub proxy_type: String,
    /// Timeout in seconds after which an idle keepalive connection can be discarded.
    #[serde(default = "default_keep_alive_timeout_seconds")]
    pub keep_alive_timeout_seconds: u32,
    /// Maximum number of idle keepalive connections between the tunnel and the origin.
    #[serde(default = "default_keep_alive_connections")]
    pub keep_alive_connections: u32,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            catch_all_rule: default_catch_all_rule(),
            ca_pool: None,
            no_tls_verify: false,
            tls_timeout_seconds: default_tls_timeout_seconds(),
            http2_origin: false,
            disable_chunked_encoding: false,
            connect_timeout_seconds: default_connect_timeout_seconds(),
            no_happy_eyeballs: false,
            proxy_type: String::new(),
            keep_alive_timeout_seconds: default_keep_alive_timeout_seconds(),
            keep_alive_connections: default_keep_alive_connections(),
        }
    }
}

fn default_catch_all_rule() -> String {
    "http_status:404".to_string()
}

fn default_tls_timeout_seconds() -> u32 {
    10
}

fn default_connect_timeout_seconds() -> u32 {
    30
}

fn default_keep_alive_timeout_seconds() -> u32 {
    90
}

fn default_keep_alive_connections() -> u32 {
    100
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareTunnelStatus {
    /// Cloudflare id of the tunnel, set once the tunnel was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl CloudflareTunnel {
    /// The assigned Cloudflare tunnel id, if any.
    pub fn tunnel_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.tunnel_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the default label currently on the object matches `spec.default`.
    pub fn default_label_in_sync(&self) -> bool {
        let labelled = self
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(DEFAULT_TUNNEL_LABEL))
            .is_some_and(|value| value == "true");
        labelled == self.spec.default
    }
}
