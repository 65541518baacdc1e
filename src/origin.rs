use crate::resources::TunnelSettings;
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

/// Per-hostname connection parameters that cloudflared uses when talking to the origin.
///
/// See https://developers.cloudflare.com/api/operations/cloudflare-tunnel-configuration-put-configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginRequestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pool: Option<String>,
    #[serde(default, rename = "noTLSVerify", skip_serializing_if = "Option::is_none")]
    pub no_tls_verify: Option<bool>,
    #[serde(default, with = "seconds", skip_serializing_if = "Option::is_none")]
    pub tls_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_origin: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_chunked_encoding: Option<bool>,
    #[serde(default, with = "seconds", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_happy_eyeballs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_type: Option<String>,
    #[serde(default, with = "seconds", skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_connections: Option<u32>,
}

/// Builds the origin request config for `hostname`. The hostname is used as both the Host header and the SNI name
/// so the ingress controller behind the tunnel can route the request.
pub fn origin_request_config(settings: &TunnelSettings, hostname: &str) -> OriginRequestConfig {
    OriginRequestConfig {
        http_host_header: Some(hostname.to_string()),
        origin_server_name: Some(hostname.to_string()),
        ca_pool: settings.ca_pool.clone(),
        no_tls_verify: Some(settings.no_tls_verify),
        tls_timeout: Some(Duration::from_secs(settings.tls_timeout_seconds.into())),
        http2_origin: Some(settings.http2_origin),
        disable_chunked_encoding: Some(settings.disable_chunked_encoding),
        connect_timeout: Some(Duration::from_secs(settings.connect_timeout_seconds.into())),
        no_happy_eyeballs: Some(settings.no_happy_eyeballs),
        proxy_type: Some(settings.proxy_type.clone()),
        keep_alive_timeout: Some(Duration::from_secs(settings.keep_alive_timeout_seconds.into())),
        keep_alive_connections: Some(settings.keep_alive_connections),
    }
}

/// The tunnel API encodes durations as whole seconds.
mod seconds {
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
