use super::{
    DnsRecord,
    DnsRecordParams,
    RemoteConfigClient,
    RemoteTunnel,
    TunnelConfiguration,
    TunnelProvisioner,
};
use async_trait::async_trait;
use eyre::{
    bail,
    Context as _,
    Result,
};
use reqwest::{
    Method,
    StatusCode,
};
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};
use serde_json::Value;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

const DNS_PAGE_SIZE: usize = 100;

/// Wraps the cloudflare api response.
#[derive(Debug, Serialize, Deserialize)]
struct ApiResult<T> {
    errors: Value,
    messages: Value,
    result: T,
    result_info: Option<ApiResultInfo>,
    success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiResultInfo {
    count: usize,
    page: usize,
    per_page: usize,
    total_count: usize,
    total_pages: usize,
}

/// Non-2xx response of the cloudflare api.
#[derive(Debug, thiserror::Error)]
#[error("cloudflare api error: status={status}, body={body:?}")]
pub struct ApiError {
    pub status: StatusCode,
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct TunnelConfigurationResult {
    config: Option<TunnelConfiguration>,
}

#[derive(Debug, Serialize)]
struct TunnelConfigurationUpdate {
    config: TunnelConfiguration,
}

#[derive(Debug, Serialize)]
struct TunnelCreate<'a> {
    name: &'a str,
    tunnel_secret: &'a str,
    config_src: &'a str,
}

/// Request payload for creating or updating a dns record.
///
/// See https://developers.cloudflare.com/api/operations/dns-records-for-a-zone-create-dns-record.
#[derive(Debug, Serialize)]
struct DnsRecordModification {
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
    /// 1 means automatic
    ttl: i64,
    proxied: bool,
    comment: String,
}

impl From<DnsRecordParams> for DnsRecordModification {
    fn from(params: DnsRecordParams) -> Self {
        DnsRecordModification {
            name: params.name,
            record_type: params.record_type,
            content: params.content,
            ttl: 1,
            proxied: params.proxied,
            comment: params.comment,
        }
    }
}

/// Cloudflare API client scoped to one account (tunnels) and one zone (dns records).
#[derive(Clone)]
pub struct CloudflareApi {
    http: reqwest::Client,
    api_token: String,
    account_id: String,
    zone_id: String,
}

impl CloudflareApi {
    pub fn new(api_token: impl ToString, account_id: impl ToString, zone_id: impl ToString) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_token: api_token.to_string(),
            account_id: account_id.to_string(),
            zone_id: zone_id.to_string(),
        }
    }

    fn tunnel_url(&self, tunnel_id: &str) -> String {
        format!("{API_BASE}/accounts/{}/cfd_tunnel/{tunnel_id}", self.account_id)
    }

    fn dns_records_url(&self) -> String {
        format!("{API_BASE}/zones/{}/dns_records", self.zone_id)
    }

    async fn request<R, B>(&self, method: Method, url: &str, query: &[(&str, String)], body: Option<B>) -> Result<ApiResult<R>>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let req = self
            .http
            .request(method, url)
            .bearer_auth(&self.api_token)
            .header("Content-Type", "application/json")
            .query(query);

        let req = if let Some(body) = body { req.json(&body) } else { req };

        let res = req.send().await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await?;
            return Err(ApiError { status, body }.into());
        }

        #[cfg(debug_assertions)]
        let body: ApiResult<_> = {
            let body: Value = res.json().await?;
            match serde_json::from_value(body.clone()) {
                Err(err) => bail!(
                    "failed to parse api response: {err:?}: {}",
                    serde_json::to_string_pretty(&body).unwrap_or_default()
                ),
                Ok(it) => it,
            }
        };

        #[cfg(not(debug_assertions))]
        let body: ApiResult<_> = res.json().await?;

        if !body.success {
            bail!("cloudflare api reported failure: {:?}", body.errors);
        }

        Ok(body)
    }

    /// List dns records in the zone matching `query`, following pagination.
    pub async fn list_dns_records(&self, query: &[(&str, String)]) -> Result<Vec<DnsRecord>> {
        let url = self.dns_records_url();
        let mut records = Vec::new();
        let mut page = 1;
        loop {
            let mut paged = query.to_vec();
            paged.push(("page", page.to_string()));
            paged.push(("per_page", DNS_PAGE_SIZE.to_string()));

            let res = self.request::<Vec<DnsRecord>, ()>(Method::GET, &url, &paged, None).await?;
            records.extend(res.result);

            match res.result_info {
                Some(info) if info.page < info.total_pages => page += 1,
                _ => break,
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl RemoteConfigClient for CloudflareApi {
    async fn get_tunnel_configuration(&self, tunnel_id: &str) -> Result<TunnelConfiguration> {
        let url = format!("{}/configurations", self.tunnel_url(tunnel_id));
        let res = self
            .request::<TunnelConfigurationResult, ()>(Method::GET, &url, &[], None)
            .await
            .wrap_err_with(|| format!("failed to get configuration of tunnel {tunnel_id}"))?;
        Ok(res.result.config.unwrap_or_default())
    }

    async fn update_tunnel_configuration(&self, tunnel_id: &str, config: TunnelConfiguration) -> Result<()> {
        let url = format!("{}/configurations", self.tunnel_url(tunnel_id));
        debug!(%tunnel_id, rules = config.ingress.len(), "updating tunnel configuration");
        self.request::<Value, _>(Method::PUT, &url, &[], Some(TunnelConfigurationUpdate { config }))
            .await
            .wrap_err_with(|| format!("failed to update configuration of tunnel {tunnel_id}"))?;
        Ok(())
    }

    async fn get_dns_record(&self, name: &str, record_type: &str) -> Result<Option<DnsRecord>> {
        let query = [("name", name.to_string()), ("type", record_type.to_string())];
        let url = self.dns_records_url();
        let res = self
            .request::<Vec<DnsRecord>, ()>(Method::GET, &url, &query, None)
            .await
            .wrap_err_with(|| format!("failed to get dns record {name}"))?;
        Ok(res.result.into_iter().next())
    }

    async fn create_dns_record(&self, params: DnsRecordParams) -> Result<()> {
        info!(name = %params.name, r#type = %params.record_type, content = %params.content, "creating dns record");
        let url = self.dns_records_url();
        let name = params.name.clone();
        self.request::<Value, _>(Method::POST, &url, &[], Some(DnsRecordModification::from(params)))
            .await
            .wrap_err_with(|| format!("failed to create dns record {name}"))?;
        Ok(())
    }

    async fn update_dns_record(&self, id: &str, params: DnsRecordParams) -> Result<()> {
        info!(%id, name = %params.name, content = %params.content, "updating dns record");
        let url = format!("{}/{id}", self.dns_records_url());
        let name = params.name.clone();
        self.request::<Value, _>(Method::PUT, &url, &[], Some(DnsRecordModification::from(params)))
            .await
            .wrap_err_with(|| format!("failed to update dns record {name}"))?;
        Ok(())
    }

    async fn delete_dns_record(&self, id: &str) -> Result<()> {
        info!(%id, "deleting dns record");
        let url = format!("{}/{id}", self.dns_records_url());
        self.request::<Value, ()>(Method::DELETE, &url, &[], None)
            .await
            .wrap_err_with(|| format!("failed to delete dns record {id}"))?;
        Ok(())
    }

    async fn list_dns_records_by_comment(&self, record_type: &str, comment: &str) -> Result<Vec<DnsRecord>> {
        let query = [("type", record_type.to_string()), ("comment.exact", comment.to_string())];
        self.list_dns_records(&query)
            .await
            .wrap_err("failed to list managed dns records")
    }
}

#[async_trait]
impl TunnelProvisioner for CloudflareApi {
    async fn find_tunnel(&self, name: &str) -> Result<Option<RemoteTunnel>> {
        let url = format!("{API_BASE}/accounts/{}/cfd_tunnel", self.account_id);
        let query = [("name", name.to_string()), ("is_deleted", "false".to_string())];
        let res = self
            .request::<Vec<RemoteTunnel>, ()>(Method::GET, &url, &query, None)
            .await
            .wrap_err_with(|| format!("failed to look up tunnel {name}"))?;
        Ok(res.result.into_iter().find(|tunnel| tunnel.name == name))
    }

    async fn create_tunnel(&self, name: &str, secret: &str) -> Result<RemoteTunnel> {
        info!(%name, "creating tunnel");
        let url = format!("{API_BASE}/accounts/{}/cfd_tunnel", self.account_id);
        let res = self
            .request::<RemoteTunnel, _>(
                Method::POST,
                &url,
                &[],
                Some(TunnelCreate {
                    name,
                    tunnel_secret: secret,
                    config_src: "cloudflare",
                }),
            )
            .await
            .wrap_err_with(|| format!("failed to create tunnel {name}"))?;
        Ok(res.result)
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
        info!(%tunnel_id, "deleting tunnel");
        match self
            .request::<Value, ()>(Method::DELETE, &self.tunnel_url(tunnel_id), &[], None)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                warn!(%tunnel_id, "tunnel already gone");
                Ok(())
            }
            Err(err) => Err(err.wrap_err(format!("failed to delete tunnel {tunnel_id}"))),
        }
    }
}

fn is_not_found(err: &eyre::Report) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(|err| err.status == StatusCode::NOT_FOUND)
}
