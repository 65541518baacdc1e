//! In-memory stand-ins for Cloudflare and the Kubernetes API.

use crate::{
    cloudflare::{
        DnsRecord,
        DnsRecordParams,
        RemoteConfigClient,
        RemoteTunnel,
        TunnelConfiguration,
        TunnelProvisioner,
    },
    cluster::ClusterState,
    resources::{
        CloudflareTunnel,
        CloudflareTunnelSpec,
        CloudflareTunnelStatus,
        DEFAULT_TUNNEL_LABEL,
    },
    rules::{
        IngressRule,
        RuleHost,
    },
};
use async_trait::async_trait;
use eyre::{
    bail,
    Result,
};
use k8s_openapi::{
    api::networking::v1::{
        Ingress,
        IngressLoadBalancerIngress,
        IngressLoadBalancerStatus,
        IngressRule as KubeIngressRule,
        IngressSpec,
        IngressStatus,
        IngressTLS,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    api::ObjectMeta,
    ResourceExt as _,
};
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Mutex,
};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    GetTunnelConfiguration(String),
    UpdateTunnelConfiguration(String),
    GetDnsRecord(String),
    CreateDnsRecord(String),
    /// record id, new content
    UpdateDnsRecord(String, String),
    DeleteDnsRecord(String),
    ListDnsRecordsByComment(String),
    FindTunnel(String),
    CreateTunnel(String),
    DeleteTunnel(String),
}

#[derive(Default)]
struct CloudflareState {
    configs: HashMap<String, TunnelConfiguration>,
    records: Vec<DnsRecord>,
    tunnels: Vec<RemoteTunnel>,
    calls: Vec<RemoteCall>,
    next_id: usize,
    fail_tunnel_reads: bool,
    fail_dns: bool,
    fail_provisioning: bool,
}

/// Records every call and keeps tunnel configurations and DNS records in memory.
#[derive(Default)]
pub struct FakeCloudflare {
    state: Mutex<CloudflareState>,
    io_delay: std::sync::atomic::AtomicBool,
}

impl FakeCloudflare {
    fn with_state<T>(&self, f: impl FnOnce(&mut CloudflareState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Yield to the scheduler inside every remote call, making interleavings between tasks likely.
    pub fn set_io_delay(&self, delay: bool) {
        self.io_delay.store(delay, std::sync::atomic::Ordering::SeqCst);
    }

    async fn io(&self) {
        if self.io_delay.load(std::sync::atomic::Ordering::SeqCst) {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        }
    }

    pub fn fail_tunnel_reads(&self, fail: bool) {
        self.with_state(|s| s.fail_tunnel_reads = fail);
    }

    pub fn fail_provisioning(&self, fail: bool) {
        self.with_state(|s| s.fail_provisioning = fail);
    }

    pub fn fail_dns(&self, fail: bool) {
        self.with_state(|s| s.fail_dns = fail);
    }

    pub fn set_rules(&self, tunnel_id: &str, rules: Vec<IngressRule>) {
        self.with_state(|s| {
            s.configs.entry(tunnel_id.to_string()).or_default().ingress = rules;
        });
    }

    pub fn rules(&self, tunnel_id: &str) -> Vec<IngressRule> {
        self.with_state(|s| {
            s.configs
                .get(tunnel_id)
                .map(|config| config.ingress.clone())
                .unwrap_or_default()
        })
    }

    pub fn hostnames(&self, tunnel_id: &str) -> Vec<RuleHost> {
        self.rules(tunnel_id).into_iter().map(|rule| rule.hostname).collect()
    }

    pub fn insert_dns_record(&self, record: DnsRecord) {
        self.with_state(|s| s.records.push(record));
    }

    pub fn dns_record(&self, name: &str) -> Option<DnsRecord> {
        self.with_state(|s| s.records.iter().find(|record| record.name == name).cloned())
    }

    pub fn tunnels(&self) -> Vec<RemoteTunnel> {
        self.with_state(|s| s.tunnels.clone())
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn count(&self, pred: impl Fn(&RemoteCall) -> bool) -> usize {
        self.with_state(|s| s.calls.iter().filter(|call| pred(call)).count())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    fn record_call(&self, call: RemoteCall) {
        self.with_state(|s| s.calls.push(call));
    }

    fn check_dns(&self) -> Result<()> {
        if self.with_state(|s| s.fail_dns) {
            bail!("dns api unavailable");
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        self.with_state(|s| {
            s.next_id += 1;
            format!("{prefix}-{}", s.next_id)
        })
    }
}

#[async_trait]
impl RemoteConfigClient for FakeCloudflare {
    async fn get_tunnel_configuration(&self, tunnel_id: &str) -> Result<TunnelConfiguration> {
        self.record_call(RemoteCall::GetTunnelConfiguration(tunnel_id.to_string()));
        self.io().await;
        if self.with_state(|s| s.fail_tunnel_reads) {
            bail!("tunnel api unavailable");
        }
        Ok(self.with_state(|s| s.configs.get(tunnel_id).cloned().unwrap_or_default()))
    }

    async fn update_tunnel_configuration(&self, tunnel_id: &str, config: TunnelConfiguration) -> Result<()> {
        self.record_call(RemoteCall::UpdateTunnelConfiguration(tunnel_id.to_string()));
        self.io().await;
        self.with_state(|s| s.configs.insert(tunnel_id.to_string(), config));
        Ok(())
    }

    async fn get_dns_record(&self, name: &str, record_type: &str) -> Result<Option<DnsRecord>> {
        self.record_call(RemoteCall::GetDnsRecord(name.to_string()));
        self.io().await;
        self.check_dns()?;
        Ok(self.with_state(|s| {
            s.records
                .iter()
                .find(|record| record.name == name && record.record_type == record_type)
                .cloned()
        }))
    }

    async fn create_dns_record(&self, params: DnsRecordParams) -> Result<()> {
        self.record_call(RemoteCall::CreateDnsRecord(params.name.clone()));
        self.io().await;
        self.check_dns()?;
        let id = self.next_id("rec");
        self.insert_dns_record(DnsRecord {
            id,
            name: params.name,
            record_type: params.record_type,
            content: params.content,
            comment: Some(params.comment),
            proxied: Some(params.proxied),
        });
        Ok(())
    }

    async fn update_dns_record(&self, id: &str, params: DnsRecordParams) -> Result<()> {
        self.record_call(RemoteCall::UpdateDnsRecord(id.to_string(), params.content.clone()));
        self.io().await;
        self.check_dns()?;
        self.with_state(|s| {
            let Some(record) = s.records.iter_mut().find(|record| record.id == id) else {
                bail!("no dns record with id {id}");
            };
            record.name = params.name;
            record.record_type = params.record_type;
            record.content = params.content;
            record.comment = Some(params.comment);
            record.proxied = Some(params.proxied);
            Ok(())
        })
    }

    async fn delete_dns_record(&self, id: &str) -> Result<()> {
        self.record_call(RemoteCall::DeleteDnsRecord(id.to_string()));
        self.io().await;
        self.check_dns()?;
        self.with_state(|s| s.records.retain(|record| record.id != id));
        Ok(())
    }

    async fn list_dns_records_by_comment(&self, record_type: &str, comment: &str) -> Result<Vec<DnsRecord>> {
        self.record_call(RemoteCall::ListDnsRecordsByComment(comment.to_string()));
        self.check_dns()?;
        Ok(self.with_state(|s| {
            s.records
                .iter()
                .filter(|record| record.record_type == record_type && record.comment.as_deref() == Some(comment))
                .cloned()
                .collect()
        }))
    }
}

#[async_trait]
impl TunnelProvisioner for FakeCloudflare {
    async fn find_tunnel(&self, name: &str) -> Result<Option<RemoteTunnel>> {
        self.record_call(RemoteCall::FindTunnel(name.to_string()));
        if self.with_state(|s| s.fail_provisioning) {
            bail!("tunnel api unavailable");
        }
        Ok(self.with_state(|s| s.tunnels.iter().find(|tunnel| tunnel.name == name).cloned()))
    }

    async fn create_tunnel(&self, name: &str, _secret: &str) -> Result<RemoteTunnel> {
        self.record_call(RemoteCall::CreateTunnel(name.to_string()));
        if self.with_state(|s| s.fail_provisioning) {
            bail!("tunnel api unavailable");
        }
        let tunnel = RemoteTunnel {
            id: self.next_id("tunnel"),
            name: name.to_string(),
        };
        self.with_state(|s| s.tunnels.push(tunnel.clone()));
        Ok(tunnel)
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
        self.record_call(RemoteCall::DeleteTunnel(tunnel_id.to_string()));
        self.with_state(|s| s.tunnels.retain(|tunnel| tunnel.id != tunnel_id));
        Ok(())
    }
}

/// Ingresses and tunnels keyed by `namespace/name`.
#[derive(Default)]
pub struct FakeCluster {
    ingresses: Mutex<BTreeMap<String, Ingress>>,
    tunnels: Mutex<BTreeMap<String, CloudflareTunnel>>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl FakeCluster {
    pub fn put_ingress(&self, ingress: Ingress) {
        let k = key(&ingress.namespace().unwrap_or_default(), &ingress.name_any());
        self.ingresses.lock().unwrap().insert(k, ingress);
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.ingresses.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Mimics the API server: sets the deletion timestamp, or removes the object right away when it has no
    /// finalizers.
    pub fn delete_ingress(&self, namespace: &str, name: &str) {
        let mut ingresses = self.ingresses.lock().unwrap();
        let k = key(namespace, name);
        let Some(ingress) = ingresses.get_mut(&k) else {
            return;
        };
        if ingress.finalizers().is_empty() {
            ingresses.remove(&k);
        } else {
            ingress.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    pub fn put_tunnel(&self, tunnel: CloudflareTunnel) {
        let k = key(&tunnel.namespace().unwrap_or_default(), &tunnel.name_any());
        self.tunnels.lock().unwrap().insert(k, tunnel);
    }

    pub fn tunnel(&self, namespace: &str, name: &str) -> Option<CloudflareTunnel> {
        self.tunnels.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    fn update_ingress_finalizers(&self, ingress: &Ingress, f: impl FnOnce(&mut Vec<String>)) -> Result<(), kube::Error> {
        let mut ingresses = self.ingresses.lock().unwrap();
        let k = key(&ingress.namespace().unwrap_or_default(), &ingress.name_any());
        let Some(stored) = ingresses.get_mut(&k) else {
            return Err(not_found(&k));
        };
        f(stored.metadata.finalizers.get_or_insert_with(Vec::new));
        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            ingresses.remove(&k);
        }
        Ok(())
    }
}

fn not_found(key: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{key} not found"),
        reason: "NotFound".to_string(),
        code: 404,
    })
}

#[async_trait]
impl ClusterState for FakeCluster {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, kube::Error> {
        Ok(self.ingress(namespace, name))
    }

    async fn add_ingress_finalizer(&self, ingress: &Ingress, finalizer: &str) -> Result<(), kube::Error> {
        self.update_ingress_finalizers(ingress, |finalizers| finalizers.push(finalizer.to_string()))
    }

    async fn remove_ingress_finalizer(&self, ingress: &Ingress, finalizer: &str) -> Result<(), kube::Error> {
        self.update_ingress_finalizers(ingress, |finalizers| finalizers.retain(|f| f != finalizer))
    }

    async fn get_tunnel(&self, namespace: &str, name: &str) -> Result<Option<CloudflareTunnel>, kube::Error> {
        Ok(self.tunnel(namespace, name))
    }

    async fn default_tunnels(&self) -> Result<Vec<CloudflareTunnel>, kube::Error> {
        Ok(self
            .tunnels
            .lock()
            .unwrap()
            .values()
            .filter(|tunnel| tunnel.labels().get(DEFAULT_TUNNEL_LABEL).is_some_and(|v| v == "true"))
            .cloned()
            .collect())
    }

    async fn patch_tunnel_status(
        &self,
        tunnel: &CloudflareTunnel,
        status: &CloudflareTunnelStatus,
    ) -> Result<(), kube::Error> {
        let mut tunnels = self.tunnels.lock().unwrap();
        let k = key(&tunnel.namespace().unwrap_or_default(), &tunnel.name_any());
        let stored = tunnels.get_mut(&k).ok_or_else(|| not_found(&k))?;
        stored.status = Some(status.clone());
        Ok(())
    }

    async fn set_tunnel_default_label(&self, tunnel: &CloudflareTunnel, default: bool) -> Result<(), kube::Error> {
        let mut tunnels = self.tunnels.lock().unwrap();
        let k = key(&tunnel.namespace().unwrap_or_default(), &tunnel.name_any());
        let stored = tunnels.get_mut(&k).ok_or_else(|| not_found(&k))?;
        let labels = stored.labels_mut();
        if default {
            labels.insert(DEFAULT_TUNNEL_LABEL.to_string(), "true".to_string());
        } else {
            labels.remove(DEFAULT_TUNNEL_LABEL);
        }
        Ok(())
    }
}

/// An Ingress with one rule per host and one TLS block listing `tls_hosts`.
pub fn ingress(namespace: &str, name: &str, hosts: &[&str], tls_hosts: &[&str]) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(
                hosts
                    .iter()
                    .map(|host| KubeIngressRule {
                        host: Some(host.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            tls: Some(vec![IngressTLS {
                hosts: Some(tls_hosts.iter().map(|host| host.to_string()).collect()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn with_load_balancer_ip(mut ingress: Ingress, ip: &str) -> Ingress {
    ingress.status = Some(IngressStatus {
        load_balancer: Some(IngressLoadBalancerStatus {
            ingress: Some(vec![IngressLoadBalancerIngress {
                ip: Some(ip.to_string()),
                ..Default::default()
            }]),
        }),
    });
    ingress
}

pub fn with_annotation(mut ingress: Ingress, key: &str, value: &str) -> Ingress {
    ingress.annotations_mut().insert(key.to_string(), value.to_string());
    ingress
}

/// A tunnel that already got its Cloudflare id.
pub fn tunnel(namespace: &str, name: &str, tunnel_id: Option<&str>, default: bool) -> CloudflareTunnel {
    let mut tunnel = CloudflareTunnel::new(
        name,
        CloudflareTunnelSpec {
            default,
            ..Default::default()
        },
    );
    tunnel.metadata.namespace = Some(namespace.to_string());
    if default {
        tunnel
            .labels_mut()
            .insert(DEFAULT_TUNNEL_LABEL.to_string(), "true".to_string());
    }
    tunnel.status = tunnel_id.map(|id| CloudflareTunnelStatus {
        tunnel_id: Some(id.to_string()),
        ..Default::default()
    });
    tunnel
}
