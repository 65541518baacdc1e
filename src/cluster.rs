//! Kubernetes reads and writes needed by the reconcilers, behind a trait so the state machines can run against an
//! in-memory cluster in tests.

use crate::resources::{
    CloudflareTunnel,
    CloudflareTunnelStatus,
    DEFAULT_TUNNEL_LABEL,
};
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{
        ListParams,
        Patch,
        PatchParams,
    },
    Api,
    Client,
    ResourceExt as _,
};
use serde_json::json;

/// Field manager used for every patch the operator sends.
pub const FIELD_MANAGER: &str = "tunnel.cloudflare.com";

#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, kube::Error>;

    async fn add_ingress_finalizer(&self, ingress: &Ingress, finalizer: &str) -> Result<(), kube::Error>;

    async fn remove_ingress_finalizer(&self, ingress: &Ingress, finalizer: &str) -> Result<(), kube::Error>;

    async fn get_tunnel(&self, namespace: &str, name: &str) -> Result<Option<CloudflareTunnel>, kube::Error>;

    /// Tunnels carrying the default label, across all namespaces.
    async fn default_tunnels(&self) -> Result<Vec<CloudflareTunnel>, kube::Error>;

    async fn patch_tunnel_status(
        &self,
        tunnel: &CloudflareTunnel,
        status: &CloudflareTunnelStatus,
    ) -> Result<(), kube::Error>;

    async fn set_tunnel_default_label(&self, tunnel: &CloudflareTunnel, default: bool) -> Result<(), kube::Error>;
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// [`ClusterState`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ingress_api(&self, ingress: &Ingress) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), &ingress.namespace().unwrap_or_default())
    }

    fn tunnel_api(&self, tunnel: &CloudflareTunnel) -> Api<CloudflareTunnel> {
        Api::namespaced(self.client.clone(), &tunnel.namespace().unwrap_or_default())
    }

    /// Replaces the finalizer list. The resource version makes the API server reject the patch if the object changed
    /// since it was read, so finalizers added by others are never dropped.
    async fn patch_ingress_finalizers(&self, ingress: &Ingress, finalizers: Vec<String>) -> Result<(), kube::Error> {
        let patch = json!({
            "metadata": {
                "resourceVersion": ingress.resource_version(),
                "finalizers": finalizers,
            }
        });
        self.ingress_api(ingress)
            .patch(&ingress.name_any(), &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterState for KubeCluster {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, kube::Error> {
        Api::<Ingress>::namespaced(self.client.clone(), namespace).get_opt(name).await
    }

    async fn add_ingress_finalizer(&self, ingress: &Ingress, finalizer: &str) -> Result<(), kube::Error> {
        let mut finalizers = ingress.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.patch_ingress_finalizers(ingress, finalizers).await
    }

    async fn remove_ingress_finalizer(&self, ingress: &Ingress, finalizer: &str) -> Result<(), kube::Error> {
        let finalizers = ingress
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        self.patch_ingress_finalizers(ingress, finalizers).await
    }

    async fn get_tunnel(&self, namespace: &str, name: &str) -> Result<Option<CloudflareTunnel>, kube::Error> {
        Api::<CloudflareTunnel>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn default_tunnels(&self) -> Result<Vec<CloudflareTunnel>, kube::Error> {
        let params = ListParams::default().labels(&format!("{DEFAULT_TUNNEL_LABEL}=true"));
        let list = Api::<CloudflareTunnel>::all(self.client.clone()).list(&params).await?;
        Ok(list.items)
    }

    async fn patch_tunnel_status(
        &self,
        tunnel: &CloudflareTunnel,
        status: &CloudflareTunnelStatus,
    ) -> Result<(), kube::Error> {
        let patch = json!({ "status": status });
        self.tunnel_api(tunnel)
            .patch_status(&tunnel.name_any(), &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_tunnel_default_label(&self, tunnel: &CloudflareTunnel, default: bool) -> Result<(), kube::Error> {
        // null removes the label in a merge patch
        let value = default.then_some("true");
        let patch = json!({ "metadata": { "labels": { DEFAULT_TUNNEL_LABEL: value } } });
        self.tunnel_api(tunnel)
            .patch(&tunnel.name_any(), &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
