use crate::{
    cloudflare::{
        RemoteConfigClient,
        TunnelProvisioner,
    },
    cluster::ClusterState,
    dns_records::DnsRecordSynchronizer,
    tunnel_config::TunnelConfigSynchronizer,
};
use std::{
    sync::Arc,
    time::Duration,
};

/// Holds state shared by the Ingress and tunnel controllers.
pub struct Context {
    pub cluster: Arc<dyn ClusterState>,
    pub provisioner: Arc<dyn TunnelProvisioner>,
    pub tunnel_config: TunnelConfigSynchronizer,
    pub dns_records: DnsRecordSynchronizer,
    /// Delay before a successfully reconciled object is looked at again.
    pub requeue_interval: Duration,
    /// Delay before retrying after a failed reconcile.
    pub error_requeue_interval: Duration,
}

impl Context {
    pub fn new<C>(
        cluster: Arc<dyn ClusterState>,
        cloudflare: Arc<C>,
        requeue_interval: Duration,
        error_requeue_interval: Duration,
    ) -> Self
    where
        C: RemoteConfigClient + TunnelProvisioner + 'static,
    {
        Self {
            cluster,
            provisioner: cloudflare.clone(),
            tunnel_config: TunnelConfigSynchronizer::new(cloudflare.clone()),
            dns_records: DnsRecordSynchronizer::new(cloudflare),
            requeue_interval,
            error_requeue_interval,
        }
    }
}
