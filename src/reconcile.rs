//! Reconciles one Ingress against its tunnel: routes its hosts through the tunnel configuration and points their
//! DNS records at the tunnel, or undoes both when the Ingress is ignored or deleted.

use crate::{
    context::Context,
    hosts::{
        HostEntry,
        IngressExt as _,
    },
    resources::{
        CloudflareTunnel,
        TunnelSettings,
    },
    rules::MergeMode,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    runtime::controller::Action,
    ResourceExt as _,
};
use std::net::IpAddr;
use tracing::instrument;

/// Finalizer keeping an Ingress around until its hosts are removed from the tunnel.
pub const INGRESS_FINALIZER: &str = "tunnel.cloudflare.com/cleanup-ingress";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Cloudflare(#[from] eyre::Report),

    #[error("no tunnel is labelled tunnel.cloudflare.com/default=true")]
    NoDefaultTunnel,

    #[error("more than one tunnel is labelled as default: {0:?}")]
    AmbiguousDefaultTunnel(Vec<String>),

    #[error("invalid tunnel reference {0:?}, expected namespace/name")]
    InvalidTunnelReference(String),

    #[error("tunnel {0} not found")]
    TunnelNotFound(String),

    #[error("tunnel {0} is being deleted")]
    TunnelDeleting(String),

    #[error("tunnel {0} has no tunnel id yet")]
    MissingTunnelId(String),

    #[error("ingress {0} has no load balancer ip")]
    MissingLoadBalancerIp(String),

    #[error("object has no name")]
    MissingName,
}

impl ReconcileError {
    /// Errors that only go away once somebody changes the cluster. Failed api calls and preconditions that the
    /// operator or the ingress controller will satisfy on their own are not.
    pub fn is_configuration_error(&self) -> bool {
        !matches!(
            self,
            ReconcileError::Kube(_)
                | ReconcileError::Cloudflare(_)
                | ReconcileError::TunnelDeleting(_)
                | ReconcileError::MissingTunnelId(_)
                | ReconcileError::MissingLoadBalancerIp(_)
        )
    }
}

/// Where an Ingress stands in the finalizer protocol.
#[derive(Debug, PartialEq)]
enum IngressAction {
    /// Deleted without our finalizer, nothing left to do.
    Forget,
    Cleanup,
    AddFinalizer,
    Sync,
}

impl From<&Ingress> for IngressAction {
    fn from(ingress: &Ingress) -> Self {
        let finalized = ingress.finalizers().iter().any(|f| f == INGRESS_FINALIZER);
        match (ingress.metadata.deletion_timestamp.is_some(), finalized) {
            (true, true) => IngressAction::Cleanup,
            (true, false) => IngressAction::Forget,
            (false, false) => IngressAction::AddFinalizer,
            (false, true) => IngressAction::Sync,
        }
    }
}

#[instrument(level = "debug", skip(ctx))]
pub async fn reconcile_ingress(namespace: &str, name: &str, ctx: &Context) -> Result<Action, ReconcileError> {
    let Some(ingress) = ctx.cluster.get_ingress(namespace, name).await? else {
        debug!("ingress {namespace}/{name} is gone");
        return Ok(Action::await_change());
    };

    match IngressAction::from(&ingress) {
        IngressAction::Forget => Ok(Action::await_change()),
        IngressAction::Cleanup => {
            info!("delete request: Ingress {namespace}/{name}");
            cleanup(&ingress, ctx).await?;
            ctx.cluster.remove_ingress_finalizer(&ingress, INGRESS_FINALIZER).await?;
            Ok(Action::await_change())
        }
        IngressAction::AddFinalizer => {
            ctx.cluster.add_ingress_finalizer(&ingress, INGRESS_FINALIZER).await?;
            apply(&ingress, ctx).await
        }
        IngressAction::Sync => apply(&ingress, ctx).await,
    }
}

async fn apply(ingress: &Ingress, ctx: &Context) -> Result<Action, ReconcileError> {
    let key = ingress_key(ingress);
    let tunnel = resolve_tunnel(ingress, ctx).await?;
    let tunnel_key = tunnel_key(&tunnel);

    if tunnel.is_deleting() {
        return Err(ReconcileError::TunnelDeleting(tunnel_key));
    }
    let tunnel_id = tunnel
        .tunnel_id()
        .ok_or_else(|| ReconcileError::MissingTunnelId(tunnel_key.clone()))?;
    let ip = ingress
        .load_balancer_ip()
        .ok_or_else(|| ReconcileError::MissingLoadBalancerIp(key.clone()))?;

    let hosts = ingress.host_entries();
    if ingress.is_ignored() {
        info!("Ingress {key} is ignored, removing {} host(s) from tunnel {tunnel_key}", hosts.len());
        remove_hosts(tunnel_id, &hosts, &tunnel.spec.settings, ctx).await?;
    } else {
        info!("routing {} host(s) of Ingress {key} through tunnel {tunnel_key}", hosts.len());
        add_hosts(tunnel_id, &hosts, &tunnel.spec.settings, ip, ctx).await?;
    }

    Ok(Action::requeue(ctx.requeue_interval))
}

/// Runs before the finalizer is removed. Does nothing when the tunnel the hosts were routed through no longer
/// exists, is going away itself or was never created.
async fn cleanup(ingress: &Ingress, ctx: &Context) -> Result<(), ReconcileError> {
    let key = ingress_key(ingress);
    let tunnel = match resolve_tunnel(ingress, ctx).await {
        Ok(tunnel) => tunnel,
        Err(err @ (ReconcileError::TunnelNotFound(_) | ReconcileError::NoDefaultTunnel)) => {
            warn!("skipping cleanup of Ingress {key}: {err}");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    if tunnel.is_deleting() {
        info!("skipping cleanup of Ingress {key}, tunnel {} is being deleted", tunnel_key(&tunnel));
        return Ok(());
    }
    let Some(tunnel_id) = tunnel.tunnel_id() else {
        info!("skipping cleanup of Ingress {key}, tunnel {} has no id", tunnel_key(&tunnel));
        return Ok(());
    };

    remove_hosts(tunnel_id, &ingress.host_entries(), &tunnel.spec.settings, ctx).await
}

async fn add_hosts(
    tunnel_id: &str,
    hosts: &[HostEntry],
    settings: &TunnelSettings,
    ip: IpAddr,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    ctx.tunnel_config
        .synchronize(tunnel_id, hosts, settings, MergeMode::Add(ip))
        .await?;
    for host in hosts {
        ctx.dns_records.ensure_present(tunnel_id, &host.hostname).await?;
    }
    Ok(())
}

async fn remove_hosts(
    tunnel_id: &str,
    hosts: &[HostEntry],
    settings: &TunnelSettings,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    ctx.tunnel_config
        .synchronize(tunnel_id, hosts, settings, MergeMode::Remove)
        .await?;
    for host in hosts {
        ctx.dns_records.ensure_absent(tunnel_id, &host.hostname).await?;
    }
    Ok(())
}

/// The tunnel named by the Ingress annotation, else the single default tunnel.
async fn resolve_tunnel(ingress: &Ingress, ctx: &Context) -> Result<CloudflareTunnel, ReconcileError> {
    if let Some(reference) = ingress.tunnel_ref().map_err(ReconcileError::InvalidTunnelReference)? {
        return ctx
            .cluster
            .get_tunnel(&reference.namespace, &reference.name)
            .await?
            .ok_or_else(|| ReconcileError::TunnelNotFound(reference.to_string()));
    }

    let mut defaults = ctx.cluster.default_tunnels().await?;
    match defaults.len() {
        0 => Err(ReconcileError::NoDefaultTunnel),
        1 => Ok(defaults.remove(0)),
        _ => Err(ReconcileError::AmbiguousDefaultTunnel(
            defaults.iter().map(tunnel_key).collect(),
        )),
    }
}

/// Requeue delay after a failed reconcile. Configuration errors are retried at the regular interval since they
/// need a change in the cluster first.
pub fn error_action(err: &ReconcileError, ctx: &Context) -> Action {
    if err.is_configuration_error() {
        warn!("reconcile failed: {err}");
        Action::requeue(ctx.requeue_interval)
    } else {
        error!("reconcile failed: {err:?}");
        Action::requeue(ctx.error_requeue_interval)
    }
}

fn ingress_key(ingress: &Ingress) -> String {
    format!("{}/{}", ingress.namespace().unwrap_or_default(), ingress.name_any())
}

fn tunnel_key(tunnel: &CloudflareTunnel) -> String {
    format!("{}/{}", tunnel.namespace().unwrap_or_default(), tunnel.name_any())
}
