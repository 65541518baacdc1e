use crate::{
    conditions::{
        error_condition,
        success_condition,
        upsert_condition,
    },
    cloudflare::RemoteTunnel,
    context::Context,
    reconcile::ReconcileError,
    resources::CloudflareTunnel,
};
use base64::{
    engine::general_purpose::STANDARD,
    Engine as _,
};
use kube::{
    runtime::controller::Action,
    ResourceExt as _,
};
use rand::{
    distributions::Alphanumeric,
    Rng as _,
};
use tracing::instrument;

/// Finalizer keeping a CloudflareTunnel around until the remote tunnel and its DNS records are deleted.
pub const TUNNEL_FINALIZER: &str = "tunnel.cloudflare.com/delete-tunnel";

const SECRET_LENGTH: usize = 32;

/// Creates the remote tunnel on first sight, then keeps the status and the default label up to date.
#[instrument(level = "debug", skip_all)]
pub async fn apply(tunnel: &CloudflareTunnel, ctx: &Context) -> Result<Action, ReconcileError> {
    let name = tunnel.metadata.name.as_deref().ok_or(ReconcileError::MissingName)?;
    let ns = tunnel.namespace().unwrap_or_default();
    info!("reconcile request: CloudflareTunnel {ns}/{name}");

    let mut status = tunnel.status.clone().unwrap_or_default();
    let result = match tunnel.tunnel_id() {
        Some(_) => Ok(()),
        None => ensure_remote_tunnel(&format!("{ns}-{name}"), ctx).await.map(|remote| {
            info!("using tunnel {} ({}) for CloudflareTunnel {ns}/{name}", remote.name, remote.id);
            status.tunnel_id = Some(remote.id);
            status.tunnel_name = Some(remote.name);
        }),
    };

    let generation = tunnel.metadata.generation;
    let condition = match &result {
        Ok(()) => success_condition(tunnel, generation),
        Err(err) => error_condition(tunnel, "TunnelCreationFailed", format!("{err:#}"), generation),
    };
    upsert_condition(status.conditions.get_or_insert_with(Vec::new), condition);
    ctx.cluster.patch_tunnel_status(tunnel, &status).await?;
    result?;

    if !tunnel.default_label_in_sync() {
        debug!("setting default label of CloudflareTunnel {ns}/{name} to {}", tunnel.spec.default);
        ctx.cluster.set_tunnel_default_label(tunnel, tunnel.spec.default).await?;
    }

    Ok(Action::requeue(ctx.requeue_interval))
}

/// Adopts the remote tunnel called `remote_name` or creates it. A tunnel created by an earlier reconcile whose status
/// update was lost is found by name instead of being created a second time.
async fn ensure_remote_tunnel(remote_name: &str, ctx: &Context) -> eyre::Result<RemoteTunnel> {
    if let Some(remote) = ctx.provisioner.find_tunnel(remote_name).await? {
        return Ok(remote);
    }
    ctx.provisioner.create_tunnel(remote_name, &tunnel_secret()).await
}

/// Base64 of a random alphanumeric string drawn from a cryptographically secure generator.
fn tunnel_secret() -> String {
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect();
    STANDARD.encode(secret)
}

/// Runs before the finalizer is removed. Deletes every DNS record the tunnel owns, then the tunnel.
#[instrument(level = "debug", skip_all)]
pub async fn cleanup(tunnel: &CloudflareTunnel, ctx: &Context) -> Result<Action, ReconcileError> {
    let ns = tunnel.namespace().unwrap_or_default();
    let name = tunnel.name_any();
    info!("delete request: CloudflareTunnel {ns}/{name}");

    let Some(tunnel_id) = tunnel.tunnel_id() else {
        info!("CloudflareTunnel {ns}/{name} was never created remotely");
        return Ok(Action::await_change());
    };

    ctx.dns_records.delete_all_managed(tunnel_id).await?;
    ctx.provisioner.delete_tunnel(tunnel_id).await?;

    Ok(Action::await_change())
}
