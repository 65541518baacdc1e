//! Read-modify-write of a tunnel's remote ingress rules.

use crate::{
    cloudflare::RemoteConfigClient,
    hosts::HostEntry,
    resources::TunnelSettings,
    rules::{
        MergeMode,
        RuleTable,
    },
};
use eyre::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

/// Serializes read-modify-write cycles of tunnel configurations.
///
/// The configuration endpoint only supports replacing the whole document and has no version check, so two
/// reconciles interleaving their GET and PUT would drop one of the updates. All updates in this process go through
/// one lock. It does not protect against other writers, e.g. a second operator replica.
pub struct TunnelConfigSynchronizer {
    remote: Arc<dyn RemoteConfigClient>,
    lock: Mutex<()>,
}

impl TunnelConfigSynchronizer {
    pub fn new(remote: Arc<dyn RemoteConfigClient>) -> Self {
        Self {
            remote,
            lock: Mutex::new(()),
        }
    }

    /// Adds or removes the rules of `hosts` in the configuration of `tunnel_id`. Always writes the configuration
    /// back, even when nothing changed.
    #[instrument(level = "debug", skip(self, hosts, settings))]
    pub async fn synchronize(
        &self,
        tunnel_id: &str,
        hosts: &[HostEntry],
        settings: &TunnelSettings,
        mode: MergeMode,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut config = self.remote.get_tunnel_configuration(tunnel_id).await?;

        let mut table = RuleTable::from_rules(std::mem::take(&mut config.ingress));
        table.merge(mode, hosts, settings);
        config.ingress = table.into_rules();

        debug!(%tunnel_id, ?mode, hosts = hosts.len(), rules = config.ingress.len(), "writing tunnel configuration");
        self.remote.update_tunnel_configuration(tunnel_id, config).await?;

        Ok(())
    }
}
