//! CNAME records pointing each routed hostname at its tunnel.

use crate::cloudflare::{
    DnsComment,
    DnsRecordParams,
    RemoteConfigClient,
    CNAME,
};
use eyre::Result;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        PoisonError,
    },
};
use tokio::sync::{
    Mutex,
    OwnedMutexGuard,
};
use tracing::instrument;

type HostLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Holds the lock of one hostname. Dropping the last holder removes the hostname from the map.
struct HostGuard<'a> {
    locks: &'a HostLocks,
    hostname: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for HostGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // every clone of the entry is taken under the map lock, so a count of one means nobody holds or waits for it
        if locks.get(&self.hostname).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.hostname);
        }
    }
}

/// Keeps the CNAME record of each host pointed at its tunnel.
///
/// Every operation looks the record up before acting on it. The lookup and the following create, update or delete
/// run under a lock for the hostname so that two reconciles never both see "absent" and both create.
pub struct DnsRecordSynchronizer {
    remote: Arc<dyn RemoteConfigClient>,
    host_locks: HostLocks,
}

impl DnsRecordSynchronizer {
    pub fn new(remote: Arc<dyn RemoteConfigClient>) -> Self {
        Self {
            remote,
            host_locks: Default::default(),
        }
    }

    async fn lock_host(&self, hostname: &str) -> HostGuard<'_> {
        let lock = {
            let mut locks = self.host_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(hostname.to_string()).or_default().clone()
        };
        let mut host = HostGuard {
            locks: &self.host_locks,
            hostname: hostname.to_string(),
            guard: None,
        };
        host.guard = Some(lock.lock_owned().await);
        host
    }

    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        self.host_locks.lock().unwrap().len()
    }

    /// Creates the record if it is missing, rewrites it if it points somewhere else.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_present(&self, tunnel_id: &str, hostname: &str) -> Result<()> {
        let _guard = self.lock_host(hostname).await;

        let params = DnsRecordParams::tunnel_cname(tunnel_id, hostname)?;
        match self.remote.get_dns_record(hostname, CNAME).await? {
            None => {
                info!(%hostname, %tunnel_id, "creating dns record");
                self.remote.create_dns_record(params).await?;
            }
            Some(record) if !record.is_healthy(tunnel_id) => {
                warn!(%hostname, id = %record.id, content = %record.content, "dns record points elsewhere, updating");
                self.remote.update_dns_record(&record.id, params).await?;
            }
            Some(_) => {
                trace!(%hostname, "dns record up to date");
            }
        }
        Ok(())
    }

    /// Deletes the record of `hostname` if there is one.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_absent(&self, tunnel_id: &str, hostname: &str) -> Result<()> {
        let _guard = self.lock_host(hostname).await;

        if let Some(record) = self.remote.get_dns_record(hostname, CNAME).await? {
            info!(%hostname, id = %record.id, "deleting dns record");
            self.remote.delete_dns_record(&record.id).await?;
        }
        Ok(())
    }

    /// Deletes every record carrying the management comment of `tunnel_id`. Only used when the tunnel itself goes
    /// away.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_all_managed(&self, tunnel_id: &str) -> Result<()> {
        let comment = DnsComment::new(tunnel_id).to_comment()?;
        let records = self.remote.list_dns_records_by_comment(CNAME, &comment).await?;

        info!(%tunnel_id, count = records.len(), "deleting managed dns records");
        for record in records {
            let _guard = self.lock_host(&record.name).await;
            self.remote.delete_dns_record(&record.id).await?;
        }
        Ok(())
    }
}
