//! The tunnel's ingress rule table and the merge applied on every synchronization.
//!
//! Cloudflare rejects a configuration whose catch-all rule is not the last entry, so the table is kept keyed by
//! [`RuleHost`] and always materialized sorted: hostnames ascending, catch-all last.

use crate::{
    hosts::HostEntry,
    origin::{
        origin_request_config,
        OriginRequestConfig,
    },
    resources::TunnelSettings,
};
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use std::{
    collections::BTreeMap,
    net::{
        IpAddr,
        SocketAddr,
    },
};

/// Hostname of an ingress rule. Variant order matters: the derived `Ord` sorts `CatchAll` after every host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RuleHost {
    Host(String),
    #[default]
    CatchAll,
}

impl RuleHost {
    pub fn is_catch_all(&self) -> bool {
        matches!(self, RuleHost::CatchAll)
    }
}

impl From<&str> for RuleHost {
    fn from(hostname: &str) -> Self {
        if hostname.is_empty() {
            RuleHost::CatchAll
        } else {
            RuleHost::Host(hostname.to_string())
        }
    }
}

impl Serialize for RuleHost {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RuleHost::Host(hostname) => serializer.serialize_str(hostname),
            RuleHost::CatchAll => serializer.serialize_str(""),
        }
    }
}

impl<'de> Deserialize<'de> for RuleHost {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hostname = Option::<String>::deserialize(deserializer)?;
        Ok(hostname.as_deref().map_or(RuleHost::CatchAll, RuleHost::from))
    }
}

/// One entry of the tunnel's ingress configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "RuleHost::is_catch_all")]
    pub hostname: RuleHost,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequestConfig>,
}

impl IngressRule {
    pub fn catch_all(service: impl ToString) -> Self {
        IngressRule {
            hostname: RuleHost::CatchAll,
            path: String::new(),
            service: service.to_string(),
            origin_request: None,
        }
    }
}

/// What a merge does with the rules of the given hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Route the hosts to the load balancer at this address.
    Add(IpAddr),
    Remove,
}

/// Rules keyed by hostname. Iteration order is the order Cloudflare requires.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTable {
    rules: BTreeMap<RuleHost, IngressRule>,
}

impl RuleTable {
    /// Later rules win when `rules` contains the same hostname twice.
    pub fn from_rules(rules: impl IntoIterator<Item = IngressRule>) -> Self {
        RuleTable {
            rules: rules.into_iter().map(|rule| (rule.hostname.clone(), rule)).collect(),
        }
    }

    pub fn upsert(&mut self, rule: IngressRule) {
        self.rules.insert(rule.hostname.clone(), rule);
    }

    pub fn remove(&mut self, hostname: &str) -> Option<IngressRule> {
        self.rules.remove(&RuleHost::from(hostname))
    }

    pub fn get(&self, hostname: &str) -> Option<&IngressRule> {
        self.rules.get(&RuleHost::from(hostname))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Upserts (or deletes, for [`MergeMode::Remove`]) the rules of `hosts` and re-asserts the catch-all rule.
    pub fn merge(&mut self, mode: MergeMode, hosts: &[HostEntry], settings: &TunnelSettings) {
        for host in hosts {
            match mode {
                MergeMode::Add(ip) => self.upsert(IngressRule {
                    hostname: RuleHost::Host(host.hostname.clone()),
                    path: String::new(),
                    service: endpoint(ip, host.tls),
                    origin_request: Some(origin_request_config(settings, &host.hostname)),
                }),
                MergeMode::Remove => {
                    self.remove(&host.hostname);
                }
            }
        }
        self.upsert(IngressRule::catch_all(&settings.catch_all_rule));
    }

    /// Sorted rules, catch-all last.
    pub fn into_rules(self) -> Vec<IngressRule> {
        self.rules.into_values().collect()
    }
}

/// The service url cloudflared forwards a host to.
pub fn endpoint(ip: IpAddr, tls: bool) -> String {
    if tls {
        format!("https://{}", SocketAddr::new(ip, 443))
    } else {
        format!("http://{}", SocketAddr::new(ip, 80))
    }
}
