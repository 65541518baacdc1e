#[macro_use]
extern crate tracing;

pub mod cloudflare;
pub mod cluster;
mod conditions;
pub mod context;
pub mod controller;
pub mod dns_records;
pub mod hosts;
pub mod origin;
pub mod reconcile;
pub mod resources;
pub mod rules;
#[cfg(test)]
pub(crate) mod testing;
pub mod tunnel;
pub mod tunnel_config;
