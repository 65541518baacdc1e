#[macro_use]
extern crate tracing;

use clap::Parser;
use cloudflare_tunnel_operator::{
    cloudflare::{
        api::CloudflareApi,
        DnsComment,
        RemoteConfigClient as _,
        CNAME,
    },
    cluster::KubeCluster,
    context::Context,
    controller,
    resources,
};
use eyre::Result;
use kube::CustomResourceExt as _;
use std::{
    sync::Arc,
    time::Duration,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
enum Args {
    /// Print the CloudflareTunnel CRD
    Crds,
    Controller(ArgsController),
    /// List the DNS records owned by a tunnel
    ListManagedRecords(ArgsListManagedRecords),
}

#[derive(clap::Args)]
struct ArgsCloudflare {
    #[clap(long, env = "CLOUDFLARE_API_TOKEN", help = "Cloudflare API token")]
    cloudflare_api_token: String,

    #[clap(long, env = "CLOUDFLARE_ACCOUNT_ID", help = "Account owning the tunnels")]
    cloudflare_account_id: String,

    #[clap(long, env = "CLOUDFLARE_ZONE_ID", help = "Zone the DNS records are created in")]
    cloudflare_zone_id: String,
}

impl ArgsCloudflare {
    fn api(&self) -> CloudflareApi {
        CloudflareApi::new(
            &self.cloudflare_api_token,
            &self.cloudflare_account_id,
            &self.cloudflare_zone_id,
        )
    }
}

#[derive(Parser)]
struct ArgsController {
    #[clap(flatten)]
    cloudflare: ArgsCloudflare,

    #[clap(
        long,
        env = "REQUEUE_INTERVAL",
        help = "How often reconciled objects are checked again",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    requeue_interval: Duration,

    #[clap(
        long,
        env = "ERROR_REQUEUE_INTERVAL",
        help = "Delay before retrying a reconcile that failed on an api call",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    error_requeue_interval: Duration,
}

#[derive(Parser)]
struct ArgsListManagedRecords {
    #[clap(flatten)]
    cloudflare: ArgsCloudflare,

    tunnel_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Args::parse() {
        Args::Crds => {
            let yaml = serde_yaml::to_string(&resources::CloudflareTunnel::crd()).expect("Failed to serialize CRD");
            print!("{yaml}")
        }
        Args::Controller(args) => {
            run_controller(args).await?;
        }
        Args::ListManagedRecords(args) => {
            let comment = DnsComment::new(&args.tunnel_id).to_comment()?;
            let records = args.cloudflare.api().list_dns_records_by_comment(CNAME, &comment).await?;
            for record in records {
                println!("{}\t{}\t{}", record.id, record.name, record.content);
            }
        }
    }

    Ok(())
}

async fn run_controller(
    ArgsController {
        cloudflare,
        requeue_interval,
        error_requeue_interval,
    }: ArgsController,
) -> Result<()> {
    let client = kube::Client::try_default().await?;

    let context = Context::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(cloudflare.api()),
        requeue_interval,
        error_requeue_interval,
    );

    info!("Starting controllers");

    controller::run(client, context).await;

    info!("Controllers stopped");

    Ok(())
}
