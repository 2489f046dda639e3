//! CF FaaS entry point.
//!
//! One binary, two roles:
//!
//! ```bash
//! # Long-running dispatcher instance (the platform's web process)
//! cffaas dispatcher
//!
//! # Short-lived worker task launched from the same droplet
//! cffaas worker
//! ```
//!
//! Both roles read their configuration from the environment the platform
//! injects; see `config` for the variables involved.

mod config;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use argh::FromArgs;
use tracing::info;

use cffaas_capi::CapiClient;
use cffaas_common::platform::{InstanceLister, PackageClient, TaskCreator};
use cffaas_dispatcher::groupcache::{GroupCachePool, PeerManager};
use cffaas_dispatcher::manifest::Resolver;
use cffaas_dispatcher::server;
use cffaas_dispatcher::worker_pool::PoolConfig;
use cffaas_dispatcher::{HotSwap, RequestRelayer, RouterBuilder, WorkerPool};
use cffaas_worker::{PackageManager, Runner, Scheduler, ShellExecutor};

use config::{DispatcherConfig, WorkerConfig};

/// How often the response-cache peer set and the worker's package mappings
/// refresh.
const REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Per-poll deadline of the worker loop; must exceed the pool's 30 s
/// blocking window.
const POLL_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(FromArgs)]
/// CF FaaS - user commands behind declarative HTTP routes
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Dispatcher(DispatcherArgs),
    Worker(WorkerArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "dispatcher")]
/// serve the declared routes (configured via environment)
struct DispatcherArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
/// poll for parked work and execute it (configured via environment)
struct WorkerArgs {}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli: Cli = argh::from_env();
    match cli.command {
        Commands::Dispatcher(_) => run_dispatcher().await,
        Commands::Worker(_) => run_worker().await,
    }
}

fn nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

fn http_client(skip_ssl_validation: bool) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .danger_accept_invalid_certs(skip_ssl_validation)
        .build()?)
}

async fn run_dispatcher() -> Result<()> {
    info!("starting CF FaaS dispatcher");

    let cfg = DispatcherConfig::from_env()?;
    let http = http_client(cfg.skip_ssl_validation)?;

    let capi = Arc::new(CapiClient::new(
        cfg.vcap.capi_http(),
        cfg.vcap.application_id.clone(),
        cfg.vcap.space_id.clone(),
        http.clone(),
    ));

    let external_addr = cfg.vcap.external_addr();
    let internal_id = format!("{}{}", rand::random::<u64>(), nanos());

    let groupcache = GroupCachePool::new(
        external_addr.clone(),
        cfg.vcap.application_id.clone(),
        cfg.instance_index,
        http.clone(),
    );
    let _peer_refresh = PeerManager::new(
        groupcache.clone(),
        capi.clone() as Arc<dyn InstanceLister>,
        cfg.vcap.application_id.clone(),
        REFRESH_INTERVAL,
    )
    .spawn();

    let relayer = Arc::new(RequestRelayer::new(
        external_addr.clone(),
        format!("{}/relayer", internal_id),
    ));
    let pool_path = format!("/{}/pool/{}{}", internal_id, rand::random::<u64>(), nanos());
    let pool = WorkerPool::new(
        PoolConfig::default(),
        cfg.task_command.clone(),
        capi.clone() as Arc<dyn TaskCreator>,
    );

    let builder = RouterBuilder::new(
        cfg.vcap.application_name.clone(),
        groupcache,
        relayer,
        pool,
        pool_path,
    );

    let resolver = Resolver::new(cfg.resolver_urls.clone(), http.clone());

    // Serve the bootstrap routes immediately; the real manifest may need
    // slow plugin round-trips to resolve.
    let bootstrap_functions = resolver.resolve(&cfg.bootstrap_manifest).await?;
    let hot_swap = Arc::new(HotSwap::new(builder.build(&bootstrap_functions)?));

    {
        let hot_swap = hot_swap.clone();
        let manifest = cfg.manifest.clone();
        tokio::spawn(async move {
            match resolver.resolve(&manifest).await {
                Ok(functions) => match builder.build(&functions) {
                    Ok(tree) => {
                        hot_swap.swap(tree);
                        info!(routes = functions.len(), "installed resolved manifest");
                    }
                    Err(e) => tracing::error!(error = %e, "failed to build resolved router"),
                },
                Err(e) => tracing::error!(error = %e, "failed to resolve manifest"),
            }
        });
    }

    if let Some(health_port) = cfg.health_port {
        let addr: SocketAddr = ([0, 0, 0, 0], health_port).into();
        let listener = server::bind(addr).await?;
        tokio::spawn(server::serve_health(listener));
    }

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = server::bind(addr).await?;
    server::serve(listener, hot_swap).await?;

    info!("closing CF FaaS dispatcher");
    Ok(())
}

async fn run_worker() -> Result<()> {
    info!("starting CF FaaS worker");

    let cfg = WorkerConfig::from_env()?;
    let http = http_client(false)?;

    let capi = Arc::new(CapiClient::new(
        cfg.vcap.capi_http(),
        cfg.vcap.application_id.clone(),
        cfg.vcap.space_id.clone(),
        http.clone(),
    ));

    let packages = PackageManager::new(
        cfg.app_names.clone(),
        REFRESH_INTERVAL,
        cfg.data_dir.clone(),
        capi as Arc<dyn PackageClient>,
        http.clone(),
    );

    let base_env = HashMap::from([
        ("HTTP_PROXY".to_string(), cfg.http_proxy.clone()),
        ("X_CF_APP_INSTANCE".to_string(), cfg.app_instance.clone()),
        ("VCAP_APPLICATION".to_string(), cfg.vcap_raw.clone()),
    ]);

    let runner = Arc::new(Runner::new(
        Arc::new(packages),
        Arc::new(ShellExecutor::default()),
        base_env,
        http.clone(),
    ));

    Scheduler::new(
        cfg.pool_addr.clone(),
        cfg.app_instance.clone(),
        POLL_TIMEOUT,
        runner,
        http,
    )
    .run()
    .await;

    info!("closing CF FaaS worker");
    Ok(())
}
