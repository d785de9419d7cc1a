use clap::Parser;
use std::sync::Arc;

use hashpool::config::Config;
use hashpool::pow::EthashLight;
use hashpool::proxy::{http, stratum, ProxyServer};
use hashpool::storage::Storage;
use hashpool::upstream::{self, UpstreamSet};

#[derive(Parser)]
#[command(name = "hashpool", version)]
#[command(about = "Stratum and HTTP getwork proxy for Ethash mining pools")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: String,
    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<String>,
    /// Override the stratum listen address
    #[arg(long)]
    stratum_listen: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hashpool=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        cfg.proxy.listen = listen;
    }
    if let Some(listen) = cli.stratum_listen {
        cfg.proxy.stratum.listen = listen;
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(run(cfg));
}

async fn run(cfg: Config) {
    let storage = match Storage::open(&cfg.storage.path) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            tracing::error!("❌ Storage at {}: {}", cfg.storage.path, e);
            std::process::exit(1);
        }
    };
    let upstreams = match UpstreamSet::new(&cfg.upstream) {
        Ok(set) => Arc::new(set),
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "🚀 {} starting: {} upstreams, share difficulty {}",
        cfg.name,
        upstreams.len(),
        cfg.proxy.difficulty
    );

    let check_interval = cfg.upstream_check_interval();
    let stratum_enabled = cfg.proxy.stratum.enabled;
    let server = ProxyServer::new(cfg, storage, upstreams.clone(), Box::new(EthashLight));

    tokio::spawn(upstream::run_monitor(upstreams, check_interval));
    tokio::spawn(server.clone().run_refresh());
    tokio::spawn(server.clone().run_broadcaster());
    tokio::spawn(server.clone().run_state_updater());

    if stratum_enabled {
        let stratum_server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = stratum::run_stratum(stratum_server).await {
                tracing::error!("❌ {}", e);
                std::process::exit(1);
            }
        });
    }

    if let Err(e) = http::run_http(server).await {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}
