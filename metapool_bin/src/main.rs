// Copyright (C) 2025, 2026 Metapool Developers (see AUTHORS)
//
// This file is part of Metapool
//
// Metapool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Metapool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Metapool. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use metapool_lib::config::{parse_duration, Config, LoggingConfig};
use metapool_lib::payouts::unlocker::BlockUnlocker;
use metapool_lib::store::Store;
use mvsdrpc::MvsdRpcClient;
use std::error::Error;
use std::fs::File;
use std::sync::Arc;
use stratum::handlers::{AllowAllPolicy, PoolHandler};
use stratum::pow::EthashSeal;
use stratum::processor::ShareProcessor;
use stratum::refresher::run_refresher;
use stratum::server::StratumServer;
use stratum::template::TemplateCache;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return Err(format!("Failed to load config: {}", e).into());
        }
    };
    setup_logging(&config.logging)?;
    info!("Starting Metapool...");

    let store = Arc::new(Store::new(config.store.path.clone())?);

    let upstream = Arc::new(MvsdRpcClient::new(
        &config.upstream.name,
        &config.upstream.url,
        &config.upstream.account,
        &config.upstream.password,
        parse_duration(&config.upstream.timeout)?,
    )?);

    let cache = Arc::new(TemplateCache::new());
    let (refresh_tx, refresh_rx) = mpsc::channel(4);
    let (jobs_tx, _) = broadcast::channel(16);

    let refresh_interval = parse_duration(&config.proxy.template_refresh_interval)?;
    tokio::spawn(run_refresher(
        upstream.clone(),
        cache.clone(),
        refresh_interval,
        refresh_rx,
        jobs_tx.clone(),
    ));

    let processor = ShareProcessor::new(
        upstream.clone(),
        store.clone(),
        EthashSeal,
        config.proxy.stratum.clone(),
        config.hashrate_window(),
        refresh_tx,
    );
    let handler = Arc::new(PoolHandler::new(
        processor,
        cache.clone(),
        upstream.clone(),
        AllowAllPolicy,
    ));

    let mut shutdown_senders = Vec::new();
    for (stratum_index, port_config) in config.proxy.stratum.iter().enumerate() {
        if !port_config.enabled {
            continue;
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        shutdown_senders.push(shutdown_tx);
        let mut server = StratumServer::new(
            port_config.clone(),
            stratum_index,
            handler.clone(),
            shutdown_rx,
            jobs_tx.clone(),
        );
        let name = port_config.name.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(None).await {
                error!("Stratum endpoint {} failed: {}", name, e);
            }
        });
    }

    if config.unlocker.enabled {
        let interval = parse_duration(&config.unlocker.interval)?;
        let unlocker = Arc::new(BlockUnlocker::from_config(
            config.unlocker.clone(),
            store.clone(),
        )?);
        info!("Starting block unlocker");
        tokio::spawn(unlocker.run(interval));
    }

    // Expired hashrate rows and share fingerprints get swept on the same
    // cadence they age out on.
    let purge_interval = config.hashrate_window();
    let purge_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_interval);
        loop {
            ticker.tick().await;
            match purge_store.purge_expired() {
                Ok(purged) if purged > 0 => debug!("Purged {purged} expired share rows"),
                Ok(_) => {}
                Err(e) => error!("Failed to purge expired share rows: {e}"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    for shutdown_tx in shutdown_senders {
        shutdown_tx.send(()).ok();
    }
    Ok(())
}

/// Sets up logging according to the logging configuration
fn setup_logging(logging_config: &LoggingConfig) -> Result<(), Box<dyn Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging_config.level));

    let registry = Registry::default().with(filter);

    if logging_config.console {
        registry.with(fmt::layer()).init();
    } else if let Some(file_path) = &logging_config.file {
        if let Some(parent) = std::path::Path::new(file_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(file_path)?;
        let file_layer = fmt::layer().with_writer(file).with_ansi(false);
        registry.with(file_layer).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    debug!("Logging initialized with config: {:?}", logging_config);
    Ok(())
}
