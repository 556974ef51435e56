// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use packetwatch_collector::api::ApiServer;
use packetwatch_collector::broadcast::BroadcastService;
use packetwatch_collector::config::{CollectorEnv, ConfigWatcher};
use packetwatch_collector::ingest::IngestServer;
use packetwatch_collector::store::Store;
use packetwatch_collector::CollectorContext;

#[tokio::main]
pub async fn main() {
    let env = CollectorEnv::from_os_env();

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", env.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let watcher = ConfigWatcher::new(&env.config_path);
    let store = match Store::open(&env.database_path) {
        Ok(store) => store,
        Err(e) => {
            error!(
                "Error opening database {}: {e}",
                env.database_path.display()
            );
            return;
        }
    };
    info!("Database ready at {}", env.database_path.display());

    let shutdown = CancellationToken::new();

    let (broadcast_service, broadcast) = BroadcastService::new();
    let broadcast_task = tokio::spawn(broadcast_service.run(shutdown.clone()));

    let context = CollectorContext::new(store, watcher, broadcast);

    let (ingest_host, ingest_port) = context.config.ingest_addr();
    let ingest = match IngestServer::bind(&ingest_host, ingest_port) {
        Ok(ingest) => ingest,
        Err(e) => {
            error!("Error starting ingest listener: {e}");
            return;
        }
    };
    match ingest.local_addr() {
        Ok(addr) => info!("UDP ingest listening on {addr}"),
        Err(e) => debug!("Could not read ingest listener address: {e}"),
    }
    let workers = match ingest.spawn_workers(context.clone(), shutdown.clone()) {
        Ok(workers) => workers,
        Err(e) => {
            error!("Error starting ingest workers: {e}");
            return;
        }
    };

    let api_addr = SocketAddr::from(([0, 0, 0, 0], env.api_port));
    let server = match ApiServer::bind(api_addr).await {
        Ok(server) => server,
        Err(e) => {
            error!("Error binding API server on {api_addr}: {e}");
            return;
        }
    };
    info!("API server listening on {api_addr}");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = server.run(context.clone(), shutdown.clone()) => {
            // The accept loop only returns early on a fatal socket error.
            error!("API server stopped unexpectedly: {result:?}");
        }
    }

    shutdown.cancel();
    for worker in workers {
        if worker.join().is_err() {
            error!("Ingest worker panicked during shutdown");
        }
    }
    let _ = broadcast_task.await;
    info!("Collector stopped");
}
