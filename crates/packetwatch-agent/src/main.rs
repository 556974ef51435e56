// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use packetwatch_agent::capture::{Sniffer, QUEUE_CAPACITY};
use packetwatch_agent::config::AgentEnv;
use packetwatch_agent::identity;
use packetwatch_agent::pipeline::Pipeline;

#[tokio::main]
pub async fn main() {
    let env = AgentEnv::from_os_env();

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

    let local_ip = identity::local_ip();
    info!(
        "Starting packetwatch agent, local endpoint {local_ip}, collector {}:{}",
        env.collector_host, env.collector_port
    );

    let collector = match resolve_collector(&env.collector_host, env.collector_port) {
        Ok(addr) => addr,
        Err(e) => {
            error!(
                "Unable to resolve collector address {}:{}: {e}",
                env.collector_host, env.collector_port
            );
            return;
        }
    };

    // Open the device before spawning anything so privilege problems
    // surface as a clean startup failure.
    let sniffer = match Sniffer::open(env.capture_interface.as_deref()) {
        Ok(sniffer) => sniffer,
        Err(e) => {
            error!("Error starting capture: {e}");
            return;
        }
    };

    let pipeline = match Pipeline::new(local_ip, collector, env.geo_api_base.clone()).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Error starting pipeline: {e}");
            return;
        }
    };

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

    let capture_shutdown = shutdown.clone();
    let capture_thread = match std::thread::Builder::new()
        .name("pw-capture".to_string())
        .spawn(move || sniffer.run(tx, capture_shutdown))
    {
        Ok(handle) => handle,
        Err(e) => {
            error!("Error spawning capture thread: {e}");
            return;
        }
    };

    let mut pipeline_task = tokio::spawn(pipeline.run(rx, shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = &mut pipeline_task => {
            // The pipeline only stops on its own when capture has died.
            error!("Pipeline stopped unexpectedly: {result:?}");
        }
    }

    shutdown.cancel();
    if !pipeline_task.is_finished() {
        let _ = pipeline_task.await;
    }
    if capture_thread.join().is_err() {
        error!("Capture thread panicked during shutdown");
    }
    info!("Agent stopped");
}

/// Resolves the collector host to a concrete socket address, so DNS names
/// work in container deployments.
fn resolve_collector(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found for collector"))
}
