// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP ingest listener.
//!
//! Agents fire one datagram per observed packet and never expect a reply,
//! so this is a one-way protocol: malformed datagrams are dropped without a
//! response, and per-record failures roll back that record only. The
//! workers are plain threads because persistence and detection are
//! blocking; the async side is reached only through the broadcast handle.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use packetwatch_wire::{BroadcastEnvelope, TelemetryRecord};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::detect::PORT_SCAN_EVENT;
use crate::CollectorContext;

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_535;
/// Poll interval for the shutdown flag while the socket is idle.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);
/// Number of worker threads sharing the listener socket.
const WORKER_COUNT: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Binding the listener socket failed.
    #[error("failed to bind udp listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// Applying the read timeout failed.
    #[error("failed to configure udp listener: {0}")]
    Configure(#[source] io::Error),
    /// Duplicating the socket for a worker failed.
    #[error("failed to clone udp listener socket: {0}")]
    Clone(#[source] io::Error),
    /// Spawning a worker thread failed.
    #[error("failed to spawn ingest worker: {0}")]
    Spawn(#[source] io::Error),
}

/// Bound UDP listener, not yet serving.
#[derive(Debug)]
pub struct IngestServer {
    socket: UdpSocket,
}

impl IngestServer {
    /// Binds the listener on the configured ingest address.
    pub fn bind(host: &str, port: u16) -> Result<Self, IngestError> {
        let addr = format!("{host}:{port}");
        let socket = UdpSocket::bind(&addr).map_err(|source| IngestError::Bind {
            addr: addr.clone(),
            source,
        })?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(IngestError::Configure)?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts the worker threads, each with its own clone of the socket.
    pub fn spawn_workers(
        self,
        context: CollectorContext,
        shutdown: CancellationToken,
    ) -> Result<Vec<thread::JoinHandle<()>>, IngestError> {
        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for i in 0..WORKER_COUNT {
            let socket = self.socket.try_clone().map_err(IngestError::Clone)?;
            let context = context.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("pw-ingest-{i}"))
                .spawn(move || worker_loop(&socket, &context, &shutdown))
                .map_err(IngestError::Spawn)?;
            workers.push(handle);
        }
        Ok(workers)
    }
}

fn worker_loop(socket: &UdpSocket, context: &CollectorContext, shutdown: &CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !shutdown.is_cancelled() {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                error!("Ingest socket read failed: {e}");
                return;
            }
        };
        handle_datagram(&buf[..len], peer.ip(), context);
    }
    debug!("Ingest worker stopped");
}

/// Processes one datagram end to end: decode, score, persist, publish.
/// Detection and the write share the store lock so a concurrent reset can
/// never interleave between them.
pub fn handle_datagram(data: &[u8], source: IpAddr, context: &CollectorContext) {
    let record = match TelemetryRecord::from_datagram(data) {
        Ok(record) => record,
        Err(_) => return,
    };

    let blacklist = context.config.blacklist();
    let display_name = context.config.agent_name(source);

    let verdict;
    let agent_id;
    {
        let mut store = context.store.lock().unwrap_or_else(|e| e.into_inner());
        verdict = context.detector.evaluate(source, &record, &blacklist);
        agent_id = match store.commit_record(source, &display_name, &record, verdict) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to persist record from {source}: {e}");
                return;
            }
        };
    }

    if verdict.blacklist_hit {
        warn!(
            "Blacklisted destination {} contacted by {source}",
            record.destination_ip
        );
    }
    if verdict.port_scan {
        warn!(
            "Port scan suspected from {source} against {}",
            record.destination_ip
        );
    }

    context.broadcast.publish(BroadcastEnvelope {
        agent_id,
        alert: verdict.alert(),
        security_event: verdict.port_scan.then(|| PORT_SCAN_EVENT.to_string()),
        record,
    });
}
