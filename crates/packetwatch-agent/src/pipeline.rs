// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Enrichment pipeline between capture and the collector.
//!
//! Consumes observations from the capture thread, classifies direction
//! against the endpoint's own address, enriches with country and process
//! name, and ships each record as one UDP datagram.

use std::net::{IpAddr, SocketAddr};

use packetwatch_wire::{Direction, TelemetryRecord};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::capture::{format_mac, Observation};
use crate::enrich::{GeoResolver, SoftwareResolver};

/// Error surfaced while building or running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The transmit socket could not be bound.
    #[error("failed to bind telemetry socket: {0}")]
    Bind(#[source] std::io::Error),
    /// The geo lookup client could not be constructed.
    #[error("failed to build geo lookup client: {0}")]
    GeoClient(#[from] reqwest::Error),
    /// A record could not be encoded.
    #[error("failed to encode telemetry: {0}")]
    Encode(#[from] serde_json::Error),
    /// A datagram could not be handed to the network stack.
    #[error("failed to send telemetry: {0}")]
    Transmit(#[source] std::io::Error),
}

/// Direction, peer address and peer-side port of an observation, relative
/// to the endpoint's own address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classified {
    pub direction: Direction,
    pub target_ip: IpAddr,
    pub port: u16,
    pub peer_mac: [u8; 6],
}

/// Classifies an observation against the endpoint address.
///
/// Traffic not sourced from `local_ip` counts as inbound, which covers
/// third-party frames seen in promiscuous mode as well.
pub fn classify(observation: &Observation, local_ip: IpAddr) -> Classified {
    if IpAddr::V4(observation.src_ip) == local_ip {
        Classified {
            direction: Direction::Outbound,
            target_ip: IpAddr::V4(observation.dst_ip),
            port: observation.dst_port,
            peer_mac: observation.dst_mac,
        }
    } else {
        Classified {
            direction: Direction::Inbound,
            target_ip: IpAddr::V4(observation.src_ip),
            port: observation.src_port,
            peer_mac: observation.src_mac,
        }
    }
}

pub struct Pipeline {
    local_ip: IpAddr,
    collector: SocketAddr,
    socket: UdpSocket,
    geo: GeoResolver,
    software: SoftwareResolver,
}

impl Pipeline {
    /// Binds the transmit socket and prepares the resolvers.
    pub async fn new(
        local_ip: IpAddr,
        collector: SocketAddr,
        geo_api_base: String,
    ) -> Result<Self, PipelineError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(PipelineError::Bind)?;
        let geo = GeoResolver::new(geo_api_base)?;
        Ok(Self {
            local_ip,
            collector,
            socket,
            geo,
            software: SoftwareResolver::default(),
        })
    }

    /// Consumes observations until the capture channel closes or shutdown
    /// fires. Transmit failures drop the packet and keep the loop running.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Observation>, shutdown: CancellationToken) {
        info!("Pipeline started, shipping to {}", self.collector);
        loop {
            tokio::select! {
                observation = rx.recv() => {
                    match observation {
                        Some(observation) => {
                            if let Err(e) = self.process(observation).await {
                                error!("Failed to ship telemetry: {e}");
                            }
                        }
                        None => {
                            info!("Capture channel closed, pipeline stopping");
                            return;
                        }
                    }
                }
                () = shutdown.cancelled() => {
                    info!("Pipeline stopping");
                    return;
                }
            }
        }
    }

    async fn process(&mut self, observation: Observation) -> Result<(), PipelineError> {
        let record = self.enrich(observation).await;
        let datagram = record.to_datagram()?;
        self.socket
            .send_to(&datagram, self.collector)
            .await
            .map_err(PipelineError::Transmit)?;
        debug!(
            "Sent {} {} {}:{}",
            record.direction, record.software_name, record.destination_ip, record.port
        );
        Ok(())
    }

    async fn enrich(&mut self, observation: Observation) -> TelemetryRecord {
        let classified = classify(&observation, self.local_ip);
        let country = self.geo.resolve(classified.target_ip).await;
        let software_name = self.software.resolve(classified.target_ip, classified.port);

        TelemetryRecord {
            timestamp: observation.timestamp,
            direction: classified.direction,
            destination_ip: classified.target_ip,
            port: classified.port,
            size_bytes: observation.wire_len,
            country,
            software_name,
            mac: format_mac(classified.peer_mac),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::net::Ipv4Addr;

    const LOCAL_MAC: [u8; 6] = [0x00, 0x1B, 0x44, 0x11, 0x3A, 0xB7];
    const PEER_MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22];

    const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 15);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn observation(
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_mac: [u8; 6],
        dst_mac: [u8; 6],
    ) -> Observation {
        Observation {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap(),
            src_mac,
            dst_mac,
            src_ip,
            dst_ip,
            src_port: 51234,
            dst_port: 443,
            wire_len: 1514,
        }
    }

    #[test]
    fn locally_sourced_packets_classify_as_outbound() {
        let observation = observation(LOCAL_IP, PEER_IP, LOCAL_MAC, PEER_MAC);
        let classified = classify(&observation, IpAddr::V4(LOCAL_IP));

        assert_eq!(classified.direction, Direction::Outbound);
        assert_eq!(classified.target_ip, IpAddr::V4(PEER_IP));
        assert_eq!(classified.port, 443);
        assert_eq!(classified.peer_mac, PEER_MAC);
    }

    #[test]
    fn remotely_sourced_packets_classify_as_inbound() {
        let observation = observation(PEER_IP, LOCAL_IP, PEER_MAC, LOCAL_MAC);
        let classified = classify(&observation, IpAddr::V4(LOCAL_IP));

        assert_eq!(classified.direction, Direction::Inbound);
        assert_eq!(classified.target_ip, IpAddr::V4(PEER_IP));
        // Peer-side port, not the local one.
        assert_eq!(classified.port, 51234);
        assert_eq!(classified.peer_mac, PEER_MAC);
    }

    #[test]
    fn third_party_frames_classify_as_inbound() {
        // Promiscuous capture sees frames between two other hosts.
        let third: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 77);
        let observation = observation(PEER_IP, third, PEER_MAC, LOCAL_MAC);
        let classified = classify(&observation, IpAddr::V4(LOCAL_IP));

        assert_eq!(classified.direction, Direction::Inbound);
        assert_eq!(classified.target_ip, IpAddr::V4(PEER_IP));
    }
}
