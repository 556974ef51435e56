// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Packet capture via pcap.
//!
//! The sniffer owns a blocking pcap handle, so it runs on a dedicated thread
//! and hands decoded observations to the async pipeline through a bounded
//! channel. When the pipeline falls behind, packets are dropped at the
//! channel rather than stalling the capture loop.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use etherparse::{LinkHeader, NetHeaders, PacketHeaders, TransportHeader};
use pcap::{Active, Capture, Device};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// BPF filter limiting capture to IPv4 TCP and UDP traffic.
const CAPTURE_FILTER: &str = "ip and (tcp or udp)";
/// Bytes captured per packet. Headers only, with room for link, IP and TCP
/// options; the original wire length is reported separately by pcap.
const SNAPLEN: i32 = 256;
/// Kernel buffer for bursts while the loop is busy.
const BUFFER_SIZE: i32 = 1024 * 1024;
/// Read timeout so the loop can poll for cancellation.
const READ_TIMEOUT_MS: i32 = 1000;
/// How many queue drops between log lines.
const DROP_LOG_INTERVAL: u64 = 1000;

/// Bound of the capture-to-pipeline channel.
pub const QUEUE_CAPACITY: usize = 512;

/// Error surfaced when the capture device cannot be prepared.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Device enumeration itself failed.
    #[error("failed to enumerate capture devices: {0}")]
    List(#[source] pcap::Error),
    /// pcap found no usable capture device.
    #[error("no capture device available")]
    NoDevice,
    /// The requested interface does not exist on this host.
    #[error("capture device {0} not found")]
    DeviceNotFound(String),
    /// The device exists but could not be opened, usually a privilege issue.
    #[error("failed to open capture device {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: pcap::Error,
    },
    /// The BPF filter was rejected.
    #[error("failed to install capture filter on {device}: {source}")]
    Filter {
        device: String,
        #[source]
        source: pcap::Error,
    },
}

/// A captured TCP or UDP packet, reduced to what enrichment needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Length on the wire, not the possibly truncated capture length.
    pub wire_len: u64,
}

pub struct Sniffer {
    capture: Capture<Active>,
    device_name: String,
}

impl Sniffer {
    /// Opens the capture device in promiscuous mode and installs the
    /// TCP/UDP filter. With no interface name, the first device pcap
    /// reports is used.
    pub fn open(interface: Option<&str>) -> Result<Self, CaptureError> {
        let device = match interface {
            Some(name) => Device::list()
                .map_err(CaptureError::List)?
                .into_iter()
                .find(|d| d.name == name)
                .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()))?,
            None => Device::lookup()
                .map_err(CaptureError::List)?
                .ok_or(CaptureError::NoDevice)?,
        };
        let device_name = device.name.clone();

        let mut capture = Capture::from_device(device)
            .map_err(|e| CaptureError::Open {
                device: device_name.clone(),
                source: e,
            })?
            .promisc(true)
            .snaplen(SNAPLEN)
            .buffer_size(BUFFER_SIZE)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| CaptureError::Open {
                device: device_name.clone(),
                source: e,
            })?;

        capture
            .filter(CAPTURE_FILTER, true)
            .map_err(|e| CaptureError::Filter {
                device: device_name.clone(),
                source: e,
            })?;

        Ok(Self {
            capture,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Pumps decoded observations into `tx` until cancellation, a fatal
    /// pcap error, or the receiving side going away. Runs on a dedicated
    /// thread since pcap reads block.
    pub fn run(mut self, tx: mpsc::Sender<Observation>, shutdown: CancellationToken) {
        info!(
            "Capture started on {} with filter '{CAPTURE_FILTER}'",
            self.device_name
        );
        let mut dropped: u64 = 0;

        loop {
            if shutdown.is_cancelled() {
                info!("Capture stopped on {}", self.device_name);
                return;
            }

            let packet = match self.capture.next_packet() {
                Ok(packet) => packet,
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    error!("Capture failed on {}: {e}", self.device_name);
                    return;
                }
            };

            let wire_len = u64::from(packet.header.len);
            let observation = match decode_frame(packet.data, wire_len, Utc::now()) {
                Some(observation) => observation,
                None => continue,
            };

            match tx.try_send(observation) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped % DROP_LOG_INTERVAL == 1 {
                        warn!("Enrichment queue full, {dropped} packets dropped so far");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    info!("Pipeline gone, stopping capture on {}", self.device_name);
                    return;
                }
            }
        }
    }
}

/// Decodes an Ethernet frame down to the fields telemetry carries.
///
/// Anything that is not Ethernet II carrying IPv4 TCP or UDP is dropped.
/// The BPF filter already excludes most of that; this also covers frames
/// truncated below their header chain.
pub fn decode_frame(data: &[u8], wire_len: u64, timestamp: DateTime<Utc>) -> Option<Observation> {
    let headers = PacketHeaders::from_ethernet_slice(data).ok()?;

    let eth = match headers.link {
        Some(LinkHeader::Ethernet2(eth)) => eth,
        _ => return None,
    };
    let ipv4 = match headers.net {
        Some(NetHeaders::Ipv4(ipv4, _)) => ipv4,
        _ => return None,
    };
    let (src_port, dst_port) = match headers.transport {
        Some(TransportHeader::Tcp(tcp)) => (tcp.source_port, tcp.destination_port),
        Some(TransportHeader::Udp(udp)) => (udp.source_port, udp.destination_port),
        _ => return None,
    };

    Some(Observation {
        timestamp,
        src_mac: eth.source,
        dst_mac: eth.destination,
        src_ip: Ipv4Addr::from(ipv4.source),
        dst_ip: Ipv4Addr::from(ipv4.destination),
        src_port,
        dst_port,
        wire_len,
    })
}

/// Formats a hardware address as uppercase colon-separated hex.
pub fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
