// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::warn;

/// Routable address used to discover the default egress interface.
/// Connecting a UDP socket sends no traffic; it only binds a local address.
const PROBE_ADDR: &str = "8.8.8.8:80";

/// Determines the IP address this endpoint uses for outbound traffic.
///
/// The result anchors direction classification for every captured packet.
/// Falls back to loopback when the host has no route, so the agent still
/// starts on an isolated machine.
pub fn local_ip() -> IpAddr {
    match probe_local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Failed to determine local IP, falling back to loopback: {e}");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn probe_local_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(PROBE_ADDR)?;
    Ok(socket.local_addr()?.ip())
}
