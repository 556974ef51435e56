// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

use chrono::{TimeZone, Utc};
use packetwatch_agent::capture::Observation;
use packetwatch_agent::pipeline::Pipeline;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 15);

// Site-local targets short-circuit the geo lookup, so tests never leave
// the host even though a geo endpoint is configured.
const GEO_API_BASE: &str = "http://geo.invalid/json";

fn observation(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dst_port: u16) -> Observation {
    Observation {
        timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap(),
        src_mac: [0x00, 0x1B, 0x44, 0x11, 0x3A, 0xB7],
        dst_mac: [0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22],
        src_ip,
        dst_ip,
        src_port: 51234,
        dst_port,
        wire_len: 1514,
    }
}

async fn recv_json(collector: &UdpSocket) -> serde_json::Value {
    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), collector.recv_from(&mut buf))
        .await
        .expect("datagram within deadline")
        .expect("recv from pipeline");
    serde_json::from_slice(&buf[..len]).expect("datagram is valid JSON")
}

#[tokio::test]
async fn pipeline_ships_one_datagram_per_observation() {
    let collector = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind collector socket");
    let collector_addr = collector.local_addr().expect("collector addr");

    let pipeline = Pipeline::new(LOCAL_IP.into(), collector_addr, GEO_API_BASE.to_string())
        .await
        .expect("build pipeline");

    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let pipeline_task = tokio::spawn(pipeline.run(rx, shutdown.clone()));

    // Outbound packet to a peer on the site network.
    tx.send(observation(LOCAL_IP, Ipv4Addr::new(192, 168, 1, 20), 443))
        .await
        .expect("queue observation");

    let value = recv_json(&collector).await;
    assert_eq!(value["direction"], "out");
    assert_eq!(value["destination_ip"], "192.168.1.20");
    assert_eq!(value["port"], 443);
    assert_eq!(value["size_bytes"], 1514);
    assert_eq!(value["country"], "Local");
    assert_eq!(value["mac"], "AA:BB:CC:00:11:22");
    assert!(value["software_name"].is_string());
    assert!(value["timestamp"]
        .as_str()
        .expect("timestamp is a string")
        .starts_with("2024-05-02T09:30:00"));

    // Inbound packet from another site host; the record points at the
    // sender and its side of the flow.
    tx.send(observation(Ipv4Addr::new(10, 0, 0, 8), LOCAL_IP, 8080))
        .await
        .expect("queue observation");

    let value = recv_json(&collector).await;
    assert_eq!(value["direction"], "in");
    assert_eq!(value["destination_ip"], "10.0.0.8");
    assert_eq!(value["port"], 51234);
    assert_eq!(value["country"], "Local");
    assert_eq!(value["mac"], "00:1B:44:11:3A:B7");

    shutdown.cancel();
    let result = timeout(Duration::from_secs(1), pipeline_task).await;
    assert!(result.is_ok(), "pipeline should stop on cancellation");
}

#[tokio::test]
async fn pipeline_stops_when_capture_side_closes() {
    let collector = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind collector socket");

    let pipeline = Pipeline::new(
        LOCAL_IP.into(),
        collector.local_addr().expect("collector addr"),
        GEO_API_BASE.to_string(),
    )
    .await
    .expect("build pipeline");

    let (tx, rx) = mpsc::channel(4);
    let pipeline_task = tokio::spawn(pipeline.run(rx, CancellationToken::new()));

    drop(tx);

    let result = timeout(Duration::from_secs(1), pipeline_task).await;
    assert!(result.is_ok(), "pipeline should stop once the channel closes");
}
