// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared wire types for the packetwatch agent and collector.
//!
//! Every captured packet travels from an agent to the collector as one UDP
//! datagram holding a single JSON-encoded [`TelemetryRecord`]. The collector
//! rebroadcasts committed records to dashboard observers as a
//! [`BroadcastEnvelope`], which carries the same fields plus the agent row id
//! and any threat verdicts.

#![deny(clippy::all)]

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which way a packet crossed the monitored interface, relative to the
/// endpoint that captured it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// The endpoint was the packet's destination.
    #[serde(rename = "in")]
    Inbound,
    /// The endpoint was the packet's source.
    #[serde(rename = "out")]
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured packet after agent-side enrichment.
///
/// `destination_ip` is the non-local peer of the flow regardless of
/// direction, so inbound records carry the remote sender's address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Capture time on the agent, ISO-8601 in UTC.
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub destination_ip: IpAddr,
    /// Port on the non-local peer side of the flow.
    pub port: u16,
    /// Bytes on the wire, including link-layer framing.
    pub size_bytes: u64,
    pub country: String,
    pub software_name: String,
    /// Peer MAC address, uppercase colon-separated hex.
    pub mac: String,
}

impl TelemetryRecord {
    /// Encodes the record as the payload of a single UDP datagram.
    pub fn to_datagram(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a datagram payload produced by [`TelemetryRecord::to_datagram`].
    pub fn from_datagram(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// A committed record as rebroadcast to live observers.
///
/// The wire fields pass through flattened at the top level. `alert` and
/// `security_event` are omitted entirely unless raised, matching what the
/// dashboard expects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    #[serde(flatten)]
    pub record: TelemetryRecord,
    pub agent_id: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub alert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_event: Option<String>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}
