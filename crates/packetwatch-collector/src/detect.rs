// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Threat detection over ingested traffic records.
//!
//! Two volatile checks run on every outbound record: a blacklist match
//! against the configured destination set, and a port-scan heuristic that
//! counts distinct destination ports per (agent, destination) pair. State
//! lives in memory only; a restart starts tracking from scratch.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use packetwatch_wire::{Direction, TelemetryRecord};

/// Distinct destination ports a pair must exceed before a scan alert fires.
const SCAN_THRESHOLD: usize = 20;
/// Debounce window between scan alerts for the same pair.
const SCAN_WINDOW: Duration = Duration::from_secs(60);

/// Annotation attached to broadcast payloads when the scan heuristic fires.
pub const PORT_SCAN_EVENT: &str = "Port Scan Detected";

/// Outcome of evaluating one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verdict {
    /// Destination matched the configured blacklist.
    pub blacklist_hit: bool,
    /// Distinct-port tracking crossed the scan threshold.
    pub port_scan: bool,
}

impl Verdict {
    /// Whether the record should be flagged to observers at all.
    pub fn alert(self) -> bool {
        self.blacklist_hit || self.port_scan
    }
}

type FlowKey = (IpAddr, IpAddr);

#[derive(Debug, Default)]
struct ScanTracker {
    ports: HashMap<FlowKey, HashSet<u16>>,
    last_alert: HashMap<FlowKey, Instant>,
}

/// Owns the volatile scan-tracking state behind a single lock so the ingest
/// workers can share it by handle.
#[derive(Debug, Default)]
pub struct ThreatDetector {
    tracker: Mutex<ScanTracker>,
}

impl ThreatDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates one record against both checks. Inbound records never
    /// alert; only traffic the agent itself originates is scored.
    pub fn evaluate(
        &self,
        source: IpAddr,
        record: &TelemetryRecord,
        blacklist: &[IpAddr],
    ) -> Verdict {
        self.evaluate_at(source, record, blacklist, Instant::now())
    }

    fn evaluate_at(
        &self,
        source: IpAddr,
        record: &TelemetryRecord,
        blacklist: &[IpAddr],
        now: Instant,
    ) -> Verdict {
        if record.direction != Direction::Outbound {
            return Verdict::default();
        }
        Verdict {
            blacklist_hit: blacklist.contains(&record.destination_ip),
            port_scan: self.track_port(source, record.destination_ip, record.port, now),
        }
    }

    /// Records one destination port for the pair and reports whether the
    /// scan alert fires. On firing, the pair's port set is cleared and the
    /// debounce clock restarts.
    fn track_port(&self, source: IpAddr, destination: IpAddr, port: u16, now: Instant) -> bool {
        let key = (source, destination);
        let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let ports = tracker.ports.entry(key).or_default();
        ports.insert(port);
        if ports.len() <= SCAN_THRESHOLD {
            return false;
        }
        let debounced = tracker
            .last_alert
            .get(&key)
            .is_some_and(|fired| now.duration_since(*fired) <= SCAN_WINDOW);
        if debounced {
            // Within the window: suppress, but keep accumulating.
            return false;
        }
        tracker.last_alert.insert(key, now);
        tracker.ports.insert(key, HashSet::new());
        true
    }

    /// Drops all tracked pairs, used by the administrative reset so a fresh
    /// scan sequence is scored from zero.
    pub fn reset(&self) {
        let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        tracker.ports.clear();
        tracker.last_alert.clear();
    }
}
