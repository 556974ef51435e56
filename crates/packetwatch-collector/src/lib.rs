// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Central collector for the packetwatch fleet: receives enriched traffic
//! records from capture agents over UDP, persists them, scores them for
//! threats and fans them out to dashboard observers over websockets.

#![deny(clippy::all)]

pub mod api;
pub mod broadcast;
pub mod config;
pub mod detect;
pub mod http_utils;
pub mod ingest;
pub mod store;

use std::sync::{Arc, Mutex};

use broadcast::BroadcastHandle;
use config::ConfigWatcher;
use detect::ThreatDetector;
use store::Store;

/// Shared handles threaded through the ingest workers and the HTTP surface.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    /// Persistence, behind one lock so ingest writes and the administrative
    /// reset are mutually exclusive.
    pub store: Arc<Mutex<Store>>,
    /// Hot-reloadable settings file.
    pub config: Arc<ConfigWatcher>,
    /// Volatile threat-detection state.
    pub detector: Arc<ThreatDetector>,
    /// Submission side of the observer fan-out.
    pub broadcast: BroadcastHandle,
}

impl CollectorContext {
    pub fn new(store: Store, config: ConfigWatcher, broadcast: BroadcastHandle) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            config: Arc::new(config),
            detector: Arc::new(ThreatDetector::new()),
            broadcast,
        }
    }
}
