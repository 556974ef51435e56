// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of processed records to live websocket observers.
//!
//! The observer set is owned exclusively by one task; ingest workers and
//! upgrade handlers talk to it over a channel, so no lock is shared between
//! the blocking ingest threads and the async side.

use std::sync::Arc;

use packetwatch_wire::BroadcastEnvelope;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

enum Command {
    /// Register a fresh observer outbox.
    Attach(mpsc::UnboundedSender<Arc<str>>),
    /// Deliver one envelope to every live observer.
    Publish(Box<BroadcastEnvelope>),
}

/// Cloneable submission side of the broadcast channel. Sends never block,
/// so this is safe to call from the blocking ingest workers.
#[derive(Debug, Clone)]
pub struct BroadcastHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl BroadcastHandle {
    /// Queues one processed record for delivery to every observer. Delivery
    /// failures never propagate back to the caller.
    pub fn publish(&self, envelope: BroadcastEnvelope) {
        let _ = self.tx.send(Command::Publish(Box::new(envelope)));
    }

    /// Registers a new observer and returns the feed it should drain.
    /// Dropping the feed evicts the observer on the next delivery.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<Arc<str>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(Command::Attach(tx));
        rx
    }
}

/// Task-owned state behind [`BroadcastHandle`]. Run it once on the runtime.
pub struct BroadcastService {
    rx: mpsc::UnboundedReceiver<Command>,
    observers: Vec<mpsc::UnboundedSender<Arc<str>>>,
}

impl BroadcastService {
    pub fn new() -> (Self, BroadcastHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx,
                observers: Vec::new(),
            },
            BroadcastHandle { tx },
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(Command::Attach(outbox)) => {
                        self.observers.push(outbox);
                        debug!("Observer attached, {} live", self.observers.len());
                    }
                    Some(Command::Publish(envelope)) => self.deliver(*envelope),
                    None => break,
                },
            }
        }
        debug!("Broadcast service stopped");
    }

    /// Serializes once and hands the shared payload to every observer.
    /// Observers whose feed is gone are evicted; the rest still receive the
    /// message.
    fn deliver(&mut self, envelope: BroadcastEnvelope) {
        let payload: Arc<str> = match serde_json::to_string(&envelope) {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to serialize broadcast payload: {e}");
                return;
            }
        };
        self.observers
            .retain(|observer| observer.send(Arc::clone(&payload)).is_ok());
    }
}
