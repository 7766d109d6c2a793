use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aircraft::AircraftState;
use crate::cache::{FlightCache, FlightSnapshot};
use crate::errors::{AeroEchoError, Result};
use crate::poller::{PollEvent, PollFailure};
use crate::viewport::{Viewport, filter};

pub type ConnectionId = u64;

/// Server to client messages, serialized as plain JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Flights { ac: Vec<AircraftState> },
    UpdateError { error: String, timestamp: DateTime<Utc> },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| AeroEchoError::TransportSendFailure {
            connection: 0,
            reason: format!("cannot serialize message: {e}"),
        })
    }
}

impl From<&PollFailure> for ServerMessage {
    fn from(failure: &PollFailure) -> Self {
        ServerMessage::UpdateError { error: failure.error.clone(), timestamp: failure.timestamp }
    }
}

struct Subscription {
    remote_addr: SocketAddr,
    viewport: Option<Viewport>,
    tx: mpsc::Sender<ServerMessage>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: usize,
}

/// The set of live client subscriptions, each with its own viewport and outbound queue.
///
/// Sends never block: every connection has a bounded queue drained by its own writer task.
/// A full queue drops that one message, a closed queue ends the subscription.
pub struct Hub {
    cache: FlightCache,
    subscriptions: DashMap<ConnectionId, Subscription>,
    next_id: AtomicU64,
    queue_len: usize,
}

impl Hub {
    pub fn new(cache: FlightCache, queue_len: usize) -> Self {
        Hub { cache, subscriptions: DashMap::new(), next_id: AtomicU64::new(1), queue_len: queue_len.max(1) }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn viewport(&self, id: ConnectionId) -> Option<Viewport> {
        self.subscriptions.get(&id).and_then(|sub| sub.viewport)
    }

    /// Register a new connection. It gets the current unfiltered snapshot right away,
    /// filtered pushes start once it sends a viewport.
    pub fn subscribe(&self, remote_addr: SocketAddr) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_len);

        let snapshot = self.cache.snapshot();
        if !snapshot.is_empty() {
            // fresh queue, cannot be full
            let _ = tx.try_send(ServerMessage::Flights { ac: snapshot.aircraft.clone() });
        }

        self.subscriptions.insert(id, Subscription { remote_addr, viewport: None, tx });
        info!("User connected: {} ({})", id, remote_addr);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: ConnectionId) {
        if let Some((_, sub)) = self.subscriptions.remove(&id) {
            info!("User disconnected: {} ({})", id, sub.remote_addr);
        }
    }

    /// Replace the viewport of a connection and push it the matching part of the current snapshot.
    pub fn set_viewport(&self, id: ConnectionId, viewport: Viewport) -> Result<()> {
        let msg = {
            let mut sub = self
                .subscriptions
                .get_mut(&id)
                .ok_or_else(|| AeroEchoError::NotFound(format!("connection {id}")))?;
            sub.viewport = Some(viewport);

            let snapshot = self.cache.snapshot();
            ServerMessage::Flights { ac: filter(&snapshot.aircraft, Some(&viewport)) }
        };

        self.send_to(id, msg)
    }

    /// Handle a raw text message from a client. Anything that is not a valid viewport is
    /// rejected and leaves the previous viewport in place.
    pub fn handle_client_message(&self, id: ConnectionId, text: &str) -> Result<()> {
        let viewport = Viewport::from_json(text)?;
        debug!("connection {} viewport {:?}", id, viewport);
        self.set_viewport(id, viewport)
    }

    /// Push every subscription with a viewport its own filtered view of the snapshot.
    pub fn publish(&self, snapshot: &FlightSnapshot) -> PublishReport {
        self.fan_out(|sub| sub.viewport.map(|vp| ServerMessage::Flights { ac: filter(&snapshot.aircraft, Some(&vp)) }))
    }

    /// Tell every connection that the last poll failed.
    pub fn publish_error(&self, failure: &PollFailure) -> PublishReport {
        let msg = ServerMessage::from(failure);
        self.fan_out(|_| Some(msg.clone()))
    }

    fn fan_out<F>(&self, mut message_for: F) -> PublishReport
    where
        F: FnMut(&Subscription) -> Option<ServerMessage>,
    {
        let mut report = PublishReport::default();
        let mut closed = Vec::new();

        for entry in self.subscriptions.iter() {
            let Some(msg) = message_for(entry.value()) else { continue };

            match deliver(*entry.key(), &entry.value().tx, msg) {
                Ok(()) => report.delivered += 1,
                Err(Delivery::Dropped) => report.dropped += 1,
                Err(Delivery::Closed) => closed.push(*entry.key()),
            }
        }

        // removal needs the shard write lock, so only after iterating
        for id in closed {
            self.unsubscribe(id);
            report.removed += 1;
        }
        report
    }

    fn send_to(&self, id: ConnectionId, msg: ServerMessage) -> Result<()> {
        let result = match self.subscriptions.get(&id) {
            Some(sub) => deliver(id, &sub.tx, msg),
            None => return Err(AeroEchoError::NotFound(format!("connection {id}"))),
        };

        match result {
            Ok(()) => Ok(()),
            Err(Delivery::Dropped) => Err(send_failure(id, "outbound queue full")),
            Err(Delivery::Closed) => {
                self.unsubscribe(id);
                Err(send_failure(id, "connection closed"))
            }
        }
    }
}

enum Delivery {
    Dropped,
    Closed,
}

fn deliver(id: ConnectionId, tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) -> std::result::Result<(), Delivery> {
    match tx.try_send(msg) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("{}", send_failure(id, "outbound queue full, message dropped"));
            Err(Delivery::Dropped)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("{}", send_failure(id, "connection closed"));
            Err(Delivery::Closed)
        }
    }
}

fn send_failure(connection: ConnectionId, reason: &str) -> AeroEchoError {
    AeroEchoError::TransportSendFailure { connection, reason: reason.to_string() }
}

/// Forward poll events to the hub until the poller's channel closes.
pub fn spawn_relay(hub: Arc<Hub>, mut events: broadcast::Receiver<PollEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PollEvent::Refreshed(snapshot)) => {
                    let report = hub.publish(&snapshot);
                    debug!("published {} aircraft: {:?}", snapshot.len(), report);
                }
                Ok(PollEvent::Failed(failure)) => {
                    hub.publish_error(&failure);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("relay lagged behind by {} poll events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
