//! In-process coordination hub.
//!
//! Connects one hub to any number of peers (workers, the drop server). Peers
//! send tagged [`CoordMessage`]s toward the hub through a [`PeerLink`]; the
//! hub reaches peers point-to-point or by broadcast. The hub owner observes
//! connects, messages and disconnects as a single ordered stream of
//! [`HubEvent`]s.
//!
//! Delivery is fire-and-forget: a message to a peer that has gone away is
//! logged and dropped, which the drop engine treats the same as a claim that
//! never arrived.

use log::{debug, warn};
use shared::CoordMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub type PeerId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Connected { peer: PeerId },
    Message { peer: PeerId, msg: CoordMessage },
    Disconnected { peer: PeerId },
}

#[derive(Clone)]
pub struct Hub {
    peers: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<CoordMessage>>>>,
    events: mpsc::UnboundedSender<HubEvent>,
    next_peer: Arc<AtomicU64>,
}

impl Hub {
    /// Creates a hub and the event stream its owner consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let hub = Hub {
            peers: Arc::new(RwLock::new(HashMap::new())),
            events,
            next_peer: Arc::new(AtomicU64::new(1)),
        };
        (hub, event_rx)
    }

    /// Registers a new peer. Dropping the returned connection notifies the
    /// hub owner with [`HubEvent::Disconnected`].
    pub async fn connect(&self) -> PeerConnection {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (tx, inbox) = mpsc::unbounded_channel();
        self.peers.write().await.insert(peer, tx);

        if self.events.send(HubEvent::Connected { peer }).is_err() {
            warn!("Hub owner gone, peer {} connected to a dead hub", peer);
        }

        PeerConnection {
            link: PeerLink {
                peer,
                events: self.events.clone(),
            },
            inbox,
        }
    }

    /// Sends a message to every connected peer. Returns how many accepted it.
    pub async fn broadcast(&self, msg: CoordMessage) -> usize {
        let peers = self.peers.read().await;
        let mut delivered = 0;
        for (peer, tx) in peers.iter() {
            if tx.send(msg.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!("Broadcast skipped closed peer {}", peer);
            }
        }
        delivered
    }

    pub async fn send_to(&self, peer: PeerId, msg: CoordMessage) -> bool {
        let peers = self.peers.read().await;
        match peers.get(&peer) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    pub async fn remove_peer(&self, peer: PeerId) {
        self.peers.write().await.remove(&peer);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Cloneable sending side of a peer, toward the hub.
#[derive(Debug, Clone)]
pub struct PeerLink {
    peer: PeerId,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl PeerLink {
    pub fn id(&self) -> PeerId {
        self.peer
    }

    pub fn send(&self, msg: CoordMessage) {
        if let Err(e) = self.events.send(HubEvent::Message {
            peer: self.peer,
            msg,
        }) {
            warn!("Peer {} failed to reach hub: {}", self.peer, e);
        }
    }
}

/// A peer's connection: its link plus the inbox of hub-to-peer traffic.
pub struct PeerConnection {
    link: PeerLink,
    inbox: mpsc::UnboundedReceiver<CoordMessage>,
}

impl PeerConnection {
    pub fn id(&self) -> PeerId {
        self.link.peer
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    pub fn send(&self, msg: CoordMessage) {
        self.link.send(msg);
    }

    /// Next message from the hub; `None` once the hub dropped this peer.
    pub async fn recv(&mut self) -> Option<CoordMessage> {
        self.inbox.recv().await
    }

    /// Next already-delivered message, without waiting.
    pub fn try_recv(&mut self) -> Option<CoordMessage> {
        self.inbox.try_recv().ok()
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        let _ = self.link.events.send(HubEvent::Disconnected {
            peer: self.link.peer,
        });
    }
}
