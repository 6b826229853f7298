//! Coordinator: routes hub traffic and hands out worker ports.
//!
//! The coordinator owns the hub's event stream. Worker registration and load
//! reports go to the [`BalancerHandle`]; claims and dispatch confirmations go
//! to the drop engine. End users ask the route endpoint which worker to
//! connect to and get back the least-loaded worker's port.

use crate::balancer::BalancerHandle;
use crate::coordination::{Hub, HubEvent, PeerId};
use crate::drops::EngineEvent;
use log::{debug, error, info, warn};
use shared::CoordMessage;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Line written by the route endpoint when no worker can be handed out.
pub const NO_WORKER_REPLY: &str = "unavailable";

pub struct Coordinator {
    hub: Hub,
    events: mpsc::UnboundedReceiver<HubEvent>,
    balancer: BalancerHandle,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    worker_peers: HashMap<PeerId, u16>,
}

impl Coordinator {
    pub fn new(
        hub: Hub,
        events: mpsc::UnboundedReceiver<HubEvent>,
        balancer: BalancerHandle,
        engine_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            hub,
            events,
            balancer,
            engine_tx,
            worker_peers: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        info!("Coordinator started");
        while let Some(event) = self.events.recv().await {
            self.handle_event(event).await;
        }
        info!("Hub event stream closed, coordinator stopping");
    }

    pub async fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { peer } => debug!("Peer {} connected", peer),
            HubEvent::Disconnected { peer } => {
                if let Some(port) = self.worker_peers.remove(&peer) {
                    if self.balancer.deregister_peer_worker(port, peer).await.is_some() {
                        info!("Worker {} (peer {}) disconnected", port, peer);
                    } else {
                        info!("Worker {} already taken over, ignoring stale peer {}", port, peer);
                    }
                } else {
                    debug!("Peer {} disconnected", peer);
                }
                self.hub.remove_peer(peer).await;
            }
            HubEvent::Message { peer, msg } => self.route(peer, msg).await,
        }
    }

    async fn route(&mut self, peer: PeerId, msg: CoordMessage) {
        match msg {
            CoordMessage::WorkerConnect { port } => {
                self.worker_peers.insert(peer, port);
                self.balancer.register_worker(port, peer).await;
            }
            CoordMessage::UpdateLoad { port, clients } => {
                if !self.balancer.update_load(port, clients).await {
                    debug!("Load update for unknown worker {}", port);
                }
            }
            CoordMessage::Claim(claim) => self.forward(EngineEvent::Claim(claim)),
            CoordMessage::DispatchConfirmed(record) => {
                self.forward(EngineEvent::DispatchConfirmed(record))
            }
            other => warn!("Peer {} sent hub-only message {:?}", peer, other),
        }
    }

    fn forward(&self, event: EngineEvent) {
        if self.engine_tx.send(event).is_err() {
            error!("Drop engine is gone, dropping coordination event");
        }
    }
}

/// Checks worker liveness every `period` and logs the load distribution.
pub fn spawn_refresh(balancer: BalancerHandle, host: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            for check in balancer.refresh_online_status(&host).await {
                let _ = check.await;
            }
            debug!("Worker load: {}", balancer.describe_load().await);
        }
    })
}

/// Answers every connection with the port of the worker it should use,
/// waiting for the worker quorum first.
pub async fn serve_routes(listener: TcpListener, balancer: BalancerHandle) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Route accept failed: {}", e);
                continue;
            }
        };

        let balancer = balancer.clone();
        tokio::spawn(async move {
            let reply = match balancer.select_worker().await {
                Some(worker) => {
                    debug!("Routing {} to worker {}", addr, worker.port);
                    worker.port.to_string()
                }
                None => {
                    warn!("No worker online for {}", addr);
                    NO_WORKER_REPLY.to_string()
                }
            };
            if let Err(e) = stream.write_all(format!("{}\n", reply).as_bytes()).await {
                debug!("Failed to answer route request from {}: {}", addr, e);
            }
        });
    }
}
