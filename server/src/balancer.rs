//! Worker pool registry and least-loaded routing.
//!
//! This module tracks which worker processes are online and how many end
//! users each one serves:
//! - Worker registration on readiness, removal on disconnect
//! - Load updates reported by the workers themselves
//! - Liveness checks to drop workers that died without a disconnect
//! - Least-loaded selection, held back until a quorum of workers is online
//!
//! The quorum gate is a one-way latch: once enough workers have registered,
//! waiting callers are released and later callers are never suspended
//! again, even if workers go away afterwards. A quorum of zero is reached
//! from the start.

use crate::coordination::PeerId;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long a liveness check may take before the worker counts as closed.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

/// A registered worker and its last reported load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    /// Port the worker accepts end users on
    pub port: u16,
    /// Coordination peer the worker registered through
    pub peer: PeerId,
    /// Connected end users
    pub clients: u32,
}

/// Registry of online workers.
///
/// List order carries no meaning beyond tie-breaking: selection picks the
/// smallest client count and the first such worker on a tie.
pub struct Balancer {
    workers: Vec<WorkerRecord>,
    min_available_workers: usize,
    quorum_reached: bool,
    waiting: Vec<oneshot::Sender<()>>,
}

impl Balancer {
    pub fn new(min_available_workers: usize) -> Self {
        Self {
            workers: Vec::new(),
            min_available_workers,
            quorum_reached: min_available_workers == 0,
            waiting: Vec::new(),
        }
    }

    /// Adds a worker with no clients. A port that is already registered is
    /// replaced so there is never more than one record per port.
    ///
    /// Reaching the quorum releases every waiting selection in FIFO order.
    pub fn register_worker(&mut self, port: u16, peer: PeerId) {
        let record = WorkerRecord {
            port,
            peer,
            clients: 0,
        };
        match self.workers.iter_mut().find(|w| w.port == port) {
            Some(existing) => *existing = record,
            None => self.workers.push(record),
        }
        info!("Worker {} registered ({} online)", port, self.workers.len());

        if !self.quorum_reached && self.workers.len() >= self.min_available_workers {
            self.quorum_reached = true;
            let released = self.waiting.len();
            for waiter in self.waiting.drain(..) {
                let _ = waiter.send(());
            }
            info!(
                "Worker quorum of {} reached, released {} waiting clients",
                self.min_available_workers, released
            );
        }
    }

    /// Removes the worker on `port`. Unknown ports are ignored.
    pub fn deregister_worker(&mut self, port: u16) -> Option<WorkerRecord> {
        let index = self.workers.iter().position(|w| w.port == port)?;
        Some(self.remove_at(index))
    }

    /// Removes the worker on `port` only if it registered through `peer`.
    /// A port taken over by a newer peer stays registered.
    pub fn deregister_peer_worker(&mut self, port: u16, peer: PeerId) -> Option<WorkerRecord> {
        let index = self
            .workers
            .iter()
            .position(|w| w.port == port && w.peer == peer)?;
        Some(self.remove_at(index))
    }

    fn remove_at(&mut self, index: usize) -> WorkerRecord {
        let removed = self.workers.remove(index);
        info!("Worker {} deregistered ({} online)", removed.port, self.workers.len());
        if self.is_empty() {
            warn!("No workers online");
        }
        removed
    }

    /// Overwrites the client count of a worker. Unknown ports are ignored.
    pub fn update_load(&mut self, port: u16, clients: u32) -> bool {
        match self.workers.iter_mut().find(|w| w.port == port) {
            Some(worker) => {
                worker.clients = clients;
                true
            }
            None => false,
        }
    }

    pub fn least_loaded(&self) -> Option<&WorkerRecord> {
        self.workers.iter().min_by_key(|w| w.clients)
    }

    /// Selects a worker right away, or queues the caller until the quorum is
    /// reached. `Ok(None)` means the quorum was reached once but no worker
    /// is online right now.
    pub fn try_select(&mut self) -> Result<Option<WorkerRecord>, oneshot::Receiver<()>> {
        if self.quorum_reached {
            return Ok(self.least_loaded().cloned());
        }

        let (tx, rx) = oneshot::channel();
        self.waiting.push(tx);
        Err(rx)
    }

    pub fn has_quorum(&self) -> bool {
        self.quorum_reached
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.workers.iter().map(|w| w.port).collect()
    }

    pub fn workers(&self) -> &[WorkerRecord] {
        &self.workers
    }

    pub fn total_clients(&self) -> u64 {
        self.workers.iter().map(|w| w.clients as u64).sum()
    }

    /// Human readable load snapshot, e.g. `"7 clients: 5@8100, 2@8101"`.
    pub fn describe_load(&self) -> String {
        let listing: Vec<String> = self
            .workers
            .iter()
            .map(|w| format!("{}@{}", w.clients, w.port))
            .collect();
        format!("{} clients: {}", self.total_clients(), listing.join(", "))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Shared handle used by the coordinator tasks.
#[derive(Clone)]
pub struct BalancerHandle {
    inner: Arc<RwLock<Balancer>>,
}

impl BalancerHandle {
    pub fn new(min_available_workers: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Balancer::new(min_available_workers))),
        }
    }

    pub async fn register_worker(&self, port: u16, peer: PeerId) {
        self.inner.write().await.register_worker(port, peer);
    }

    pub async fn deregister_worker(&self, port: u16) -> Option<WorkerRecord> {
        self.inner.write().await.deregister_worker(port)
    }

    pub async fn deregister_peer_worker(&self, port: u16, peer: PeerId) -> Option<WorkerRecord> {
        self.inner.write().await.deregister_peer_worker(port, peer)
    }

    pub async fn update_load(&self, port: u16, clients: u32) -> bool {
        self.inner.write().await.update_load(port, clients)
    }

    pub async fn describe_load(&self) -> String {
        self.inner.read().await.describe_load()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Least-loaded worker, suspending the caller until the quorum is reached.
    pub async fn select_worker(&self) -> Option<WorkerRecord> {
        let pending = {
            let mut balancer = self.inner.write().await;
            match balancer.try_select() {
                Ok(selected) => return selected,
                Err(pending) => pending,
            }
        };

        // A closed sender means the balancer itself is gone
        if pending.await.is_err() {
            return None;
        }
        self.inner.read().await.least_loaded().cloned()
    }

    /// Connects to every tracked worker port and deregisters the ones that no
    /// longer accept connections. Checks run as independent tasks; the
    /// returned handles may be awaited but need not be.
    pub async fn refresh_online_status(&self, host: &str) -> Vec<JoinHandle<()>> {
        let ports = self.inner.read().await.ports();

        ports
            .into_iter()
            .map(|port| {
                let handle = self.clone();
                let host = host.to_string();
                tokio::spawn(async move {
                    let online = matches!(
                        timeout(LIVENESS_TIMEOUT, TcpStream::connect((host.as_str(), port))).await,
                        Ok(Ok(_))
                    );
                    if !online {
                        warn!("Worker {} is not accepting connections", port);
                        handle.deregister_worker(port).await;
                    }
                })
            })
            .collect()
    }
}
