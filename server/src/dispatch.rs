//! Drop server: pushes "drop is live" straight to every raw end-user socket.
//!
//! This path bypasses the worker sessions entirely. On `NextDrop` every
//! connected socket gets `"{dropID}:{eventDropID}:{ticket}\n"` with tickets
//! numbered from 1 in socket order, each send timed against one dispatch
//! start. Sends never wait for the client: a socket whose buffer is full
//! misses this drop, a socket that errored is dropped. The timings go back
//! to the hub as `DispatchConfirmed`.

use crate::coordination::PeerConnection;
use log::{debug, info, warn};
use shared::{timestamp_ms, CoordMessage, DispatchDelay, DispatchNotice, DispatchRecord, DropId};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Anything a dispatch notice can be pushed to without waiting.
///
/// `ErrorKind::WouldBlock` means the target is alive but cannot take the
/// notice now; any other error means it is gone.
pub trait DispatchTarget {
    fn try_send(&mut self, line: &[u8]) -> io::Result<()>;
}

impl DispatchTarget for OwnedWriteHalf {
    fn try_send(&mut self, line: &[u8]) -> io::Result<()> {
        let written = self.try_write(line)?;
        // The unsent tail is lost; the client discards the broken line
        if written < line.len() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("partial dispatch write ({} of {} bytes)", written, line.len()),
            ));
        }
        Ok(())
    }
}

/// Sends the notice to every target in key order. Busy targets are skipped
/// for this drop, targets whose send failed otherwise are removed.
pub fn fan_out<T: DispatchTarget>(
    targets: &mut BTreeMap<u64, T>,
    drop_id: DropId,
    event_drop_id: u32,
) -> DispatchRecord {
    let dispatch_timestamp = timestamp_ms();
    let start = Instant::now();
    let mut dispatch_delays = Vec::with_capacity(targets.len());
    let mut failed = Vec::new();

    for (index, (id, target)) in targets.iter_mut().enumerate() {
        let ticket = index as u32 + 1;
        let notice = DispatchNotice {
            drop_id,
            event_drop_id,
            ticket,
        };

        match target.try_send(notice.to_line().as_bytes()) {
            Ok(()) => dispatch_delays.push(DispatchDelay {
                claim_ticket: ticket,
                delay_ms: start.elapsed().as_secs_f64() * 1000.0,
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("Dispatch socket {} busy, skipping drop {}: {}", id, drop_id, e);
            }
            Err(e) => {
                warn!("Dispatch to socket {} failed: {}", id, e);
                failed.push(*id);
            }
        }
    }

    for id in failed {
        targets.remove(&id);
    }

    DispatchRecord {
        drop_id,
        dispatch_timestamp,
        dispatch_delays,
    }
}

/// Connected dispatch sockets, keyed by connection order.
#[derive(Clone, Default)]
pub struct SocketSet {
    inner: Arc<Mutex<BTreeMap<u64, OwnedWriteHalf>>>,
}

impl SocketSet {
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    async fn insert(&self, id: u64, writer: OwnedWriteHalf) {
        self.inner.lock().await.insert(id, writer);
    }

    async fn remove(&self, id: u64) {
        self.inner.lock().await.remove(&id);
    }

    async fn dispatch(&self, drop_id: DropId, event_drop_id: u32) -> DispatchRecord {
        let mut sockets = self.inner.lock().await;
        fan_out(&mut *sockets, drop_id, event_drop_id)
    }
}

pub struct DropServer {
    listener: TcpListener,
    sockets: SocketSet,
}

impl DropServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Drop server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            sockets: SocketSet::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sockets(&self) -> SocketSet {
        self.sockets.clone()
    }

    /// Accepts dispatch sockets and answers every `NextDrop` from the hub
    /// with a fan-out and its confirmation. Returns when the hub drops the peer.
    pub async fn run(self, mut peer: PeerConnection) {
        let DropServer { listener, sockets } = self;
        let acceptor = tokio::spawn(Self::accept_loop(listener, sockets.clone()));

        while let Some(msg) = peer.recv().await {
            match msg {
                CoordMessage::NextDrop {
                    drop_id,
                    event_drop_id,
                } => {
                    let record = sockets.dispatch(drop_id, event_drop_id).await;
                    info!(
                        "Dispatched drop {} to {} sockets",
                        drop_id,
                        record.dispatch_delays.len()
                    );
                    peer.send(CoordMessage::DispatchConfirmed(record));
                }
                other => debug!("Drop server ignoring {:?}", other),
            }
        }

        acceptor.abort();
        info!("Drop server disconnected from hub");
    }

    async fn accept_loop(listener: TcpListener, sockets: SocketSet) {
        let mut next_id = 0u64;
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    next_id += 1;
                    let id = next_id;
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to disable Nagle for {}: {}", addr, e);
                    }
                    let (reader, writer) = stream.into_split();
                    sockets.insert(id, writer).await;
                    debug!("Dispatch socket {} connected from {}", id, addr);

                    let sockets = sockets.clone();
                    tokio::spawn(async move {
                        Self::watch_socket(reader).await;
                        sockets.remove(id).await;
                        debug!("Dispatch socket {} closed", id);
                    });
                }
                Err(e) => {
                    warn!("Dispatch accept failed: {}", e);
                }
            }
        }
    }

    /// Reads until the client closes; anything the client sends is ignored.
    async fn watch_socket(mut reader: tokio::net::tcp::OwnedReadHalf) {
        let mut buffer = [0u8; 256];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}
