//! Worker process: terminates end-user connections on one port.
//!
//! Each connection carries framed [`Packet`]s. The worker keeps a [`Session`]
//! per connection, validates claims through it and forwards them to the hub.
//! It announces itself with `WorkerConnect`, reports its connection count
//! with `UpdateLoad` on every connect and disconnect, and relays drop
//! results from the hub back to every session it serves.

use crate::coordination::{PeerConnection, PeerLink};
use crate::error::ConnectionError;
use crate::ingress::{ClaimRequest, Session};
use crate::store::MemberStore;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::framing::PacketCodec;
use shared::{timestamp_ms, CoordMessage, Packet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// How often the event loop lag is sampled.
pub const LAG_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Last measured event loop lag in milliseconds, shared across tasks.
#[derive(Debug, Default)]
pub struct LagGauge {
    bits: AtomicU64,
}

impl LagGauge {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, lag_ms: f64) {
        self.bits.store(lag_ms.to_bits(), Ordering::Relaxed);
    }

    /// Samples how late a fixed-period timer fires and records it.
    pub fn spawn_monitor(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let gauge = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                let scheduled = ticker.tick().await;
                gauge.set(scheduled.elapsed().as_secs_f64() * 1000.0);
            }
        })
    }
}

type SessionRegistry = Arc<RwLock<HashMap<u64, mpsc::UnboundedSender<Packet>>>>;

/// State shared by the worker and all of its connection tasks.
#[derive(Clone)]
struct WorkerContext {
    port: u16,
    members: Arc<dyn MemberStore>,
    link: PeerLink,
    sessions: SessionRegistry,
    lag: Arc<LagGauge>,
}

impl WorkerContext {
    async fn report_load(&self) {
        let clients = self.sessions.read().await.len() as u32;
        self.link.send(CoordMessage::UpdateLoad {
            port: self.port,
            clients,
        });
    }

    async fn relay(&self, packet: Packet) {
        let sessions = self.sessions.read().await;
        for (id, tx) in sessions.iter() {
            if tx.send(packet.clone()).is_err() {
                debug!("Session {} on worker {} already closing", id, self.port);
            }
        }
    }
}

pub struct Worker {
    listener: TcpListener,
    port: u16,
    members: Arc<dyn MemberStore>,
}

impl Worker {
    pub async fn bind(addr: &str, members: Arc<dyn MemberStore>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        info!("Worker listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            port,
            members,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serves connections until the hub drops this worker.
    pub async fn run(self, mut peer: PeerConnection) {
        let lag = Arc::new(LagGauge::default());
        let monitor = lag.spawn_monitor(LAG_SAMPLE_INTERVAL);

        let ctx = WorkerContext {
            port: self.port,
            members: self.members,
            link: peer.link().clone(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            lag,
        };
        peer.send(CoordMessage::WorkerConnect { port: ctx.port });

        let mut next_id = 0u64;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_id += 1;
                        let id = next_id;
                        debug!("Worker {} accepted connection {} from {}", ctx.port, id, addr);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, id, &ctx).await {
                                warn!("Connection {} on worker {} ended: {}", id, ctx.port, e);
                            }
                            ctx.sessions.write().await.remove(&id);
                            ctx.report_load().await;
                        });
                    }
                    Err(e) => warn!("Worker {} accept failed: {}", ctx.port, e),
                },
                msg = peer.recv() => match msg {
                    Some(CoordMessage::ClearDrop { drop_id, caught_lobby_key, caught_player, .. }) => {
                        ctx.relay(Packet::DropCleared { drop_id, caught_player, caught_lobby_key }).await;
                    }
                    Some(CoordMessage::RankDrop { drop_id, ranks }) => {
                        ctx.relay(Packet::DropRanked { drop_id, ranks }).await;
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        monitor.abort();
        let sessions = ctx.sessions.read().await;
        for tx in sessions.values() {
            let _ = tx.send(Packet::Disconnected {
                reason: "worker shutting down".to_string(),
            });
        }
        info!("Worker {} disconnected from hub", ctx.port);
    }
}

/// Runs one end-user connection: a writer task draining the outgoing queue
/// and the read loop on this task.
async fn serve_connection(
    stream: TcpStream,
    id: u64,
    ctx: &WorkerContext,
) -> Result<(), ConnectionError> {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to disable Nagle on connection {}: {}", id, e);
    }
    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, PacketCodec::new());
    let mut writer = FramedWrite::new(writer, PacketCodec::new());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Packet>();

    let writer_task = tokio::spawn(async move {
        while let Some(packet) = out_rx.recv().await {
            let closing = matches!(packet, Packet::Disconnected { .. });
            if let Err(e) = writer.send(packet).await {
                error!("Failed to send packet on connection {}: {}", id, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    ctx.sessions.write().await.insert(id, out_tx.clone());
    ctx.report_load().await;

    let mut session = Session::new();
    session.set_forwarder(ctx.link.clone());
    let result = read_loop(&mut reader, &mut session, &out_tx, ctx).await;

    drop(out_tx);
    ctx.sessions.write().await.remove(&id);
    let _ = writer_task.await;
    result
}

async fn read_loop(
    reader: &mut FramedRead<OwnedReadHalf, PacketCodec>,
    session: &mut Session,
    out: &mpsc::UnboundedSender<Packet>,
    ctx: &WorkerContext,
) -> Result<(), ConnectionError> {
    while let Some(frame) = reader.next().await {
        let packet = frame?;
        let received = Instant::now();
        match packet {
            Packet::Login { user_id, name } => {
                let banned = match ctx.members.member(&user_id).await {
                    Ok(Some(member)) => member.drop_banned,
                    Ok(None) => false,
                    Err(e) => {
                        warn!("Member lookup for {} failed: {}", user_id, e);
                        false
                    }
                };
                info!("User {} ({}) logged in on worker {}", name, user_id, ctx.port);
                session.login(user_id, name, banned);
                reply(out, Packet::LoggedIn {
                    worker_port: ctx.port,
                })?;
            }
            Packet::JoinLobby { lobby_key } => session.join_lobby(lobby_key),
            Packet::LeaveLobby => session.leave_lobby(),
            Packet::LobbyReport { players } => session.report_lobby(players),
            Packet::ClaimDrop {
                drop_id,
                claim_ticket,
                timeout_collection,
            } => {
                let request = ClaimRequest {
                    drop_id,
                    claim_ticket,
                    timeout_collection,
                    received_at: timestamp_ms(),
                    received,
                };
                match session.claim_drop(request, ctx.port, ctx.lag.get()) {
                    Ok(claim) => debug!(
                        "Forwarded claim on drop {} from {} (ticket {})",
                        claim.drop_id, claim.username, claim.claim_ticket
                    ),
                    Err(e) => {
                        debug!("Refused claim from {:?}: {}", session.user_id(), e);
                        reply(out, Packet::ClaimRejected {
                            reason: e.to_string(),
                        })?;
                    }
                }
            }
            Packet::Disconnect => {
                debug!("{} disconnected from worker {}", session.name(), ctx.port);
                return Ok(());
            }
            other => warn!("Unexpected packet from client: {:?}", other),
        }
    }
    Ok(())
}

fn reply(out: &mpsc::UnboundedSender<Packet>, packet: Packet) -> Result<(), ConnectionError> {
    out.send(packet).map_err(|_| ConnectionError::Closed)
}
