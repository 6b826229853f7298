//! Client networking: route lookup, worker session and dispatch socket.

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::framing::PacketCodec;
use shared::{DispatchNotice, DropId, LobbyPlayer, Packet};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

pub type ClientResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Longest route reply or dispatch line accepted.
const MAX_LINE_LEN: usize = 256;

/// Asks the route endpoint which worker port to use.
pub async fn resolve_worker(route_addr: &str) -> ClientResult<u16> {
    let stream = TcpStream::connect(route_addr).await?;
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let line = lines
        .next()
        .await
        .ok_or("route endpoint closed without a reply")??;

    let reply = line.trim();
    reply
        .parse::<u16>()
        .map_err(|_| format!("route endpoint refused: {:?}", reply).into())
}

/// Logged-in connection to a worker.
pub struct WorkerConnection {
    writer: FramedWrite<OwnedWriteHalf, PacketCodec>,
    incoming: mpsc::UnboundedReceiver<Packet>,
    port: u16,
}

impl WorkerConnection {
    /// Connects, logs in and waits for the worker to confirm.
    pub async fn connect(host: &str, port: u16, user_id: &str, name: &str) -> ClientResult<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut reader = FramedRead::new(reader, PacketCodec::new());
        let mut writer = FramedWrite::new(writer, PacketCodec::new());

        writer
            .send(Packet::Login {
                user_id: user_id.to_string(),
                name: name.to_string(),
            })
            .await?;

        match reader.next().await.transpose()? {
            Some(Packet::LoggedIn { worker_port }) => {
                info!("Logged in on worker {}", worker_port)
            }
            Some(other) => return Err(format!("unexpected login reply: {:?}", other).into()),
            None => return Err("worker closed during login".into()),
        }

        // Frames are read on their own task so the caller can select on them safely
        let (tx, incoming) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(packet) => {
                        if tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from worker: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            writer,
            incoming,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn send(&mut self, packet: Packet) -> ClientResult<()> {
        self.writer.send(packet).await?;
        Ok(())
    }

    /// Joins a lobby and reports its players, `name` being the local one.
    pub async fn join_lobby(&mut self, lobby_key: &str, name: &str) -> ClientResult<()> {
        self.send(Packet::JoinLobby {
            lobby_key: lobby_key.to_string(),
        })
        .await?;
        self.send(Packet::LobbyReport {
            players: vec![LobbyPlayer {
                name: name.to_string(),
                sender: true,
            }],
        })
        .await
    }

    pub async fn claim(&mut self, drop_id: DropId, claim_ticket: u32) -> ClientResult<()> {
        self.send(Packet::ClaimDrop {
            drop_id,
            claim_ticket,
            timeout_collection: false,
        })
        .await
    }

    /// Next packet from the worker; `None` once the connection closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.incoming.recv().await
    }
}

/// Raw socket to the drop server, yielding dispatch notices.
pub struct DispatchListener {
    lines: FramedRead<TcpStream, LinesCodec>,
}

impl DispatchListener {
    pub async fn connect(addr: &str) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            lines: FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN)),
        })
    }

    /// Next well-formed notice. Malformed lines are skipped.
    pub async fn next_notice(&mut self) -> ClientResult<Option<DispatchNotice>> {
        while let Some(line) = self.lines.next().await.transpose()? {
            match line.parse::<DispatchNotice>() {
                Ok(notice) => return Ok(Some(notice)),
                Err(e) => warn!("Ignoring malformed dispatch line {:?}: {}", line, e),
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct ClaimerConfig {
    pub route_addr: String,
    pub dispatch_addr: String,
    pub user_id: String,
    pub name: String,
    pub lobby_key: String,
    /// Artificial delay before answering a dispatch notice
    pub fake_ping_ms: u64,
    /// Stop after this many ranked drops
    pub max_drops: Option<usize>,
}

/// What this client saw of one drop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DropReport {
    pub ticket: Option<u32>,
    pub caught_player: Option<String>,
    pub caught_lobby_key: Option<String>,
    pub ranks: Vec<String>,
    pub rejections: Vec<String>,
}

/// Headless client that answers every dispatch notice with a claim.
pub struct Claimer {
    config: ClaimerConfig,
    reports: BTreeMap<DropId, DropReport>,
}

impl Claimer {
    pub fn new(config: ClaimerConfig) -> Self {
        Self {
            config,
            reports: BTreeMap::new(),
        }
    }

    pub fn reports(&self) -> &BTreeMap<DropId, DropReport> {
        &self.reports
    }

    /// Connects everything and claims drops until `max_drops` were ranked
    /// or a connection closes.
    pub async fn run(&mut self) -> ClientResult<()> {
        let port = resolve_worker(&self.config.route_addr).await?;
        let host = self
            .config
            .route_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        info!("Routed to worker {}:{}", host, port);

        let mut worker =
            WorkerConnection::connect(&host, port, &self.config.user_id, &self.config.name).await?;
        worker
            .join_lobby(&self.config.lobby_key, &self.config.name)
            .await?;

        let mut dispatch = DispatchListener::connect(&self.config.dispatch_addr).await?;
        info!("Listening for drops on {}", self.config.dispatch_addr);

        let mut ranked = 0usize;
        loop {
            if self.config.max_drops.map_or(false, |max| ranked >= max) {
                return Ok(());
            }

            tokio::select! {
                notice = dispatch.next_notice() => match notice? {
                    Some(notice) => {
                        debug!("Drop {} is live, ticket {}", notice.drop_id, notice.ticket);
                        if self.config.fake_ping_ms > 0 {
                            sleep(Duration::from_millis(self.config.fake_ping_ms)).await;
                        }
                        worker.claim(notice.drop_id, notice.ticket).await?;
                        self.reports.entry(notice.drop_id).or_default().ticket = Some(notice.ticket);
                    }
                    None => {
                        warn!("Drop server closed the dispatch socket");
                        return Ok(());
                    }
                },
                packet = worker.recv() => match packet {
                    Some(packet) => {
                        if self.handle_packet(packet) {
                            ranked += 1;
                        }
                    }
                    None => {
                        warn!("Worker {} closed the connection", worker.port());
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Records a worker packet. Returns true when it completed a drop.
    fn handle_packet(&mut self, packet: Packet) -> bool {
        match packet {
            Packet::DropCleared {
                drop_id,
                caught_player,
                caught_lobby_key,
            } => {
                info!("Drop {} caught by {} in {}", drop_id, caught_player, caught_lobby_key);
                let report = self.reports.entry(drop_id).or_default();
                report.caught_player = Some(caught_player);
                report.caught_lobby_key = Some(caught_lobby_key);
                false
            }
            Packet::DropRanked { drop_id, ranks } => {
                for rank in &ranks {
                    info!("Drop {}: {}", drop_id, rank);
                }
                self.reports.entry(drop_id).or_default().ranks = ranks;
                true
            }
            Packet::ClaimRejected { reason } => {
                warn!("Claim rejected: {}", reason);
                if let Some((_, report)) = self.reports.iter_mut().next_back() {
                    report.rejections.push(reason);
                }
                false
            }
            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                false
            }
            other => {
                warn!("Unexpected packet type: {:?}", other);
                false
            }
        }
    }
}
