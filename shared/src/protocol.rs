use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque drop identifier. Ids are derived from the creation time and grow
/// monotonically, so a newer drop always compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DropId(pub u64);

impl fmt::Display for DropId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DropId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(DropId)
    }
}

/// A time-gated reward opportunity as held by the drop store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledDrop {
    pub id: DropId,
    /// Maturation time in milliseconds since the Unix epoch (UTC)
    pub valid_from: u64,
    /// 0 for a regular drop, otherwise the promotional event it belongs to
    pub event_drop_id: u32,
    /// Empty while unclaimed
    pub caught_lobby_player_id: String,
}

impl ScheduledDrop {
    pub fn new(id: DropId, valid_from: u64, event_drop_id: u32) -> Self {
        Self {
            id,
            valid_from,
            event_drop_id,
            caught_lobby_player_id: String::new(),
        }
    }

    pub fn is_claimed(&self) -> bool {
        !self.caught_lobby_player_id.is_empty()
    }

    /// Milliseconds until the drop matures; negative once it is past due.
    pub fn time_until_valid(&self, now_ms: u64) -> i64 {
        self.valid_from as i64 - now_ms as i64
    }
}

/// A user's attempt to win a drop, assembled by a worker and forwarded to
/// the drop engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub drop_id: DropId,
    pub lobby_key: String,
    pub username: String,
    pub user_id: String,
    /// Dispatch ticket the client received from the drop server
    pub claim_ticket: u32,
    /// Worker receipt time in milliseconds since the Unix epoch
    pub claim_timestamp: u64,
    pub claim_verify_delay_ms: f64,
    pub worker_eventloop_latency_ms: f64,
    pub worker_port: u16,
}

/// Send delay of a single socket during fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchDelay {
    pub claim_ticket: u32,
    pub delay_ms: f64,
}

/// Produced once per drop by the drop server after pushing the drop to every
/// socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub drop_id: DropId,
    pub dispatch_timestamp: u64,
    pub dispatch_delays: Vec<DispatchDelay>,
}

impl DispatchRecord {
    /// Finds the socket delay and 1-based dispatch position of a ticket.
    pub fn lookup(&self, claim_ticket: u32) -> Option<(usize, f64)> {
        self.dispatch_delays
            .iter()
            .position(|d| d.claim_ticket == claim_ticket)
            .map(|index| (index + 1, self.dispatch_delays[index].delay_ms))
    }
}

/// Coordination channel messages. `worker-disconnect` is observed by the hub
/// itself and is not a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordMessage {
    /// worker -> hub
    WorkerConnect { port: u16 },
    /// worker -> hub
    UpdateLoad { port: u16, clients: u32 },
    /// hub -> all
    NextDrop {
        drop_id: DropId,
        event_drop_id: u32,
    },
    /// drop server -> hub
    DispatchConfirmed(DispatchRecord),
    /// worker -> hub
    Claim(Claim),
    /// hub -> all
    ClearDrop {
        drop_id: DropId,
        caught_lobby_key: String,
        claim_ticket: u32,
        caught_player: String,
    },
    /// hub -> all
    RankDrop { drop_id: DropId, ranks: Vec<String> },
}

/// Player entry of a lobby snapshot reported by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyPlayer {
    pub name: String,
    /// Set on the entry describing the reporting client itself
    pub sender: bool,
}

/// Member record looked up at login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub name: String,
    pub drop_banned: bool,
}

/// End-user <-> worker protocol.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Login {
        user_id: String,
        name: String,
    },
    JoinLobby {
        lobby_key: String,
    },
    LeaveLobby,
    LobbyReport {
        players: Vec<LobbyPlayer>,
    },
    ClaimDrop {
        drop_id: DropId,
        claim_ticket: u32,
        /// Set when the client collects a drop automatically instead of by a user action
        timeout_collection: bool,
    },
    Disconnect,

    LoggedIn {
        worker_port: u16,
    },
    ClaimRejected {
        reason: String,
    },
    DropCleared {
        drop_id: DropId,
        caught_player: String,
        caught_lobby_key: String,
    },
    DropRanked {
        drop_id: DropId,
        ranks: Vec<String>,
    },
    Disconnected {
        reason: String,
    },
}
