//! Protocol types shared by the coordinator, workers, the drop server and
//! end-user clients.
//!
//! The data model (drops, claims, dispatch records), the coordination channel
//! messages, the end-user packet protocol, the raw dispatch wire format, the
//! league classification policy and the stream framing all live here so every
//! process agrees on them.

pub mod dispatch;
pub mod framing;
pub mod league;
pub mod protocol;

pub use dispatch::DispatchNotice;
pub use league::{classify, league_weight, ClaimKind, LeagueThreshold};
pub use protocol::{
    Claim, CoordMessage, DispatchDelay, DispatchRecord, DropId, LobbyPlayer, Member, Packet,
    ScheduledDrop,
};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Interval between drop store polls while waiting for the next drop.
pub const DISCOVERY_POLL_INTERVAL_MS: u64 = 100;
/// Length of the claim arbitration window, measured from dispatch confirmation.
pub const ARBITRATION_WINDOW_MS: u64 = 5000;
/// Extra wait after the window closes before the ranking is built.
pub const SETTLE_PERIOD_MS: u64 = 2000;
/// Claims faster than this (plus jitter) are league claims.
pub const LEAGUE_THRESHOLD_BASE_MS: u64 = 1000;
/// Upper bound of the per-cycle random jitter added to the league threshold.
pub const LEAGUE_JITTER_MS: u64 = 100;
/// Idle wait of the arbitration loop when no claim is buffered.
pub const CLAIM_BUFFER_IDLE_MS: u64 = 30;

/// Weight credited for a regular (exclusive) claim.
pub const REGULAR_CLAIM_WEIGHT: f64 = 1.0;

/// Name used for a claimer when the lobby snapshot carries no sender.
pub const PLACEHOLDER_PLAYER_NAME: &str = "Someone";

/// Current wall-clock time in milliseconds since the Unix epoch (UTC).
pub fn timestamp_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}
