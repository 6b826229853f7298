//! Error types for the coordinator, workers and stores.

use shared::framing::FrameError;

/// Failure of a drop or member store call. Always treated as transient.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Reasons a claim is refused at the worker before it reaches arbitration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("user is banned from drops")]
    DropBanned,
    #[error("automated timeout collection is not a claim")]
    TimeoutCollection,
    #[error("connection has no claim forwarder")]
    NoForwarder,
    #[error("not in a lobby")]
    NoLobby,
    #[error("no lobby snapshot reported")]
    NoLobbySnapshot,
}

/// Failure that aborts a whole drop cycle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine inbox closed")]
    InboxClosed,
}

/// Failure serving a single end-user connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("session closed")]
    Closed,
}
