//! Claim ingress: per-connection session state and the checks a claim must
//! pass before it is forwarded to the drop engine.

use crate::coordination::PeerLink;
use crate::error::ClaimError;
use shared::{Claim, CoordMessage, DropId, LobbyPlayer, PLACEHOLDER_PLAYER_NAME};
use std::time::Instant;

/// A claim attempt as received from the end user.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub drop_id: DropId,
    pub claim_ticket: u32,
    pub timeout_collection: bool,
    /// Wall-clock receipt time in milliseconds
    pub received_at: u64,
    /// Monotonic receipt time, start of the verify delay
    pub received: Instant,
}

/// What the worker knows about one end-user connection.
#[derive(Debug, Default)]
pub struct Session {
    user_id: Option<String>,
    login_name: String,
    drop_banned: bool,
    lobby_key: Option<String>,
    lobby_snapshot: Option<Vec<LobbyPlayer>>,
    forwarder: Option<PeerLink>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login(&mut self, user_id: String, name: String, drop_banned: bool) {
        self.user_id = Some(user_id);
        self.login_name = name;
        self.drop_banned = drop_banned;
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.login_name
    }

    pub fn set_forwarder(&mut self, link: PeerLink) {
        self.forwarder = Some(link);
    }

    /// Joining a lobby invalidates the snapshot of the previous one.
    pub fn join_lobby(&mut self, lobby_key: String) {
        self.lobby_key = Some(lobby_key);
        self.lobby_snapshot = None;
    }

    pub fn leave_lobby(&mut self) {
        self.lobby_key = None;
        self.lobby_snapshot = None;
    }

    pub fn report_lobby(&mut self, players: Vec<LobbyPlayer>) {
        self.lobby_snapshot = Some(players);
    }

    /// Validates a claim, assembles it and hands it to the forwarder.
    pub fn claim_drop(
        &self,
        request: ClaimRequest,
        worker_port: u16,
        worker_eventloop_latency_ms: f64,
    ) -> Result<Claim, ClaimError> {
        let user_id = self.user_id.as_ref().ok_or(ClaimError::NotLoggedIn)?;
        if self.drop_banned {
            return Err(ClaimError::DropBanned);
        }
        if request.timeout_collection {
            return Err(ClaimError::TimeoutCollection);
        }
        let forwarder = self.forwarder.as_ref().ok_or(ClaimError::NoForwarder)?;
        let lobby_key = self.lobby_key.as_ref().ok_or(ClaimError::NoLobby)?;
        let snapshot = self
            .lobby_snapshot
            .as_ref()
            .ok_or(ClaimError::NoLobbySnapshot)?;

        let username = snapshot
            .iter()
            .find(|player| player.sender)
            .map(|player| player.name.clone())
            .unwrap_or_else(|| PLACEHOLDER_PLAYER_NAME.to_string());

        let claim = Claim {
            drop_id: request.drop_id,
            lobby_key: lobby_key.clone(),
            username,
            user_id: user_id.clone(),
            claim_ticket: request.claim_ticket,
            claim_timestamp: request.received_at,
            claim_verify_delay_ms: request.received.elapsed().as_secs_f64() * 1000.0,
            worker_eventloop_latency_ms,
            worker_port,
        };
        forwarder.send(CoordMessage::Claim(claim.clone()));
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Hub, HubEvent};

    fn request(timeout_collection: bool) -> ClaimRequest {
        ClaimRequest {
            drop_id: DropId(11),
            claim_ticket: 4,
            timeout_collection,
            received_at: 123_456,
            received: Instant::now(),
        }
    }

    fn players(sender: Option<&str>) -> Vec<LobbyPlayer> {
        let mut players = vec![LobbyPlayer {
            name: "Other".to_string(),
            sender: false,
        }];
        if let Some(name) = sender {
            players.push(LobbyPlayer {
                name: name.to_string(),
                sender: true,
            });
        }
        players
    }

    async fn ready_session(hub: &Hub) -> (Session, crate::coordination::PeerConnection) {
        let peer = hub.connect().await;
        let mut session = Session::new();
        session.login("u1".to_string(), "alice".to_string(), false);
        session.set_forwarder(peer.link().clone());
        session.join_lobby("lobby-1".to_string());
        session.report_lobby(players(Some("Alice")));
        (session, peer)
    }

    #[tokio::test]
    async fn test_valid_claim_is_forwarded() {
        let (hub, mut events) = Hub::new();
        let (session, peer) = ready_session(&hub).await;
        let _ = events.recv().await;

        let claim = session.claim_drop(request(false), 8101, 2.5).unwrap();
        assert_eq!(claim.username, "Alice");
        assert_eq!(claim.lobby_key, "lobby-1");
        assert_eq!(claim.user_id, "u1");
        assert_eq!(claim.claim_ticket, 4);
        assert_eq!(claim.claim_timestamp, 123_456);
        assert_eq!(claim.worker_port, 8101);
        assert!(claim.claim_verify_delay_ms >= 0.0);

        assert_eq!(
            events.recv().await,
            Some(HubEvent::Message {
                peer: peer.id(),
                msg: CoordMessage::Claim(claim),
            })
        );
    }

    #[tokio::test]
    async fn test_missing_sender_uses_placeholder() {
        let (hub, _events) = Hub::new();
        let (mut session, _peer) = ready_session(&hub).await;
        session.report_lobby(players(None));

        let claim = session.claim_drop(request(false), 8100, 0.0).unwrap();
        assert_eq!(claim.username, PLACEHOLDER_PLAYER_NAME);
    }

    #[tokio::test]
    async fn test_banned_user_rejected() {
        let (hub, _events) = Hub::new();
        let (mut session, _peer) = ready_session(&hub).await;
        session.login("u1".to_string(), "alice".to_string(), true);

        assert_eq!(
            session.claim_drop(request(false), 8100, 0.0),
            Err(ClaimError::DropBanned)
        );
    }

    #[tokio::test]
    async fn test_timeout_collection_rejected() {
        let (hub, _events) = Hub::new();
        let (session, _peer) = ready_session(&hub).await;

        assert_eq!(
            session.claim_drop(request(true), 8100, 0.0),
            Err(ClaimError::TimeoutCollection)
        );
    }

    #[tokio::test]
    async fn test_lobby_requirements() {
        let (hub, _events) = Hub::new();
        let (mut session, _peer) = ready_session(&hub).await;

        session.join_lobby("lobby-2".to_string());
        assert_eq!(
            session.claim_drop(request(false), 8100, 0.0),
            Err(ClaimError::NoLobbySnapshot)
        );

        session.leave_lobby();
        assert_eq!(
            session.claim_drop(request(false), 8100, 0.0),
            Err(ClaimError::NoLobby)
        );
    }

    #[test]
    fn test_session_without_login_or_forwarder() {
        let mut session = Session::new();
        assert_eq!(
            session.claim_drop(request(false), 8100, 0.0),
            Err(ClaimError::NotLoggedIn)
        );

        session.login("u2".to_string(), "bob".to_string(), false);
        session.join_lobby("lobby".to_string());
        session.report_lobby(players(Some("Bob")));
        assert_eq!(
            session.claim_drop(request(false), 8100, 0.0),
            Err(ClaimError::NoForwarder)
        );
    }
}
