//! Drop and member store interfaces, plus an in-memory implementation.
//!
//! Persistence is an external collaborator; the engine and the workers only
//! depend on the traits. `MemoryStore` backs the binary and the tests.

use crate::error::StoreError;
use async_trait::async_trait;
use log::info;
use shared::{timestamp_ms, DropId, Member, ScheduledDrop};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[async_trait]
pub trait DropStore: Send + Sync {
    /// Newest scheduled drop. May already be claimed; callers check.
    async fn next_open_drop(&self) -> Result<Option<ScheduledDrop>, StoreError>;

    async fn get_drop(&self, id: DropId) -> Result<Option<ScheduledDrop>, StoreError>;

    /// Persists a claim. Without a league weight the claim resolves the drop
    /// and only succeeds while the drop is unclaimed; with a weight it is
    /// recorded next to the drop without resolving it.
    async fn claim_drop(
        &self,
        lobby_key: &str,
        player_name: &str,
        drop_id: DropId,
        user_id: &str,
        league_weight: Option<f64>,
    ) -> Result<bool, StoreError>;

    async fn reward_user(&self, user_id: &str, event_drop_id: u32, weight: f64) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait MemberStore: Send + Sync {
    async fn member(&self, user_id: &str) -> Result<Option<Member>, StoreError>;
}

/// A league claim recorded next to a drop.
#[derive(Debug, Clone, PartialEq)]
pub struct LeagueClaimRecord {
    pub drop_id: DropId,
    pub lobby_key: String,
    pub player_name: String,
    pub user_id: String,
    pub weight: f64,
}

#[derive(Debug, Default)]
struct MemoryState {
    drops: BTreeMap<DropId, ScheduledDrop>,
    league_claims: Vec<LeagueClaimRecord>,
    rewards: HashMap<(String, u32), f64>,
    members: HashMap<String, Member>,
    last_id: u64,
    unavailable: bool,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a drop with a time-derived id greater than every earlier id.
    pub async fn schedule_drop(&self, valid_from: u64, event_drop_id: u32) -> ScheduledDrop {
        let mut state = self.state.lock().await;
        let id = timestamp_ms().max(state.last_id + 1);
        state.last_id = id;

        let drop = ScheduledDrop::new(DropId(id), valid_from, event_drop_id);
        info!("Scheduled drop {} valid from {}", drop.id, valid_from);
        state.drops.insert(drop.id, drop.clone());
        drop
    }

    pub async fn add_member(&self, member: Member) {
        let mut state = self.state.lock().await;
        state.members.insert(member.user_id.clone(), member);
    }

    /// Makes every call fail with [`StoreError::Unavailable`] while set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn league_claims(&self, drop_id: DropId) -> Vec<LeagueClaimRecord> {
        let state = self.state.lock().await;
        state
            .league_claims
            .iter()
            .filter(|claim| claim.drop_id == drop_id)
            .cloned()
            .collect()
    }

    pub async fn reward(&self, user_id: &str, event_drop_id: u32) -> f64 {
        let state = self.state.lock().await;
        state
            .rewards
            .get(&(user_id.to_string(), event_drop_id))
            .copied()
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl DropStore for MemoryStore {
    async fn next_open_drop(&self) -> Result<Option<ScheduledDrop>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.drops.values().next_back().cloned())
    }

    async fn get_drop(&self, id: DropId) -> Result<Option<ScheduledDrop>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.drops.get(&id).cloned())
    }

    async fn claim_drop(
        &self,
        lobby_key: &str,
        player_name: &str,
        drop_id: DropId,
        user_id: &str,
        league_weight: Option<f64>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        match league_weight {
            Some(weight) => {
                if !state.drops.contains_key(&drop_id) {
                    return Ok(false);
                }
                state.league_claims.push(LeagueClaimRecord {
                    drop_id,
                    lobby_key: lobby_key.to_string(),
                    player_name: player_name.to_string(),
                    user_id: user_id.to_string(),
                    weight,
                });
                Ok(true)
            }
            None => match state.drops.get_mut(&drop_id) {
                Some(drop) if !drop.is_claimed() => {
                    drop.caught_lobby_player_id = user_id.to_string();
                    Ok(true)
                }
                _ => Ok(false),
            },
        }
    }

    async fn reward_user(&self, user_id: &str, event_drop_id: u32, weight: f64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        *state
            .rewards
            .entry((user_id.to_string(), event_drop_id))
            .or_insert(0.0) += weight;
        Ok(true)
    }
}

#[async_trait]
impl MemberStore for MemoryStore {
    async fn member(&self, user_id: &str) -> Result<Option<Member>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.members.get(user_id).cloned())
    }
}
