//! Drop lifecycle engine.
//!
//! One cycle per drop, always in this order:
//!
//! 1. **Discovery**: poll the drop store until an unclaimed drop that has not
//!    yet matured shows up.
//! 2. **Maturing**: sleep until the drop's `valid_from`.
//! 3. **Dispatching**: broadcast `NextDrop` and wait for the drop server's
//!    dispatch confirmation, buffering claims that arrive meanwhile.
//! 4. **Arbitrating**: for a fixed window, process buffered claims in arrival
//!    order. League claims are recorded with a weight and arbitration goes
//!    on; the first valid regular claim wins the drop and ends acceptance.
//! 5. **Reporting**: after a settle period, broadcast the ranked report.
//!
//! All per-cycle state lives in [`CycleState`], built fresh for every cycle.
//! A failed cycle is logged and the engine starts over at discovery.

use crate::config::EngineConfig;
use crate::coordination::Hub;
use crate::error::EngineError;
use crate::store::DropStore;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use shared::{
    classify, timestamp_ms, Claim, ClaimKind, CoordMessage, DispatchRecord, DropId,
    LeagueThreshold, ScheduledDrop, CLAIM_BUFFER_IDLE_MS, REGULAR_CLAIM_WEIGHT,
};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};

/// Coordination traffic routed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Claim(Claim),
    DispatchConfirmed(DispatchRecord),
}

/// Receives the ranked report of every cycle that accepted a claim.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn publish(&self, drop_id: DropId, ranks: &[String]);
}

/// Why a claim was not accepted during arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    WrongDrop { current: DropId },
    AlreadyCaught,
    AlreadyCredited,
    BeforeDispatch,
    DropClaimed,
    StoreRefused,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::WrongDrop { current } => write!(f, "not the current drop {}", current),
            Rejection::AlreadyCaught => write!(f, "drop already caught this cycle"),
            Rejection::AlreadyCredited => write!(f, "user already credited this cycle"),
            Rejection::BeforeDispatch => write!(f, "claimed before the drop was dispatched"),
            Rejection::DropClaimed => write!(f, "drop is no longer open"),
            Rejection::StoreRefused => write!(f, "store refused the claim"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedClaim {
    pub claim: Claim,
    pub kind: ClaimKind,
}

impl AcceptedClaim {
    pub fn elapsed_ms(&self, dispatch_timestamp: u64) -> i64 {
        self.claim.claim_timestamp as i64 - dispatch_timestamp as i64
    }
}

/// State owned by a single drop cycle.
#[derive(Debug)]
pub struct CycleState {
    pub drop: ScheduledDrop,
    /// Wall-clock time the `NextDrop` broadcast went out
    pub listen_start: u64,
    pub dispatch: DispatchRecord,
    pub buffer: VecDeque<Claim>,
    pub threshold: LeagueThreshold,
    credited: HashSet<String>,
    accepted: Vec<AcceptedClaim>,
    caught: bool,
}

impl CycleState {
    pub fn new(
        drop: ScheduledDrop,
        listen_start: u64,
        dispatch: DispatchRecord,
        buffer: VecDeque<Claim>,
        threshold: LeagueThreshold,
    ) -> Self {
        Self {
            drop,
            listen_start,
            dispatch,
            buffer,
            threshold,
            credited: HashSet::new(),
            accepted: Vec::new(),
            caught: false,
        }
    }

    /// Checks that need no store access.
    pub fn screen(&self, claim: &Claim) -> Result<(), Rejection> {
        if claim.drop_id != self.drop.id {
            return Err(Rejection::WrongDrop {
                current: self.drop.id,
            });
        }
        if self.caught {
            return Err(Rejection::AlreadyCaught);
        }
        if self.credited.contains(&claim.user_id) {
            return Err(Rejection::AlreadyCredited);
        }
        // Only a client that guessed the drop id can claim before the notice went out
        if claim.claim_timestamp < self.dispatch.dispatch_timestamp {
            return Err(Rejection::BeforeDispatch);
        }
        Ok(())
    }

    pub fn classify(&self, claim: &Claim) -> ClaimKind {
        classify(
            claim.claim_timestamp,
            self.dispatch.dispatch_timestamp,
            self.threshold,
        )
    }

    /// Marks a claim as accepted. A regular claim closes the drop.
    pub fn record(&mut self, claim: Claim, kind: ClaimKind) -> AcceptedClaim {
        self.credited.insert(claim.user_id.clone());
        if kind == ClaimKind::Regular {
            self.caught = true;
        }
        let accepted = AcceptedClaim { claim, kind };
        self.accepted.push(accepted.clone());
        accepted
    }

    pub fn accepted(&self) -> &[AcceptedClaim] {
        &self.accepted
    }

    pub fn is_caught(&self) -> bool {
        self.caught
    }

    /// One line per accepted claim, fastest first.
    pub fn rank(&self) -> Vec<String> {
        let dispatch_ts = self.dispatch.dispatch_timestamp;
        let mut ordered: Vec<&AcceptedClaim> = self.accepted.iter().collect();
        // Stable sort keeps arrival order for equal times
        ordered.sort_by_key(|accepted| accepted.elapsed_ms(dispatch_ts));

        let listen_delay = dispatch_ts as i64 - self.listen_start as i64;
        ordered
            .iter()
            .enumerate()
            .map(|(index, accepted)| {
                let claim = &accepted.claim;
                let (position, socket_delay) = match self.dispatch.lookup(claim.claim_ticket) {
                    Some((position, delay)) => (position.to_string(), format!("{:.1}", delay)),
                    None => ("?".to_string(), "?".to_string()),
                };
                let marker = if accepted.kind.is_league() { " league" } else { "" };

                format!(
                    "#{} {} ({}) {}ms{} | listen->dispatch {}ms | socket #{} +{}ms | worker {} lag {:.1}ms | verify {:.1}ms",
                    index + 1,
                    claim.username,
                    claim.lobby_key,
                    accepted.elapsed_ms(dispatch_ts),
                    marker,
                    listen_delay,
                    position,
                    socket_delay,
                    claim.worker_port,
                    claim.worker_eventloop_latency_ms,
                    claim.claim_verify_delay_ms,
                )
            })
            .collect()
    }
}

/// Result of a completed cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub drop_id: DropId,
    pub accepted: Vec<AcceptedClaim>,
    pub ranks: Vec<String>,
}

pub struct DropEngine<S: DropStore + ?Sized> {
    store: Arc<S>,
    hub: Hub,
    inbox: mpsc::UnboundedReceiver<EngineEvent>,
    config: EngineConfig,
    sink: Option<Arc<dyn ReportSink>>,
}

impl<S: DropStore + ?Sized> DropEngine<S> {
    pub fn new(
        store: Arc<S>,
        hub: Hub,
        inbox: mpsc::UnboundedReceiver<EngineEvent>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            hub,
            inbox,
            config,
            sink: None,
        }
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Runs cycles forever. A failed cycle never stops the engine.
    pub async fn run(mut self) {
        info!("Drop engine started");
        loop {
            match self.run_cycle().await {
                Ok(outcome) => {
                    info!(
                        "Drop {} finished with {} accepted claims",
                        outcome.drop_id,
                        outcome.accepted.len()
                    );
                }
                Err(e) => {
                    error!("Drop cycle failed, restarting discovery: {}", e);
                    sleep(self.config.discovery_interval).await;
                }
            }
        }
    }

    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, EngineError> {
        let (drop, until_valid) = self.discover().await;
        info!("Next drop {} matures in {}ms", drop.id, until_valid.as_millis());
        sleep(until_valid).await;

        let (listen_start, dispatch, buffer) = self.dispatch(&drop).await?;
        let threshold = LeagueThreshold::draw(
            self.config.league_threshold_ms,
            self.config.league_jitter_ms,
            &mut rand::thread_rng(),
        );
        let mut cycle = CycleState::new(drop, listen_start, dispatch, buffer, threshold);

        self.arbitrate(&mut cycle).await?;
        self.report(cycle).await
    }

    /// Polls until an unclaimed drop with a non-negative time until valid
    /// appears. Store errors count as "no drop".
    async fn discover(&self) -> (ScheduledDrop, Duration) {
        let mut poll = interval(self.config.discovery_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            poll.tick().await;

            match self.store.next_open_drop().await {
                Ok(Some(drop)) if !drop.is_claimed() => {
                    let until_valid = drop.time_until_valid(timestamp_ms());
                    if until_valid >= 0 {
                        return (drop, Duration::from_millis(until_valid as u64));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Drop store poll failed: {}", e),
            }
        }
    }

    /// Broadcasts the drop and waits for the matching dispatch confirmation.
    async fn dispatch(
        &mut self,
        drop: &ScheduledDrop,
    ) -> Result<(u64, DispatchRecord, VecDeque<Claim>), EngineError> {
        let mut stale = 0;
        while self.inbox.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} stale events before dispatching {}", stale, drop.id);
        }

        let listen_start = timestamp_ms();
        let peers = self
            .hub
            .broadcast(CoordMessage::NextDrop {
                drop_id: drop.id,
                event_drop_id: drop.event_drop_id,
            })
            .await;
        info!("Broadcast drop {} to {} peers", drop.id, peers);

        let mut buffer = VecDeque::new();
        loop {
            match self.inbox.recv().await {
                Some(EngineEvent::Claim(claim)) => buffer.push_back(claim),
                Some(EngineEvent::DispatchConfirmed(record)) if record.drop_id == drop.id => {
                    info!(
                        "Drop {} dispatched to {} sockets at {}",
                        drop.id,
                        record.dispatch_delays.len(),
                        record.dispatch_timestamp
                    );
                    return Ok((listen_start, record, buffer));
                }
                Some(EngineEvent::DispatchConfirmed(record)) => {
                    debug!("Ignoring dispatch confirmation for drop {}", record.drop_id);
                }
                None => return Err(EngineError::InboxClosed),
            }
        }
    }

    /// Processes claims in arrival order until the window closes.
    async fn arbitrate(&mut self, cycle: &mut CycleState) -> Result<(), EngineError> {
        let deadline = Instant::now() + self.config.arbitration_window;
        let idle = Duration::from_millis(CLAIM_BUFFER_IDLE_MS);

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let claim = match cycle.buffer.pop_front() {
                Some(claim) => claim,
                None => match timeout(idle.min(deadline - now), self.inbox.recv()).await {
                    Ok(Some(EngineEvent::Claim(claim))) => claim,
                    Ok(Some(EngineEvent::DispatchConfirmed(_))) | Err(_) => continue,
                    Ok(None) => return Err(EngineError::InboxClosed),
                },
            };

            let user = claim.username.clone();
            match self.consider(cycle, claim).await {
                Ok(accepted) => info!(
                    "Accepted {} claim by {} on drop {}",
                    if accepted.kind.is_league() { "league" } else { "regular" },
                    user,
                    cycle.drop.id
                ),
                Err(rejection) => info!("Rejected claim by {}: {}", user, rejection),
            }
        }
        Ok(())
    }

    async fn consider(&self, cycle: &mut CycleState, claim: Claim) -> Result<AcceptedClaim, Rejection> {
        cycle.screen(&claim)?;

        // Another claim may have resolved the drop after this one was buffered
        match self.store.get_drop(claim.drop_id).await {
            Ok(Some(drop)) if !drop.is_claimed() => {}
            Ok(_) => return Err(Rejection::DropClaimed),
            Err(e) => {
                warn!("Drop store lookup failed: {}", e);
                return Err(Rejection::DropClaimed);
            }
        }

        let kind = cycle.classify(&claim);
        let (league_weight, reward) = match kind {
            ClaimKind::League { weight } => (Some(weight), weight),
            ClaimKind::Regular => (None, REGULAR_CLAIM_WEIGHT),
        };

        match self
            .store
            .claim_drop(
                &claim.lobby_key,
                &claim.username,
                claim.drop_id,
                &claim.user_id,
                league_weight,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => return Err(Rejection::StoreRefused),
            Err(e) => {
                warn!("Persisting claim failed: {}", e);
                return Err(Rejection::StoreRefused);
            }
        }

        // The claim is persisted; a lost reward does not undo it
        match self
            .store
            .reward_user(&claim.user_id, cycle.drop.event_drop_id, reward)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("Reward for {} was not stored", claim.user_id),
            Err(e) => warn!("Rewarding {} failed: {}", claim.user_id, e),
        }

        let accepted = cycle.record(claim, kind);
        self.hub
            .broadcast(CoordMessage::ClearDrop {
                drop_id: cycle.drop.id,
                caught_lobby_key: accepted.claim.lobby_key.clone(),
                claim_ticket: accepted.claim.claim_ticket,
                caught_player: accepted.claim.username.clone(),
            })
            .await;
        Ok(accepted)
    }

    async fn report(&mut self, cycle: CycleState) -> Result<CycleOutcome, EngineError> {
        sleep(self.config.settle_period).await;

        while let Ok(event) = self.inbox.try_recv() {
            if let EngineEvent::Claim(claim) = event {
                info!(
                    "Rejected claim by {}: arrived after the window of drop {}",
                    claim.username, cycle.drop.id
                );
            }
        }

        let ranks = if cycle.accepted().is_empty() {
            info!("Drop {} closed without accepted claims", cycle.drop.id);
            Vec::new()
        } else {
            let ranks = cycle.rank();
            for line in &ranks {
                info!("Drop {} {}", cycle.drop.id, line);
            }
            self.hub
                .broadcast(CoordMessage::RankDrop {
                    drop_id: cycle.drop.id,
                    ranks: ranks.clone(),
                })
                .await;
            if let Some(sink) = &self.sink {
                sink.publish(cycle.drop.id, &ranks).await;
            }
            ranks
        };

        Ok(CycleOutcome {
            drop_id: cycle.drop.id,
            accepted: cycle.accepted,
            ranks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::PeerConnection;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use assert_approx_eq::assert_approx_eq;
    use shared::DispatchDelay;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;

    fn claim(drop_id: DropId, user: &str, ticket: u32, claim_timestamp: u64) -> Claim {
        Claim {
            drop_id,
            lobby_key: format!("lobby-{}", user),
            username: user.to_uppercase(),
            user_id: user.to_string(),
            claim_ticket: ticket,
            claim_timestamp,
            claim_verify_delay_ms: 0.2,
            worker_eventloop_latency_ms: 1.5,
            worker_port: 8100,
        }
    }

    fn record(drop_id: DropId, dispatch_timestamp: u64) -> DispatchRecord {
        DispatchRecord {
            drop_id,
            dispatch_timestamp,
            dispatch_delays: vec![
                DispatchDelay { claim_ticket: 1, delay_ms: 0.1 },
                DispatchDelay { claim_ticket: 2, delay_ms: 0.3 },
                DispatchDelay { claim_ticket: 3, delay_ms: 0.6 },
            ],
        }
    }

    fn cycle_for(drop_id: DropId, threshold_ms: u64) -> CycleState {
        CycleState::new(
            ScheduledDrop::new(drop_id, 0, 0),
            9_950,
            record(drop_id, 10_000),
            VecDeque::new(),
            LeagueThreshold::fixed(threshold_ms),
        )
    }

    fn config(league_threshold_ms: u64) -> EngineConfig {
        EngineConfig {
            league_threshold_ms,
            league_jitter_ms: 0,
            ..EngineConfig::default()
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        events: mpsc::UnboundedSender<EngineEvent>,
        observer: PeerConnection,
        cycle: JoinHandle<Result<CycleOutcome, EngineError>>,
    }

    async fn start_cycle(config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        start_cycle_on(Arc::clone(&store) as Arc<dyn DropStore>, store, config).await
    }

    /// Runs one cycle against `engine_store`; `store` is the backing memory store.
    async fn start_cycle_on(
        engine_store: Arc<dyn DropStore>,
        store: Arc<MemoryStore>,
        config: EngineConfig,
    ) -> Harness {
        let (hub, _hub_events) = Hub::new();
        let observer = hub.connect().await;
        let (events, inbox) = mpsc::unbounded_channel();

        let mut engine = DropEngine::new(engine_store, hub, inbox, config);
        let cycle = tokio::spawn(async move { engine.run_cycle().await });

        Harness {
            store,
            events,
            observer,
            cycle,
        }
    }

    /// Waits for the dispatch broadcast and confirms it, returning the dispatch timestamp.
    async fn confirm_dispatch(harness: &mut Harness, drop_id: DropId) -> u64 {
        match harness.observer.recv().await {
            Some(CoordMessage::NextDrop { drop_id: id, .. }) => assert_eq!(id, drop_id),
            other => panic!("Expected NextDrop, got {:?}", other),
        }
        let dispatch_timestamp = timestamp_ms();
        harness
            .events
            .send(EngineEvent::DispatchConfirmed(record(drop_id, dispatch_timestamp)))
            .unwrap();
        dispatch_timestamp
    }

    /// Number of upcoming calls that fail, per store operation.
    #[derive(Debug, Default)]
    struct Faults {
        get_drop: u32,
        claim_drop: u32,
        reward_errors: u32,
        reward_refusals: u32,
    }

    fn take(remaining: &mut u32) -> bool {
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }

    /// Memory store that fails selected calls.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        faults: Mutex<Faults>,
    }

    impl FlakyStore {
        fn new(inner: Arc<MemoryStore>, faults: Faults) -> Self {
            Self {
                inner,
                faults: Mutex::new(faults),
            }
        }
    }

    fn injected() -> StoreError {
        StoreError::Unavailable("injected fault".to_string())
    }

    #[async_trait]
    impl DropStore for FlakyStore {
        async fn next_open_drop(&self) -> Result<Option<ScheduledDrop>, StoreError> {
            self.inner.next_open_drop().await
        }

        async fn get_drop(&self, id: DropId) -> Result<Option<ScheduledDrop>, StoreError> {
            if take(&mut self.faults.lock().await.get_drop) {
                return Err(injected());
            }
            self.inner.get_drop(id).await
        }

        async fn claim_drop(
            &self,
            lobby_key: &str,
            player_name: &str,
            drop_id: DropId,
            user_id: &str,
            league_weight: Option<f64>,
        ) -> Result<bool, StoreError> {
            if take(&mut self.faults.lock().await.claim_drop) {
                return Err(injected());
            }
            self.inner
                .claim_drop(lobby_key, player_name, drop_id, user_id, league_weight)
                .await
        }

        async fn reward_user(&self, user_id: &str, event_drop_id: u32, weight: f64) -> Result<bool, StoreError> {
            let mut faults = self.faults.lock().await;
            if take(&mut faults.reward_errors) {
                return Err(injected());
            }
            if take(&mut faults.reward_refusals) {
                return Ok(false);
            }
            drop(faults);
            self.inner.reward_user(user_id, event_drop_id, weight).await
        }
    }

    async fn start_flaky_cycle(config: EngineConfig, faults: Faults) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(Arc::clone(&store), faults));
        start_cycle_on(flaky, store, config).await
    }

    fn drain_broadcasts(observer: &mut PeerConnection) -> Vec<CoordMessage> {
        let mut messages = Vec::new();
        while let Some(msg) = observer.try_recv() {
            messages.push(msg);
        }
        messages
    }

    #[test]
    fn test_screen_rejects_other_drops() {
        let cycle = cycle_for(DropId(2), 1000);
        let stale = claim(DropId(1), "u1", 1, 10_200);
        assert_eq!(
            cycle.screen(&stale),
            Err(Rejection::WrongDrop { current: DropId(2) })
        );
    }

    #[test]
    fn test_regular_claim_closes_cycle() {
        let mut cycle = cycle_for(DropId(1), 1000);
        let first = claim(DropId(1), "u1", 1, 11_500);
        assert_eq!(cycle.classify(&first), ClaimKind::Regular);
        cycle.record(first, ClaimKind::Regular);

        assert!(cycle.is_caught());
        let second = claim(DropId(1), "u2", 2, 11_600);
        assert_eq!(cycle.screen(&second), Err(Rejection::AlreadyCaught));
    }

    #[test]
    fn test_league_claims_keep_cycle_open() {
        let mut cycle = cycle_for(DropId(1), 1000);
        for (i, user) in ["u1", "u2", "u3"].iter().enumerate() {
            let c = claim(DropId(1), user, i as u32 + 1, 10_300 + i as u64 * 100);
            assert!(cycle.screen(&c).is_ok());
            let kind = cycle.classify(&c);
            assert!(kind.is_league());
            cycle.record(c, kind);
        }
        assert!(!cycle.is_caught());
        assert_eq!(cycle.accepted().len(), 3);
    }

    #[test]
    fn test_duplicate_user_rejected_regardless_of_kind() {
        let mut cycle = cycle_for(DropId(1), 1000);
        let league = claim(DropId(1), "u1", 1, 10_100);
        let kind = cycle.classify(&league);
        cycle.record(league, kind);

        let again = claim(DropId(1), "u1", 1, 12_000);
        assert_eq!(cycle.screen(&again), Err(Rejection::AlreadyCredited));
    }

    #[test]
    fn test_claim_stamped_before_dispatch_rejected() {
        let cycle = cycle_for(DropId(1), 1000);
        let early = claim(DropId(1), "guesser", 1, 9_990);
        assert_eq!(cycle.screen(&early), Err(Rejection::BeforeDispatch));

        let on_time = claim(DropId(1), "u1", 1, 10_000);
        assert!(cycle.screen(&on_time).is_ok());
    }

    #[test]
    fn test_league_boundary_uses_cycle_threshold() {
        let cycle = cycle_for(DropId(1), 1000);
        assert!(cycle.classify(&claim(DropId(1), "a", 1, 10_900)).is_league());
        assert_eq!(cycle.classify(&claim(DropId(1), "b", 1, 11_100)), ClaimKind::Regular);
    }

    #[test]
    fn test_rank_orders_by_elapsed_and_annotates() {
        let mut cycle = cycle_for(DropId(1), 1000);
        let slow = claim(DropId(1), "slow", 3, 11_400);
        let fast = claim(DropId(1), "fast", 2, 10_250);
        let unknown = claim(DropId(1), "odd", 99, 10_600);

        let kind = cycle.classify(&slow);
        cycle.record(slow, kind);
        let kind = cycle.classify(&fast);
        cycle.record(fast, kind);
        let kind = cycle.classify(&unknown);
        cycle.record(unknown, kind);

        let ranks = cycle.rank();
        assert_eq!(ranks.len(), 3);
        assert_eq!(
            ranks[0],
            "#1 FAST (lobby-fast) 250ms league | listen->dispatch 50ms | socket #2 +0.3ms | worker 8100 lag 1.5ms | verify 0.2ms"
        );
        assert!(ranks[1].starts_with("#2 ODD (lobby-odd) 600ms league"));
        assert!(ranks[1].contains("socket #? +?ms"));
        assert!(ranks[2].starts_with("#3 SLOW (lobby-slow) 1400ms |"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_regular_claim_wins() {
        let mut harness = start_cycle(config(100)).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 1000, 0).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u1", 1, t + 200)))
            .unwrap();
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u2", 2, t + 300)))
            .unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].claim.user_id, "u1");
        assert_eq!(outcome.accepted[0].kind, ClaimKind::Regular);

        let stored = harness.store.get_drop(drop.id).await.unwrap().unwrap();
        assert_eq!(stored.caught_lobby_player_id, "u1");
        assert_approx_eq!(harness.store.reward("u1", 0).await, 1.0);
        assert_approx_eq!(harness.store.reward("u2", 0).await, 0.0);

        let broadcasts = drain_broadcasts(&mut harness.observer);
        assert_eq!(
            broadcasts[0],
            CoordMessage::ClearDrop {
                drop_id: drop.id,
                caught_lobby_key: "lobby-u1".to_string(),
                claim_ticket: 1,
                caught_player: "U1".to_string(),
            }
        );
        match &broadcasts[1] {
            CoordMessage::RankDrop { drop_id, ranks } => {
                assert_eq!(*drop_id, drop.id);
                assert_eq!(ranks.len(), 1);
                assert!(ranks[0].starts_with("#1 U1"));
            }
            other => panic!("Expected RankDrop, got {:?}", other),
        }
        assert_eq!(broadcasts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_league_claims_co_accepted_then_regular_wins() {
        let mut harness = start_cycle(config(1000)).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 1000, 7).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        for (user, offset) in [("u1", 300), ("u2", 500), ("u3", 1500), ("u4", 1600)] {
            harness
                .events
                .send(EngineEvent::Claim(claim(drop.id, user, 1, t + offset)))
                .unwrap();
        }

        let outcome = harness.cycle.await.unwrap().unwrap();
        let users: Vec<&str> = outcome
            .accepted
            .iter()
            .map(|a| a.claim.user_id.as_str())
            .collect();
        assert_eq!(users, vec!["u1", "u2", "u3"]);
        assert!(outcome.accepted[0].kind.is_league());
        assert!(outcome.accepted[1].kind.is_league());
        assert_eq!(outcome.accepted[2].kind, ClaimKind::Regular);

        let league = harness.store.league_claims(drop.id).await;
        assert_eq!(league.len(), 2);
        assert!(league[1].weight > league[0].weight);
        assert_approx_eq!(harness.store.reward("u3", 7).await, 1.0);
        assert_approx_eq!(harness.store.reward("u1", 7).await, league[0].weight);
        assert_approx_eq!(harness.store.reward("u2", 7).await, league[1].weight);
        assert!(harness.store.reward("u1", 7).await > 0.0);

        let clears = drain_broadcasts(&mut harness.observer)
            .into_iter()
            .filter(|msg| matches!(msg, CoordMessage::ClearDrop { .. }))
            .count();
        assert_eq!(clears, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_stale_claims_rejected() {
        let mut harness = start_cycle(config(1000)).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 500, 0).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        let events = &harness.events;
        events.send(EngineEvent::Claim(claim(DropId(1), "old", 1, t + 100))).unwrap();
        events.send(EngineEvent::Claim(claim(drop.id, "u1", 1, t + 200))).unwrap();
        events.send(EngineEvent::Claim(claim(drop.id, "u1", 1, t + 250))).unwrap();
        events.send(EngineEvent::Claim(claim(drop.id, "u1", 1, t + 2000))).unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].claim.claim_timestamp, t + 200);

        assert_eq!(harness.store.league_claims(drop.id).await.len(), 1);
        assert!(harness.store.league_claims(DropId(1)).await.is_empty());
        assert_approx_eq!(harness.store.reward("old", 0).await, 0.0);
        assert!(!harness.store.get_drop(drop.id).await.unwrap().unwrap().is_claimed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_dispatch_claim_neither_credited_nor_cleared() {
        let mut harness = start_cycle(config(1000)).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 500, 2).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "guesser", 1, t - 50)))
            .unwrap();
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "guesser", 1, t + 1200)))
            .unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].claim.claim_timestamp, t + 1200);
        assert_eq!(outcome.accepted[0].kind, ClaimKind::Regular);
        assert!(harness.store.league_claims(drop.id).await.is_empty());

        let clears = drain_broadcasts(&mut harness.observer)
            .into_iter()
            .filter(|msg| matches!(msg, CoordMessage::ClearDrop { .. }))
            .count();
        assert_eq!(clears, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_lookup_failure_rejects_only_that_claim() {
        let faults = Faults {
            get_drop: 1,
            ..Faults::default()
        };
        let mut harness = start_flaky_cycle(config(100), faults).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 500, 4).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u1", 1, t + 200)))
            .unwrap();
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u2", 2, t + 300)))
            .unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].claim.user_id, "u2");
        assert_eq!(
            harness.store.get_drop(drop.id).await.unwrap().unwrap().caught_lobby_player_id,
            "u2"
        );
        assert_approx_eq!(harness.store.reward("u1", 4).await, 0.0);
        assert_approx_eq!(harness.store.reward("u2", 4).await, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_persist_failure_rejects_only_that_claim() {
        let faults = Faults {
            claim_drop: 1,
            ..Faults::default()
        };
        let mut harness = start_flaky_cycle(config(100), faults).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 500, 4).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u1", 1, t + 200)))
            .unwrap();
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u2", 2, t + 300)))
            .unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        let users: Vec<&str> = outcome
            .accepted
            .iter()
            .map(|a| a.claim.user_id.as_str())
            .collect();
        assert_eq!(users, vec!["u2"]);
        assert_approx_eq!(harness.store.reward("u2", 4).await, 1.0);

        let clears: Vec<CoordMessage> = drain_broadcasts(&mut harness.observer)
            .into_iter()
            .filter(|msg| matches!(msg, CoordMessage::ClearDrop { .. }))
            .collect();
        assert_eq!(clears.len(), 1);
        assert!(matches!(&clears[0], CoordMessage::ClearDrop { claim_ticket: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reward_keeps_claim_accepted() {
        let faults = Faults {
            reward_refusals: 1,
            ..Faults::default()
        };
        let mut harness = start_flaky_cycle(config(1000), faults).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 500, 6).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u1", 1, t + 400)))
            .unwrap();
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u2", 2, t + 1400)))
            .unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        assert_eq!(outcome.accepted.len(), 2);
        assert!(outcome.accepted[0].kind.is_league());
        assert_eq!(outcome.accepted[1].kind, ClaimKind::Regular);

        assert_eq!(harness.store.league_claims(drop.id).await.len(), 1);
        assert_eq!(
            harness.store.get_drop(drop.id).await.unwrap().unwrap().caught_lobby_player_id,
            "u2"
        );
        assert_approx_eq!(harness.store.reward("u1", 6).await, 0.0);
        assert_approx_eq!(harness.store.reward("u2", 6).await, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reward_error_on_regular_claim_keeps_win() {
        let faults = Faults {
            reward_errors: 1,
            ..Faults::default()
        };
        let mut harness = start_flaky_cycle(config(100), faults).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 500, 6).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u1", 1, t + 200)))
            .unwrap();
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "u2", 2, t + 300)))
            .unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].claim.user_id, "u1");
        assert!(harness.store.get_drop(drop.id).await.unwrap().unwrap().is_claimed());
        assert_approx_eq!(harness.store.reward("u1", 6).await, 0.0);
        assert_eq!(outcome.ranks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_buffered_before_confirmation_are_kept() {
        let mut harness = start_cycle(config(100)).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 200, 0).await;

        match harness.observer.recv().await {
            Some(CoordMessage::NextDrop { .. }) => {}
            other => panic!("Expected NextDrop, got {:?}", other),
        }
        let t = timestamp_ms();
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "early", 1, t + 500)))
            .unwrap();
        harness
            .events
            .send(EngineEvent::DispatchConfirmed(record(DropId(1), t)))
            .unwrap();
        harness
            .events
            .send(EngineEvent::DispatchConfirmed(record(drop.id, t)))
            .unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].claim.user_id, "early");
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_after_window_is_not_accepted() {
        let mut harness = start_cycle(config(100)).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 200, 0).await;

        let t = confirm_dispatch(&mut harness, drop.id).await;
        sleep(Duration::from_millis(5500)).await;
        harness
            .events
            .send(EngineEvent::Claim(claim(drop.id, "late", 1, t + 5500)))
            .unwrap();

        let outcome = harness.cycle.await.unwrap().unwrap();
        assert!(outcome.accepted.is_empty());
        assert!(outcome.ranks.is_empty());
        assert!(!harness.store.get_drop(drop.id).await.unwrap().unwrap().is_claimed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_polls_until_drop_appears() {
        let mut harness = start_cycle(config(100)).await;

        sleep(Duration::from_secs(3)).await;
        assert!(!harness.cycle.is_finished());
        assert!(drain_broadcasts(&mut harness.observer).is_empty());

        let claimed = harness.store.schedule_drop(timestamp_ms() + 100, 0).await;
        harness
            .store
            .claim_drop("l", "X", claimed.id, "x", None)
            .await
            .unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(drain_broadcasts(&mut harness.observer).is_empty());

        let drop = harness.store.schedule_drop(timestamp_ms() + 100, 0).await;
        confirm_dispatch(&mut harness, drop.id).await;
        let outcome = harness.cycle.await.unwrap().unwrap();
        assert_eq!(outcome.drop_id, drop.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_due_drop_is_skipped() {
        let mut harness = start_cycle(config(100)).await;
        harness.store.schedule_drop(timestamp_ms().saturating_sub(60_000), 0).await;

        sleep(Duration::from_secs(2)).await;
        assert!(!harness.cycle.is_finished());
        assert!(drain_broadcasts(&mut harness.observer).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_during_discovery_is_survived() {
        let mut harness = start_cycle(config(100)).await;
        harness.store.set_unavailable(true).await;
        sleep(Duration::from_secs(1)).await;
        assert!(!harness.cycle.is_finished());

        harness.store.set_unavailable(false).await;
        let drop = harness.store.schedule_drop(timestamp_ms() + 100, 0).await;
        confirm_dispatch(&mut harness, drop.id).await;
        assert!(harness.cycle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbox_closed_fails_cycle() {
        let harness = start_cycle(config(100)).await;
        harness.store.schedule_drop(timestamp_ms() + 100, 0).await;
        drop(harness.events);

        let result = harness.cycle.await.unwrap();
        assert!(matches!(result, Err(EngineError::InboxClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_resumes_discovery_after_failed_cycle() {
        let store = Arc::new(MemoryStore::new());
        let (hub, _hub_events) = Hub::new();
        let mut observer = hub.connect().await;
        let (events, inbox) = mpsc::unbounded_channel::<EngineEvent>();
        drop(events);

        let engine = DropEngine::new(Arc::clone(&store), hub, inbox, config(100));
        let first = store.schedule_drop(timestamp_ms() + 100, 0).await;
        let running = tokio::spawn(engine.run());

        match observer.recv().await {
            Some(CoordMessage::NextDrop { drop_id, .. }) => assert_eq!(drop_id, first.id),
            other => panic!("Expected NextDrop, got {:?}", other),
        }

        // The first cycle fails on the closed inbox; the engine keeps going
        let second = store.schedule_drop(timestamp_ms() + 100, 0).await;
        match observer.recv().await {
            Some(CoordMessage::NextDrop { drop_id, .. }) => assert_eq!(drop_id, second.id),
            other => panic!("Expected NextDrop, got {:?}", other),
        }
        assert!(!running.is_finished());
        running.abort();
    }

    struct RecordingSink {
        published: Mutex<Vec<(DropId, Vec<String>)>>,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn publish(&self, drop_id: DropId, ranks: &[String]) {
            self.published.lock().await.push((drop_id, ranks.to_vec()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_sink_receives_ranks() {
        let store = Arc::new(MemoryStore::new());
        let (hub, _hub_events) = Hub::new();
        let mut observer = hub.connect().await;
        let (events, inbox) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink {
            published: Mutex::new(Vec::new()),
        });

        let mut engine = DropEngine::new(Arc::clone(&store), hub, inbox, config(100))
            .with_report_sink(sink.clone());
        let drop = store.schedule_drop(timestamp_ms() + 100, 0).await;
        let cycle = tokio::spawn(async move { engine.run_cycle().await });

        assert!(matches!(observer.recv().await, Some(CoordMessage::NextDrop { .. })));
        let t = timestamp_ms();
        events.send(EngineEvent::DispatchConfirmed(record(drop.id, t))).unwrap();
        events.send(EngineEvent::Claim(claim(drop.id, "u9", 3, t + 400))).unwrap();
        cycle.await.unwrap().unwrap();

        let published = sink.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, drop.id);
        assert!(published[0].1[0].contains("socket #3 +0.6ms"));
    }
}
