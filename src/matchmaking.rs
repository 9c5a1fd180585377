//! Skill-based matchmaking queue.
//!
//! Players wait in an in-memory queue ordered by join time. Each entry's
//! acceptable skill gap widens the longer it waits; two entries pair when their
//! gap fits the wider of their two tolerances. Pairing happens on join and on a
//! periodic sweep, and clients poll for the result.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::accounts;
use crate::api::AppState;
use crate::config::MatchmakingConfig;
use crate::board::Mark;
use crate::game;
use crate::types::*;

/// How long an uncollected match result stays available to pollers.
const PENDING_MATCH_TTL_SECS: i64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub user_id: Uuid,
    pub username: String,
    pub skill: i32,
    pub joined_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(user: &User, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            skill: user.skill,
            joined_at: now,
        }
    }

    fn waited_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.joined_at).num_seconds().max(0) as u64
    }

    /// Acceptable skill gap after waiting until `now`.
    pub fn tolerance(&self, cfg: &MatchmakingConfig, now: DateTime<Utc>) -> u32 {
        let widened = cfg.base_tolerance as u64 + cfg.tolerance_per_second as u64 * self.waited_secs(now);
        widened.min(cfg.max_tolerance as u64) as u32
    }

    pub fn accepts(&self, other: &Self, cfg: &MatchmakingConfig, now: DateTime<Utc>) -> bool {
        if self.user_id == other.user_id {
            return false;
        }
        let gap = self.skill.abs_diff(other.skill);
        gap <= self.tolerance(cfg, now).max(other.tolerance(cfg, now))
    }
}

/// Two matched entries; `first` waited longer and plays X.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub first: QueueEntry,
    pub second: QueueEntry,
}

impl Pairing {
    /// Order two entries by join time; ties keep the argument order.
    pub fn ordered(a: QueueEntry, b: QueueEntry) -> Self {
        if b.joined_at < a.joined_at {
            Self { first: b, second: a }
        } else {
            Self { first: a, second: b }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "state")]
pub enum QueueStatus {
    Idle,
    Queued {
        position: usize,
        waited_secs: u64,
        estimated_wait_secs: u64,
    },
    Matched {
        room_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Paired(Pairing),
    Queued { position: usize, estimated_wait_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MatchmakingError {
    #[error("already in the matchmaking queue")]
    AlreadyQueued,
    #[error("a match is already waiting for you")]
    AlreadyMatched,
    #[error("not in the matchmaking queue")]
    NotQueued,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub players_in_queue: usize,
    pub matches_made: u64,
    pub average_wait_secs: u64,
    pub queue: Vec<QueueEntry>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<QueueEntry>,
    /// user_id -> (room_id, matched_at)
    pending: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
    recent_waits: VecDeque<u64>,
    matches_made: u64,
}

pub struct Matchmaker {
    cfg: MatchmakingConfig,
    state: Mutex<State>,
}

impl Matchmaker {
    pub fn new(cfg: MatchmakingConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn average_wait(&self, state: &State) -> u64 {
        if state.recent_waits.is_empty() {
            return self.cfg.default_wait_seconds;
        }
        state.recent_waits.iter().sum::<u64>() / state.recent_waits.len() as u64
    }

    fn estimate(&self, state: &State, position: usize, waited: u64) -> u64 {
        let rounds = position.div_ceil(2) as u64;
        (self.average_wait(state) * rounds).saturating_sub(waited)
    }

    /// Index of the best opponent for `entry`: closest skill, then longest wait.
    fn best_opponent(&self, queue: &VecDeque<QueueEntry>, entry: &QueueEntry, now: DateTime<Utc>) -> Option<usize> {
        queue
            .iter()
            .enumerate()
            .filter(|(_, candidate)| entry.accepts(candidate, &self.cfg, now))
            .min_by_key(|(_, candidate)| (entry.skill.abs_diff(candidate.skill), candidate.joined_at))
            .map(|(i, _)| i)
    }

    fn pending_room(state: &State, user_id: Uuid, now: DateTime<Utc>) -> Option<Uuid> {
        state
            .pending
            .get(&user_id)
            .filter(|(_, at)| now - *at < Duration::seconds(PENDING_MATCH_TTL_SECS))
            .map(|(room, _)| *room)
    }

    pub fn join(&self, entry: QueueEntry, now: DateTime<Utc>) -> Result<JoinOutcome, MatchmakingError> {
        let mut state = self.lock();
        if state.queue.iter().any(|e| e.user_id == entry.user_id) {
            return Err(MatchmakingError::AlreadyQueued);
        }
        if Self::pending_room(&state, entry.user_id, now).is_some() {
            return Err(MatchmakingError::AlreadyMatched);
        }
        state.pending.remove(&entry.user_id);

        if let Some(idx) = self.best_opponent(&state.queue, &entry, now) {
            if let Some(opponent) = state.queue.remove(idx) {
                return Ok(JoinOutcome::Paired(Pairing::ordered(opponent, entry)));
            }
        }

        state.queue.push_back(entry);
        let position = state.queue.len();
        Ok(JoinOutcome::Queued {
            position,
            estimated_wait_secs: self.estimate(&state, position, 0),
        })
    }

    pub fn leave(&self, user_id: Uuid) -> Result<QueueEntry, MatchmakingError> {
        let mut state = self.lock();
        let idx = state
            .queue
            .iter()
            .position(|e| e.user_id == user_id)
            .ok_or(MatchmakingError::NotQueued)?;
        state.queue.remove(idx).ok_or(MatchmakingError::NotQueued)
    }

    /// Polling lookup. A pending match is handed out once.
    pub fn status(&self, user_id: Uuid, now: DateTime<Utc>) -> QueueStatus {
        let mut state = self.lock();
        if let Some(room_id) = Self::pending_room(&state, user_id, now) {
            state.pending.remove(&user_id);
            return QueueStatus::Matched { room_id };
        }
        match state.queue.iter().position(|e| e.user_id == user_id) {
            Some(idx) => {
                let waited = state.queue[idx].waited_secs(now);
                QueueStatus::Queued {
                    position: idx + 1,
                    waited_secs: waited,
                    estimated_wait_secs: self.estimate(&state, idx + 1, waited),
                }
            }
            None => QueueStatus::Idle,
        }
    }

    /// Pair every entry whose tolerance now admits an opponent, oldest first.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Pairing> {
        let mut state = self.lock();
        state
            .pending
            .retain(|_, (_, at)| now - *at < Duration::seconds(PENDING_MATCH_TTL_SECS));

        let mut pairings = Vec::new();
        let mut i = 0;
        while i < state.queue.len() {
            let entry = state.queue[i].clone();
            match self.best_opponent(&state.queue, &entry, now) {
                Some(j) => {
                    let (hi, lo) = if i > j { (i, j) } else { (j, i) };
                    let later = state.queue.remove(hi);
                    let earlier = state.queue.remove(lo);
                    if let (Some(a), Some(b)) = (earlier, later) {
                        pairings.push(Pairing::ordered(a, b));
                    }
                    i = lo;
                }
                None => i += 1,
            }
        }
        pairings
    }

    /// Record a started game so both players can collect it.
    pub fn record_match(&self, pairing: &Pairing, room_id: Uuid, now: DateTime<Utc>) {
        let mut state = self.lock();
        for entry in [&pairing.first, &pairing.second] {
            state.pending.insert(entry.user_id, (room_id, now));
            let waited = entry.waited_secs(now);
            state.recent_waits.push_back(waited);
        }
        while state.recent_waits.len() > self.cfg.history_size.max(1) {
            state.recent_waits.pop_front();
        }
        state.matches_made += 1;
    }

    /// Put an entry back at the head of the queue, keeping its wait time.
    pub fn requeue_front(&self, entry: QueueEntry) {
        let mut state = self.lock();
        if !state.queue.iter().any(|e| e.user_id == entry.user_id) {
            state.queue.push_front(entry);
        }
    }

    pub fn clear_pending(&self, user_id: Uuid) {
        self.lock().pending.remove(&user_id);
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            players_in_queue: state.queue.len(),
            matches_made: state.matches_made,
            average_wait_secs: self.average_wait(&state),
            queue: state.queue.iter().cloned().collect(),
        }
    }
}

// ─── Orchestration ────────────────────────────────────────────────

/// Charge both players, open a ranked room, and notify them. On an energy
/// failure the player who could not pay is dropped and the other re-queued.
pub fn start_match(state: &AppState, pairing: Pairing, now: DateTime<Utc>) -> Option<Uuid> {
    let Pairing { first, second } = pairing.clone();

    if let Err((who, err)) = accounts::consume_pair(&state.store, &state.config, first.user_id, second.user_id, now) {
        let (dropped, kept) = if who == first.user_id { (first, second) } else { (second, first) };
        tracing::info!("Dropping {} from queue: {}", dropped.username, err);
        state.hub.send(dropped.user_id, ServerMsg::QueueDropped {
            message: "Not enough energy to start a game".to_string(),
        });
        state.matchmaker.requeue_front(kept);
        return None;
    }

    let handle = game::create_room(
        state.room_ctx(),
        RoomKind::Ranked,
        &[
            (first.user_id, first.username.clone()),
            (second.user_id, second.username.clone()),
        ],
    );
    state.matchmaker.record_match(&pairing, handle.room_id, now);

    for (me, opponent, mark) in [
        (&first, &second, Mark::X),
        (&second, &first, Mark::O),
    ] {
        if let Some(opponent) = state.store.user(opponent.user_id) {
            state.hub.send(me.user_id, ServerMsg::Matched {
                room_id: handle.room_id,
                opponent: PublicProfile::from(&opponent),
                mark,
            });
        }
    }

    tracing::info!(
        "Matched {} ({}) vs {} ({}) in room {}",
        first.username,
        first.skill,
        second.username,
        second.skill,
        handle.room_id
    );
    Some(handle.room_id)
}

/// Periodically pair players whose tolerance widened.
pub async fn sweep_task(state: AppState) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        interval.tick().await;
        let now = Utc::now();
        for pairing in state.matchmaker.sweep(now) {
            start_match(&state, pairing, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::store::tests::sample_user;
    use crate::store::Store;

    fn cfg() -> MatchmakingConfig {
        MatchmakingConfig {
            base_tolerance: 100,
            tolerance_per_second: 10,
            max_tolerance: 500,
            default_wait_seconds: 30,
            history_size: 4,
        }
    }

    fn entry(skill: i32, joined_at: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            user_id: Uuid::new_v4(),
            username: format!("p{skill}"),
            skill,
            joined_at,
        }
    }

    #[test]
    fn tolerance_widens_with_wait_and_caps() {
        let t0 = Utc::now();
        let e = entry(1000, t0);
        assert_eq!(e.tolerance(&cfg(), t0), 100);
        assert_eq!(e.tolerance(&cfg(), t0 + Duration::seconds(20)), 300);
        assert_eq!(e.tolerance(&cfg(), t0 + Duration::seconds(1000)), 500);
    }

    #[test]
    fn close_skills_pair_immediately_with_older_as_first() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let a = entry(1000, t0);
        let b = entry(1050, t0 + Duration::seconds(1));

        assert!(matches!(mm.join(a.clone(), t0), Ok(JoinOutcome::Queued { position: 1, .. })));
        match mm.join(b.clone(), t0 + Duration::seconds(1)).unwrap() {
            JoinOutcome::Paired(p) => {
                assert_eq!(p.first, a);
                assert_eq!(p.second, b);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mm.stats().players_in_queue, 0);
    }

    #[test]
    fn distant_skills_wait_until_tolerance_widens() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let a = entry(1000, t0);
        let b = entry(1300, t0);
        mm.join(a.clone(), t0).unwrap();
        assert!(matches!(mm.join(b.clone(), t0), Ok(JoinOutcome::Queued { position: 2, .. })));

        assert!(mm.sweep(t0 + Duration::seconds(10)).is_empty());
        let pairs = mm.sweep(t0 + Duration::seconds(20));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].first.user_id, a.user_id);
    }

    #[test]
    fn joiner_prefers_closest_of_several() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let far = entry(1090, t0);
        let mid = entry(1200, t0);
        let near = entry(1150, t0);
        mm.join(far.clone(), t0).unwrap();
        mm.join(mid.clone(), t0).unwrap();

        // 1090 and 1200 are 110 apart: too far at t0.
        assert_eq!(mm.stats().players_in_queue, 2);

        match mm.join(near.clone(), t0).unwrap() {
            JoinOutcome::Paired(p) => assert_eq!(p.first.user_id, mid.user_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_join_and_leave_errors() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let a = entry(1000, t0);
        mm.join(a.clone(), t0).unwrap();
        assert_eq!(mm.join(a.clone(), t0), Err(MatchmakingError::AlreadyQueued));
        assert_eq!(mm.leave(a.user_id).unwrap(), a);
        assert_eq!(mm.leave(a.user_id), Err(MatchmakingError::NotQueued));
        assert_eq!(mm.status(a.user_id, t0), QueueStatus::Idle);
    }

    #[test]
    fn status_reports_position_estimate_and_match_once() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let entries: Vec<QueueEntry> = (0..3).map(|i| entry(1000 + i * 400, t0)).collect();
        for e in &entries {
            mm.join(e.clone(), t0).unwrap();
        }

        assert_eq!(
            mm.status(entries[2].user_id, t0 + Duration::seconds(5)),
            QueueStatus::Queued {
                position: 3,
                waited_secs: 5,
                estimated_wait_secs: 55,
            }
        );

        let pairing = Pairing {
            first: entries[0].clone(),
            second: entries[1].clone(),
        };
        mm.leave(entries[0].user_id).unwrap();
        mm.leave(entries[1].user_id).unwrap();
        let room = Uuid::new_v4();
        mm.record_match(&pairing, room, t0 + Duration::seconds(10));

        assert_eq!(
            mm.join(entries[0].clone(), t0 + Duration::seconds(11)),
            Err(MatchmakingError::AlreadyMatched)
        );
        assert_eq!(
            mm.status(entries[0].user_id, t0 + Duration::seconds(11)),
            QueueStatus::Matched { room_id: room }
        );
        assert_eq!(mm.status(entries[0].user_id, t0 + Duration::seconds(12)), QueueStatus::Idle);

        // Two realised waits of 10s now drive the estimate.
        assert_eq!(mm.stats().average_wait_secs, 10);
    }

    #[test]
    fn requeue_front_restores_priority() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let a = entry(1000, t0);
        let b = entry(2000, t0);
        mm.join(b.clone(), t0).unwrap();
        mm.requeue_front(a.clone());
        assert!(matches!(mm.status(a.user_id, t0), QueueStatus::Queued { position: 1, .. }));
    }
    #[test]
    fn equal_gaps_go_to_the_longest_waiting() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let older = entry(1100, t0);
        let younger = entry(900, t0 + Duration::seconds(2));
        mm.join(younger.clone(), t0 + Duration::seconds(2)).unwrap();
        mm.join(older.clone(), t0 + Duration::seconds(2)).unwrap();
        assert_eq!(mm.stats().players_in_queue, 2);

        let joiner = entry(1000, t0 + Duration::seconds(3));
        match mm.join(joiner.clone(), t0 + Duration::seconds(3)).unwrap() {
            JoinOutcome::Paired(p) => {
                assert_eq!(p.first.user_id, older.user_id);
                assert_eq!(p.second.user_id, joiner.user_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sweep_pairs_every_compatible_couple() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let entries: Vec<QueueEntry> = [1000, 1400, 2000, 2400].iter().map(|&s| entry(s, t0)).collect();
        for e in &entries {
            mm.join(e.clone(), t0).unwrap();
        }

        let pairs = mm.sweep(t0 + Duration::seconds(30));
        assert_eq!(pairs.len(), 2);
        let skills: Vec<(i32, i32)> = pairs.iter().map(|p| (p.first.skill, p.second.skill)).collect();
        assert!(skills.contains(&(1000, 1400)));
        assert!(skills.contains(&(2000, 2400)));
        assert_eq!(mm.stats().players_in_queue, 0);
    }

    #[test]
    fn older_entry_plays_x_even_behind_a_requeued_one() {
        let mm = Matchmaker::new(cfg());
        let t0 = Utc::now();
        let older = entry(1000, t0);
        let younger = entry(1050, t0 + Duration::seconds(5));
        mm.requeue_front(older.clone());
        mm.requeue_front(younger.clone());

        let pairs = mm.sweep(t0 + Duration::seconds(6));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].first.user_id, older.user_id);
        assert_eq!(pairs[0].second.user_id, younger.user_id);
    }

    fn app_state() -> (AppState, User, User) {
        let store = Store::in_memory();
        let a = sample_user("anna");
        let b = sample_user("bert");
        store.insert_user(a.clone()).unwrap();
        store.insert_user(b.clone()).unwrap();
        let state = AppState::new(store, ServerConfig::default(), "http://localhost".to_string());
        (state, a, b)
    }

    #[tokio::test]
    async fn start_match_opens_ranked_room_and_notifies_both() {
        let (state, a, b) = app_state();
        let mut rx = state.hub.subscribe();
        let now = Utc::now();
        let pairing = Pairing {
            first: QueueEntry::new(&a, now - Duration::seconds(10)),
            second: QueueEntry::new(&b, now),
        };

        let room_id = start_match(&state, pairing, now).unwrap();
        assert_eq!(state.registry.active_room_of(a.id), Some(room_id));
        assert_eq!(state.registry.active_room_of(b.id), Some(room_id));
        assert_eq!(state.store.user(a.id).unwrap().energy.lives, 4);

        let mut marks = Vec::new();
        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            if let ServerMsg::Matched { room_id: r, mark, .. } = event.msg {
                assert_eq!(r, room_id);
                marks.push((event.user_id, mark));
            }
        }
        assert!(marks.contains(&(a.id, Mark::X)));
        assert!(marks.contains(&(b.id, Mark::O)));
        assert_eq!(state.matchmaker.status(b.id, now), QueueStatus::Matched { room_id });
    }

    #[tokio::test]
    async fn start_match_drops_broke_player_and_requeues_other() {
        let (state, a, b) = app_state();
        state.store.update_user(b.id, |u| u.energy.lives = 0);
        let mut rx = state.hub.subscribe();
        let now = Utc::now();
        let first = QueueEntry::new(&a, now - Duration::seconds(10));
        let pairing = Pairing {
            first: first.clone(),
            second: QueueEntry::new(&b, now),
        };
        state.matchmaker.join(QueueEntry::new(&sample_user("cleo"), now), now).unwrap();

        assert!(start_match(&state, pairing, now).is_none());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id, b.id);
        assert!(matches!(event.msg, ServerMsg::QueueDropped { .. }));

        assert_eq!(
            state.matchmaker.status(a.id, now),
            QueueStatus::Queued {
                position: 1,
                waited_secs: 10,
                estimated_wait_secs: 20,
            }
        );
        assert_eq!(state.matchmaker.status(b.id, now), QueueStatus::Idle);
        assert_eq!(state.store.user(a.id).unwrap().energy.lives, 5);
        assert!(state.registry.active_room_of(a.id).is_none());
    }
}
