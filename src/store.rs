use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("username is already taken")]
    UsernameTaken,
}

/// On-disk layout of the document collections.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    users: Vec<User>,
    games: Vec<GameRecord>,
    friendships: Vec<Friendship>,
    messages: Vec<ChatMessage>,
}

/// In-process document store. Each collection is a concurrent map; updates to
/// a single document hold that entry's lock for the duration of the closure.
pub struct Store {
    path: Option<PathBuf>,
    users: DashMap<Uuid, User>,
    /// lowercase username -> user id
    usernames: DashMap<String, Uuid>,
    games: DashMap<Uuid, GameRecord>,
    friendships: DashMap<Uuid, Friendship>,
    messages: DashMap<Uuid, ChatMessage>,
    dirty: AtomicBool,
}

impl Store {
    fn empty(path: Option<PathBuf>) -> Self {
        Self {
            path,
            users: DashMap::new(),
            usernames: DashMap::new(),
            games: DashMap::new(),
            friendships: DashMap::new(),
            messages: DashMap::new(),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::empty(None))
    }

    /// Open the store backed by `path`, loading the snapshot if one exists.
    pub fn load(path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let store = Self::empty(Some(path.clone()));
        if path.exists() {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let snapshot: Snapshot = serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse {}", path.display()))?;

            for user in snapshot.users {
                store.usernames.insert(user.username.to_lowercase(), user.id);
                store.users.insert(user.id, user);
            }
            for game in snapshot.games {
                store.games.insert(game.id, game);
            }
            for friendship in snapshot.friendships {
                store.friendships.insert(friendship.id, friendship);
            }
            for message in snapshot.messages {
                store.messages.insert(message.id, message);
            }
            tracing::info!(
                "Loaded store from {}: {} users, {} games",
                path.display(),
                store.users.len(),
                store.games.len()
            );
        }
        Ok(Arc::new(store))
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            users: self.users.iter().map(|e| e.value().clone()).collect(),
            games: self.games.iter().map(|e| e.value().clone()).collect(),
            friendships: self.friendships.iter().map(|e| e.value().clone()).collect(),
            messages: self.messages.iter().map(|e| e.value().clone()).collect(),
        }
    }

    /// Write the snapshot atomically (temp file + rename).
    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.dirty.store(false, Ordering::Release);
        let json = serde_json::to_vec(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Periodically persist when something changed.
    pub async fn flush_task(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            if self.dirty.load(Ordering::Acquire) {
                if let Err(e) = self.save().await {
                    tracing::error!("Failed to persist store: {:#}", e);
                    self.mark_dirty();
                }
            }
        }
    }

    // ─── Users ────────────────────────────────────────────────────

    pub fn insert_user(&self, user: User) -> Result<(), StoreError> {
        match self.usernames.entry(user.username.to_lowercase()) {
            Entry::Occupied(_) => Err(StoreError::UsernameTaken),
            Entry::Vacant(slot) => {
                slot.insert(user.id);
                self.users.insert(user.id, user);
                self.mark_dirty();
                Ok(())
            }
        }
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.users.get(&id).map(|u| u.value().clone())
    }

    pub fn user_by_username(&self, username: &str) -> Option<User> {
        let id = *self.usernames.get(&username.to_lowercase())?;
        self.user(id)
    }

    /// Atomically mutate a single user document.
    pub fn update_user<R>(&self, id: Uuid, f: impl FnOnce(&mut User) -> R) -> Option<R> {
        let mut user = self.users.get_mut(&id)?;
        let out = f(user.value_mut());
        self.mark_dirty();
        Some(out)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn banned_count(&self) -> usize {
        self.users.iter().filter(|u| u.banned).count()
    }

    /// Case-insensitive username prefix search, sorted by username.
    pub fn search_users(&self, prefix: &str, limit: usize) -> Vec<User> {
        let prefix = prefix.to_lowercase();
        let mut found: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.username.to_lowercase().starts_with(&prefix))
            .map(|u| u.value().clone())
            .collect();
        found.sort_by(|a, b| a.username.to_lowercase().cmp(&b.username.to_lowercase()));
        found.truncate(limit);
        found
    }

    pub fn leaderboard(&self, limit: usize) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|u| !u.banned && u.stats.games_played > 0)
            .map(|u| u.value().clone())
            .collect();
        users.sort_by(|a, b| {
            b.skill
                .cmp(&a.skill)
                .then(b.stats.wins.cmp(&a.stats.wins))
                .then(a.username.cmp(&b.username))
        });
        users.truncate(limit);
        users
    }

    // ─── Games ────────────────────────────────────────────────────

    pub fn insert_game(&self, record: GameRecord) {
        self.games.insert(record.id, record);
        self.mark_dirty();
    }

    pub fn game(&self, id: Uuid) -> Option<GameRecord> {
        self.games.get(&id).map(|g| g.value().clone())
    }

    pub fn game_count(&self) -> usize {
        self.games.len()
    }

    /// Most recent first.
    pub fn games_for(&self, user: Uuid, limit: usize) -> Vec<GameRecord> {
        let mut games: Vec<GameRecord> = self
            .games
            .iter()
            .filter(|g| g.player_x == user || g.player_o == user)
            .map(|g| g.value().clone())
            .collect();
        games.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        games.truncate(limit);
        games
    }

    // ─── Friendships ──────────────────────────────────────────────

    pub fn insert_friendship(&self, friendship: Friendship) {
        self.friendships.insert(friendship.id, friendship);
        self.mark_dirty();
    }

    pub fn friendship(&self, id: Uuid) -> Option<Friendship> {
        self.friendships.get(&id).map(|f| f.value().clone())
    }

    pub fn friendship_between(&self, a: Uuid, b: Uuid) -> Option<Friendship> {
        self.friendships
            .iter()
            .find(|f| f.involves(a) && f.involves(b) && a != b)
            .map(|f| f.value().clone())
    }

    pub fn update_friendship<R>(&self, id: Uuid, f: impl FnOnce(&mut Friendship) -> R) -> Option<R> {
        let mut friendship = self.friendships.get_mut(&id)?;
        let out = f(friendship.value_mut());
        self.mark_dirty();
        Some(out)
    }

    pub fn remove_friendship(&self, id: Uuid) -> Option<Friendship> {
        let removed = self.friendships.remove(&id).map(|(_, f)| f);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    /// Friendships involving `user` with the given status.
    pub fn friendships_of(&self, user: Uuid, status: FriendStatus) -> Vec<Friendship> {
        let mut list: Vec<Friendship> = self
            .friendships
            .iter()
            .filter(|f| f.involves(user) && f.status == status)
            .map(|f| f.value().clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn are_friends(&self, a: Uuid, b: Uuid) -> bool {
        self.friendship_between(a, b)
            .is_some_and(|f| f.status == FriendStatus::Accepted)
    }

    // ─── Messages ─────────────────────────────────────────────────

    pub fn insert_message(&self, message: ChatMessage) {
        self.messages.insert(message.id, message);
        self.mark_dirty();
    }

    pub fn remove_message(&self, id: Uuid) -> Option<ChatMessage> {
        let removed = self.messages.remove(&id).map(|(_, m)| m);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    fn latest(&self, limit: usize, keep: impl Fn(&ChatMessage) -> bool) -> Vec<ChatMessage> {
        let mut list: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|m| keep(m.value()))
            .map(|m| m.value().clone())
            .collect();
        list.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        let skip = list.len().saturating_sub(limit);
        list.split_off(skip)
    }

    /// Direct messages between two users, oldest first, at most `limit`.
    pub fn conversation(&self, a: Uuid, b: Uuid, limit: usize) -> Vec<ChatMessage> {
        self.latest(limit, |m| match m.target {
            ChatTarget::Direct { to } => (m.from == a && to == b) || (m.from == b && to == a),
            ChatTarget::Room { .. } => false,
        })
    }

    pub fn room_messages(&self, room: Uuid, limit: usize) -> Vec<ChatMessage> {
        self.latest(limit, |m| matches!(m.target, ChatTarget::Room { room_id } if room_id == room))
    }
}
