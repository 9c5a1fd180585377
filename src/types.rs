use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::board::{Mark, Outcome};
use crate::energy::{Energy, EnergyView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Player,
    Admin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub games_played: u32,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub current_streak: u32,
    pub best_streak: u32,
}

/// A stored account document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub password_hash: String,
    pub salt: String,
    pub role: Role,
    #[serde(default)]
    pub banned: bool,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub stats: Stats,
    #[serde(default)]
    pub xp: u64,
    pub level: u32,
    pub skill: i32,
    pub energy: Energy,
}

/// What other users may see.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub level: u32,
    pub skill: i32,
    pub stats: Stats,
}

impl From<&User> for PublicProfile {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            display_name: u.display_name.clone(),
            avatar: u.avatar.clone(),
            level: u.level,
            skill: u.skill,
            stats: u.stats.clone(),
        }
    }
}

/// The owner's view of their account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateProfile {
    #[serde(flatten)]
    pub profile: PublicProfile,
    pub email: Option<String>,
    pub role: Role,
    pub xp: u64,
    pub energy: EnergyView,
    pub created_at: DateTime<Utc>,
}

/// An admin listing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    #[serde(flatten)]
    pub profile: PublicProfile,
    pub email: Option<String>,
    pub role: Role,
    pub banned: bool,
    pub last_seen: DateTime<Utc>,
}

impl From<&User> for UserSummary {
    fn from(u: &User) -> Self {
        Self {
            profile: u.into(),
            email: u.email.clone(),
            role: u.role,
            banned: u.banned,
            last_seen: u.last_seen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Ranked,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Finished,
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "WAITING"),
            Self::Playing => write!(f, "PLAYING"),
            Self::Finished => write!(f, "FINISHED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    Line,
    Draw,
    Resign,
    Timeout,
    Disconnect,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    pub cell: usize,
    pub mark: Mark,
    pub at: DateTime<Utc>,
}

/// A finished game document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub id: Uuid,
    pub room_id: Uuid,
    pub kind: RoomKind,
    pub player_x: Uuid,
    pub player_o: Uuid,
    pub moves: Vec<MoveRecord>,
    pub outcome: Option<Outcome>,
    pub winner: Option<Uuid>,
    pub reason: EndReason,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Per-player effect of a finished game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDelta {
    pub user_id: Uuid,
    pub xp_gained: u64,
    pub skill_change: i32,
    pub level: u32,
    pub skill: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FriendStatus {
    Pending,
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friendship {
    pub id: Uuid,
    pub requester: Uuid,
    pub addressee: Uuid,
    pub status: FriendStatus,
    pub created_at: DateTime<Utc>,
}

impl Friendship {
    pub fn involves(&self, user: Uuid) -> bool {
        self.requester == user || self.addressee == user
    }

    pub fn other(&self, user: Uuid) -> Uuid {
        if self.requester == user { self.addressee } else { self.requester }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum ChatTarget {
    Room { room_id: Uuid },
    Direct { to: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub from: Uuid,
    pub from_name: String,
    pub target: ChatTarget,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seat {
    pub user_id: Uuid,
    pub username: String,
    pub mark: Mark,
    pub connected: bool,
}

/// Full room state sent on attach and on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: Uuid,
    pub kind: RoomKind,
    pub status: RoomStatus,
    pub invite_code: Option<String>,
    pub seats: Vec<Seat>,
    pub board: [Option<Mark>; 9],
    pub turn: Mark,
    pub turn_deadline: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub chat: Vec<ChatMessage>,
    pub rematch_requests: Vec<Uuid>,
}

/// Messages sent from server to clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    RoomState {
        room: RoomSnapshot,
    },
    PlayerJoined {
        room_id: Uuid,
        seat: Seat,
    },
    MoveMade {
        room_id: Uuid,
        cell: usize,
        mark: Mark,
        next_turn: Mark,
        turn_deadline: Option<DateTime<Utc>>,
    },
    GameOver {
        room_id: Uuid,
        game_id: Option<Uuid>,
        outcome: Option<Outcome>,
        winner: Option<Uuid>,
        reason: EndReason,
        results: Vec<ResultDelta>,
    },
    RematchRequested {
        room_id: Uuid,
        by: Uuid,
    },
    RematchStarted {
        room: RoomSnapshot,
    },
    RoomChat {
        message: ChatMessage,
    },
    ChatDeleted {
        room_id: Uuid,
        message_id: Uuid,
    },
    OpponentDisconnected {
        room_id: Uuid,
        user_id: Uuid,
        grace_secs: u64,
    },
    OpponentReconnected {
        room_id: Uuid,
        user_id: Uuid,
    },
    Matched {
        room_id: Uuid,
        opponent: PublicProfile,
        mark: Mark,
    },
    QueueDropped {
        message: String,
    },
    FriendRequest {
        request_id: Uuid,
        from: PublicProfile,
    },
    FriendAccepted {
        friend: PublicProfile,
    },
    DirectMessage {
        message: ChatMessage,
    },
    ErrorMessage {
        message: String,
    },
    Reset {
        message: String,
    },
    Pong,
}

/// Messages sent from clients to server via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    AttachRoom { room_id: Uuid },
    LeaveRoom,
    MakeMove { room_id: Uuid, cell: usize },
    Resign { room_id: Uuid },
    RequestRematch { room_id: Uuid },
    RoomChat { room_id: Uuid, text: String },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_tagged() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"MakeMove","room_id":"{id}","cell":4}}"#);
        match serde_json::from_str::<ClientMsg>(&raw).unwrap() {
            ClientMsg::MakeMove { room_id, cell } => {
                assert_eq!(room_id, id);
                assert_eq!(cell, 4);
            }
            other => panic!("unexpected {other:?}"),
        }

        let ping: ClientMsg = serde_json::from_str(r#"{"type":"Ping"}"#).unwrap();
        assert!(matches!(ping, ClientMsg::Ping));
    }

    #[test]
    fn server_pong_serializes_as_tag_only() {
        let json = serde_json::to_value(ServerMsg::Pong).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "Pong" }));
    }
}
