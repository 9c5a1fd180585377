use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::accounts;
use crate::board::{Board, Mark, MoveError, Outcome};
use crate::chat;
use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::store::Store;
use crate::types::*;

const WAITING_ROOM_TTL: Duration = Duration::from_secs(15 * 60);

/// Commands the WebSocket and HTTP handlers send to a room task.
#[derive(Debug)]
pub enum GameCommand {
    Seat {
        user_id: Uuid,
        username: String,
        reply: oneshot::Sender<AppResult<RoomSnapshot>>,
    },
    /// Register one socket of a seated player. Non-players get an error reply.
    Attach {
        user_id: Uuid,
        conn_id: Uuid,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Move {
        user_id: Uuid,
        cell: usize,
    },
    Resign {
        user_id: Uuid,
    },
    Rematch {
        user_id: Uuid,
    },
    Chat {
        user_id: Uuid,
        text: String,
    },
    Disconnect {
        user_id: Uuid,
        conn_id: Uuid,
    },
    DisconnectCheck {
        user_id: Uuid,
        epoch: u64,
    },
    Terminate {
        reason: String,
    },
    /// Forfeit the user's running game and close the room.
    Kick {
        user_id: Uuid,
        reason: String,
    },
    DeleteMessage {
        id: Uuid,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Events broadcast from the room to WebSocket connections.
#[derive(Debug, Clone)]
pub enum GameEvent {
    /// Send a message to one user's sockets.
    SendTo { user_id: Uuid, msg: ServerMsg },
    /// Broadcast a message to everyone attached to the room.
    Broadcast { msg: ServerMsg },
    /// Broadcast to all except one user.
    BroadcastExcept { exclude: Uuid, msg: ServerMsg },
    /// The room is gone; sockets detach after delivering `msg`.
    Close { msg: ServerMsg },
}

impl GameEvent {
    /// The message for `user_id`, if this event addresses them.
    pub fn message_for(&self, user_id: Uuid) -> Option<&ServerMsg> {
        match self {
            Self::SendTo { user_id: to, msg } => (*to == user_id).then_some(msg),
            Self::Broadcast { msg } | Self::Close { msg } => Some(msg),
            Self::BroadcastExcept { exclude, msg } => (*exclude != user_id).then_some(msg),
        }
    }
}

#[derive(Clone)]
pub struct GameHandle {
    pub room_id: Uuid,
    pub kind: RoomKind,
    pub invite_code: Option<String>,
    pub cmd_tx: mpsc::Sender<GameCommand>,
    pub event_tx: broadcast::Sender<GameEvent>,
}

impl GameHandle {
    pub async fn snapshot(&self) -> Option<RoomSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(GameCommand::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Registry holds all live rooms.
pub struct Registry {
    /// room_id -> handle
    pub rooms: dashmap::DashMap<Uuid, GameHandle>,
    /// invite_code -> room_id
    pub invite_codes: dashmap::DashMap<String, Uuid>,
    /// user_id -> room_id for users with a waiting or running game
    pub user_rooms: dashmap::DashMap<Uuid, Uuid>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: dashmap::DashMap::new(),
            invite_codes: dashmap::DashMap::new(),
            user_rooms: dashmap::DashMap::new(),
        })
    }

    pub fn room(&self, room_id: Uuid) -> Option<GameHandle> {
        self.rooms.get(&room_id).map(|h| h.value().clone())
    }

    pub fn active_room_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.user_rooms.get(&user_id).map(|r| *r.value())
    }

    pub fn room_by_invite(&self, code: &str) -> Option<GameHandle> {
        let room_id = *self.invite_codes.get(code)?.value();
        self.room(room_id)
    }

    pub fn remove_room(&self, room_id: Uuid) {
        if let Some((_, handle)) = self.rooms.remove(&room_id) {
            if let Some(code) = handle.invite_code {
                self.invite_codes.remove(&code);
            }
        }
        self.user_rooms.retain(|_, rid| *rid != room_id);
    }

    fn unique_invite_code(&self) -> String {
        let mut rng = rand::rng();
        loop {
            let code: String = (0..6).map(|_| char::from(b'0' + rng.random_range(0..10))).collect();
            if !self.invite_codes.contains_key(&code) {
                return code;
            }
        }
    }
}

/// Shared services a room task needs.
#[derive(Clone)]
pub struct RoomContext {
    pub store: Arc<Store>,
    pub config: Arc<ServerConfig>,
    pub registry: Arc<Registry>,
}

struct SeatState {
    user_id: Uuid,
    username: String,
    mark: Mark,
    /// Sockets currently attached to this seat.
    connections: HashSet<Uuid>,
    /// Bumped whenever the seat goes online or offline so stale checks are ignored.
    epoch: u64,
}

impl SeatState {
    fn new(user_id: Uuid, username: String, mark: Mark) -> Self {
        Self {
            user_id,
            username,
            mark,
            connections: HashSet::new(),
            epoch: 0,
        }
    }

    fn connected(&self) -> bool {
        !self.connections.is_empty()
    }
}

/// The internal state of a running room.
struct RoomState {
    room_id: Uuid,
    kind: RoomKind,
    invite_code: Option<String>,
    status: RoomStatus,
    seats: Vec<SeatState>,

    board: Board,
    turn: Mark,
    moves: Vec<MoveRecord>,
    started_at: DateTime<Utc>,
    turn_deadline: Option<(Instant, DateTime<Utc>)>,
    outcome: Option<Outcome>,

    chat: VecDeque<ChatMessage>,
    rematch_requests: Vec<Uuid>,
    close_at: Option<Instant>,
    closed: bool,

    ctx: RoomContext,
}

impl RoomState {
    fn new(room_id: Uuid, kind: RoomKind, invite_code: Option<String>, ctx: RoomContext) -> Self {
        Self {
            room_id,
            kind,
            invite_code,
            status: RoomStatus::Waiting,
            seats: Vec::with_capacity(2),
            board: Board::new(),
            turn: Mark::X,
            moves: Vec::new(),
            started_at: Utc::now(),
            turn_deadline: None,
            outcome: None,
            chat: VecDeque::new(),
            rematch_requests: Vec::new(),
            close_at: Some(Instant::now() + WAITING_ROOM_TTL),
            closed: false,
            ctx,
        }
    }

    fn broadcast(&self, tx: &broadcast::Sender<GameEvent>, msg: ServerMsg) {
        let _ = tx.send(GameEvent::Broadcast { msg });
    }

    fn send_to(&self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, msg: ServerMsg) {
        let _ = tx.send(GameEvent::SendTo { user_id, msg });
    }

    fn send_error(&self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, message: impl Into<String>) {
        self.send_to(tx, user_id, ServerMsg::ErrorMessage {
            message: message.into(),
        });
    }

    fn seat(&self, user_id: Uuid) -> Option<&SeatState> {
        self.seats.iter().find(|s| s.user_id == user_id)
    }

    fn seat_mut(&mut self, user_id: Uuid) -> Option<&mut SeatState> {
        self.seats.iter_mut().find(|s| s.user_id == user_id)
    }

    fn player_with(&self, mark: Mark) -> Option<Uuid> {
        self.seats.iter().find(|s| s.mark == mark).map(|s| s.user_id)
    }

    fn opponent_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.seats.iter().find(|s| s.user_id != user_id).map(|s| s.user_id)
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id,
            kind: self.kind,
            status: self.status,
            invite_code: self.invite_code.clone(),
            seats: self
                .seats
                .iter()
                .map(|s| Seat {
                    user_id: s.user_id,
                    username: s.username.clone(),
                    mark: s.mark,
                    connected: s.connected(),
                })
                .collect(),
            board: *self.board.cells(),
            turn: self.turn,
            turn_deadline: self.turn_deadline.map(|(_, at)| at),
            outcome: self.outcome,
            chat: self.chat.iter().cloned().collect(),
            rematch_requests: self.rematch_requests.clone(),
        }
    }

    fn reset_turn_timer(&mut self) {
        let secs = self.ctx.config.game.turn_seconds;
        self.turn_deadline = Some((
            Instant::now() + Duration::from_secs(secs),
            Utc::now() + chrono::Duration::seconds(secs as i64),
        ));
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self.status {
            RoomStatus::Playing => self.turn_deadline.map(|(at, _)| at),
            RoomStatus::Waiting | RoomStatus::Finished => self.close_at,
        }
    }

    fn start(&mut self) {
        self.status = RoomStatus::Playing;
        self.board = Board::new();
        self.turn = Mark::X;
        self.moves.clear();
        self.outcome = None;
        self.rematch_requests.clear();
        self.started_at = Utc::now();
        self.close_at = None;
        self.reset_turn_timer();
        for seat in &self.seats {
            self.ctx.registry.user_rooms.insert(seat.user_id, self.room_id);
        }
    }

    fn seat_player(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, username: String) -> AppResult<RoomSnapshot> {
        if self.status != RoomStatus::Waiting || self.seats.len() >= 2 {
            return Err(AppError::conflict("Room is full"));
        }
        if self.seat(user_id).is_some() {
            return Err(AppError::conflict("You are already in this room"));
        }
        let creator = self.seats.first().map(|s| s.user_id)
            .ok_or_else(|| AppError::Internal("waiting room without creator".to_string()))?;

        accounts::consume_pair(&self.ctx.store, &self.ctx.config, creator, user_id, Utc::now())
            .map_err(|(who, err)| {
                if who == creator {
                    AppError::conflict("The room creator has no energy left")
                } else {
                    err
                }
            })?;

        let seat = SeatState::new(user_id, username, Mark::O);
        self.broadcast(tx, ServerMsg::PlayerJoined {
            room_id: self.room_id,
            seat: Seat {
                user_id,
                username: seat.username.clone(),
                mark: seat.mark,
                connected: false,
            },
        });
        self.seats.push(seat);
        self.start();
        self.broadcast(tx, ServerMsg::RoomState { room: self.snapshot() });

        tracing::info!("Room {} started: private game", self.room_id);
        Ok(self.snapshot())
    }

    fn attach(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, conn_id: Uuid) -> AppResult<()> {
        let Some(seat) = self.seat_mut(user_id) else {
            return Err(AppError::forbidden(MoveError::NotAPlayer.to_string()));
        };
        let was_offline = !seat.connected();
        seat.connections.insert(conn_id);
        let reconnected = was_offline && seat.epoch > 0;
        if was_offline {
            seat.epoch += 1;
        }

        if reconnected {
            let _ = tx.send(GameEvent::BroadcastExcept {
                exclude: user_id,
                msg: ServerMsg::OpponentReconnected {
                    room_id: self.room_id,
                    user_id,
                },
            });
        }
        self.send_to(tx, user_id, ServerMsg::RoomState { room: self.snapshot() });
        Ok(())
    }

    fn play(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, cell: usize) -> Result<(), MoveError> {
        let mark = self.seat(user_id).ok_or(MoveError::NotAPlayer)?.mark;
        if self.status != RoomStatus::Playing {
            return Err(MoveError::NotPlaying);
        }
        if mark != self.turn {
            return Err(MoveError::NotYourTurn);
        }
        self.board.place(cell, mark)?;
        self.moves.push(MoveRecord {
            cell,
            mark,
            at: Utc::now(),
        });

        let outcome = self.board.outcome();
        if outcome.is_none() {
            self.turn = mark.other();
            self.reset_turn_timer();
        } else {
            self.turn_deadline = None;
        }

        self.broadcast(tx, ServerMsg::MoveMade {
            room_id: self.room_id,
            cell,
            mark,
            next_turn: self.turn,
            turn_deadline: self.turn_deadline.map(|(_, at)| at),
        });

        match outcome {
            Some(Outcome::Win { .. }) => self.finish(tx, Some(user_id), EndReason::Line),
            Some(Outcome::Draw) => self.finish(tx, None, EndReason::Draw),
            None => {}
        }
        Ok(())
    }

    fn finish(&mut self, tx: &broadcast::Sender<GameEvent>, winner: Option<Uuid>, reason: EndReason) {
        let now = Utc::now();
        self.status = RoomStatus::Finished;
        self.outcome = self.board.outcome();
        self.turn_deadline = None;
        self.rematch_requests.clear();
        self.close_at = Some(Instant::now() + Duration::from_secs(self.ctx.config.game.rematch_window_seconds));

        for seat in &self.seats {
            self.ctx.registry.user_rooms.remove_if(&seat.user_id, |_, rid| *rid == self.room_id);
        }

        let (Some(player_x), Some(player_o)) = (self.player_with(Mark::X), self.player_with(Mark::O)) else {
            self.broadcast(tx, ServerMsg::GameOver {
                room_id: self.room_id,
                game_id: None,
                outcome: self.outcome,
                winner,
                reason,
                results: Vec::new(),
            });
            return;
        };

        let record = GameRecord {
            id: Uuid::new_v4(),
            room_id: self.room_id,
            kind: self.kind,
            player_x,
            player_o,
            moves: self.moves.clone(),
            outcome: self.outcome,
            winner,
            reason,
            started_at: self.started_at,
            ended_at: now,
        };

        let (game_id, results) = if reason == EndReason::Aborted {
            (None, Vec::new())
        } else {
            let results = accounts::record_result(&self.ctx.store, &self.ctx.config, &record);
            let id = record.id;
            self.ctx.store.insert_game(record);
            (Some(id), results)
        };

        tracing::info!(
            "Room {} game over after {} moves: winner {:?} reason {:?}",
            self.room_id,
            self.board.move_count(),
            winner,
            reason
        );

        self.broadcast(tx, ServerMsg::GameOver {
            room_id: self.room_id,
            game_id,
            outcome: self.outcome,
            winner,
            reason,
            results,
        });
    }

    fn resign(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid) -> Result<(), MoveError> {
        self.seat(user_id).ok_or(MoveError::NotAPlayer)?;
        if self.status != RoomStatus::Playing {
            return Err(MoveError::NotPlaying);
        }
        let winner = self.opponent_of(user_id);
        self.finish(tx, winner, EndReason::Resign);
        Ok(())
    }

    fn request_rematch(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid) {
        if self.seat(user_id).is_none() {
            self.send_error(tx, user_id, MoveError::NotAPlayer.to_string());
            return;
        }
        if self.status != RoomStatus::Finished || self.seats.len() < 2 {
            self.send_error(tx, user_id, "Rematch is only possible after a finished game");
            return;
        }
        if !self.rematch_requests.contains(&user_id) {
            self.rematch_requests.push(user_id);
            self.broadcast(tx, ServerMsg::RematchRequested {
                room_id: self.room_id,
                by: user_id,
            });
        }
        if self.rematch_requests.len() < 2 {
            return;
        }

        let busy = self.seats.iter().find(|s| {
            self.ctx
                .registry
                .active_room_of(s.user_id)
                .is_some_and(|room| room != self.room_id)
        });
        if let Some(seat) = busy {
            let message = format!("{} is already playing another game", seat.username);
            self.rematch_requests.clear();
            self.broadcast(tx, ServerMsg::ErrorMessage { message });
            return;
        }

        let (a, b) = (self.seats[0].user_id, self.seats[1].user_id);
        if let Err((who, _)) = accounts::consume_pair(&self.ctx.store, &self.ctx.config, a, b, Utc::now()) {
            self.rematch_requests.clear();
            let name = self.seat(who).map(|s| s.username.clone()).unwrap_or_default();
            self.broadcast(tx, ServerMsg::ErrorMessage {
                message: format!("{name} has no energy left for a rematch"),
            });
            return;
        }

        for seat in &mut self.seats {
            seat.mark = seat.mark.other();
        }
        self.seats.sort_by_key(|s| s.mark != Mark::X);
        self.start();
        self.broadcast(tx, ServerMsg::RematchStarted { room: self.snapshot() });
        tracing::info!("Room {} rematch started", self.room_id);
    }

    fn post_chat(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, text: String) {
        let Some(seat) = self.seat(user_id) else {
            self.send_error(tx, user_id, MoveError::NotAPlayer.to_string());
            return;
        };
        let text = match chat::validate_text(&text) {
            Ok(t) => t,
            Err(e) => {
                self.send_error(tx, user_id, e.to_string());
                return;
            }
        };
        let message = chat::room_message(user_id, seat.username.clone(), self.room_id, text);
        self.ctx.store.insert_message(message.clone());
        self.chat.push_back(message.clone());
        while self.chat.len() > self.ctx.config.game.chat_history {
            self.chat.pop_front();
        }
        self.broadcast(tx, ServerMsg::RoomChat { message });
    }

    fn delete_message(&mut self, tx: &broadcast::Sender<GameEvent>, id: Uuid) {
        let before = self.chat.len();
        self.chat.retain(|m| m.id != id);
        if self.chat.len() != before {
            self.broadcast(tx, ServerMsg::ChatDeleted {
                room_id: self.room_id,
                message_id: id,
            });
        }
    }

    fn disconnect(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, conn_id: Uuid) {
        let grace = self.ctx.config.game.reconnect_grace_seconds;
        let status = self.status;
        let room_id = self.room_id;
        let is_creator = self.seats.first().is_some_and(|s| s.user_id == user_id);

        let Some(seat) = self.seat_mut(user_id) else {
            return;
        };
        if !seat.connections.remove(&conn_id) || seat.connected() {
            return;
        }
        seat.epoch += 1;
        let epoch = seat.epoch;

        match status {
            RoomStatus::Playing => {
                let _ = tx.send(GameEvent::BroadcastExcept {
                    exclude: user_id,
                    msg: ServerMsg::OpponentDisconnected {
                        room_id,
                        user_id,
                        grace_secs: grace,
                    },
                });
                self.schedule_disconnect_check(user_id, epoch, grace);
            }
            RoomStatus::Waiting if is_creator => {
                self.schedule_disconnect_check(user_id, epoch, grace);
            }
            RoomStatus::Finished => {
                if self.seats.iter().all(|s| !s.connected()) {
                    self.close(tx, "Room closed");
                }
            }
            RoomStatus::Waiting => {}
        }
    }

    /// Give the user time to reconnect before acting on the disconnect.
    fn schedule_disconnect_check(&self, user_id: Uuid, epoch: u64, grace: u64) {
        let cmd_tx = self.ctx.registry.room(self.room_id).map(|h| h.cmd_tx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(grace)).await;
            if let Some(tx) = cmd_tx {
                let _ = tx.send(GameCommand::DisconnectCheck { user_id, epoch }).await;
            }
        });
    }

    fn disconnect_check(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, epoch: u64) {
        let still_gone = self
            .seat(user_id)
            .is_some_and(|s| !s.connected() && s.epoch == epoch);
        if !still_gone {
            return;
        }
        match self.status {
            RoomStatus::Playing => {
                let winner = self.opponent_of(user_id);
                self.finish(tx, winner, EndReason::Disconnect);
            }
            RoomStatus::Waiting => self.close(tx, "Room creator left"),
            RoomStatus::Finished => {}
        }
    }

    fn on_deadline(&mut self, tx: &broadcast::Sender<GameEvent>) {
        match self.status {
            RoomStatus::Playing => {
                let loser = self.player_with(self.turn);
                let winner = loser.and_then(|l| self.opponent_of(l));
                self.finish(tx, winner, EndReason::Timeout);
            }
            RoomStatus::Waiting => self.close(tx, "Room expired"),
            RoomStatus::Finished => self.close(tx, "Room closed"),
        }
    }

    fn terminate(&mut self, tx: &broadcast::Sender<GameEvent>, reason: String) {
        if self.status == RoomStatus::Playing {
            self.finish(tx, None, EndReason::Aborted);
        }
        self.close(tx, reason);
    }

    fn kick(&mut self, tx: &broadcast::Sender<GameEvent>, user_id: Uuid, reason: String) {
        if self.seat(user_id).is_none() {
            return;
        }
        if self.status == RoomStatus::Playing {
            let winner = self.opponent_of(user_id);
            self.finish(tx, winner, EndReason::Resign);
        }
        self.close(tx, reason);
    }

    fn close(&mut self, tx: &broadcast::Sender<GameEvent>, message: impl Into<String>) {
        self.closed = true;
        self.ctx.registry.remove_room(self.room_id);
        let _ = tx.send(GameEvent::Close {
            msg: ServerMsg::Reset {
                message: message.into(),
            },
        });
    }

    fn handle(&mut self, tx: &broadcast::Sender<GameEvent>, cmd: GameCommand) {
        match cmd {
            GameCommand::Seat { user_id, username, reply } => {
                let _ = reply.send(self.seat_player(tx, user_id, username));
            }
            GameCommand::Attach { user_id, conn_id, reply } => {
                let _ = reply.send(self.attach(tx, user_id, conn_id));
            }
            GameCommand::Move { user_id, cell } => {
                if let Err(e) = self.play(tx, user_id, cell) {
                    self.send_error(tx, user_id, e.to_string());
                }
            }
            GameCommand::Resign { user_id } => {
                if let Err(e) = self.resign(tx, user_id) {
                    self.send_error(tx, user_id, e.to_string());
                }
            }
            GameCommand::Rematch { user_id } => self.request_rematch(tx, user_id),
            GameCommand::Chat { user_id, text } => self.post_chat(tx, user_id, text),
            GameCommand::Disconnect { user_id, conn_id } => self.disconnect(tx, user_id, conn_id),
            GameCommand::DisconnectCheck { user_id, epoch } => self.disconnect_check(tx, user_id, epoch),
            GameCommand::Terminate { reason } => self.terminate(tx, reason),
            GameCommand::Kick { user_id, reason } => self.kick(tx, user_id, reason),
            GameCommand::DeleteMessage { id } => self.delete_message(tx, id),
            GameCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }
}

/// Create a room and spawn its task. Ranked rooms start immediately with both
/// players; private rooms wait for a second player via invite code.
pub fn create_room(ctx: RoomContext, kind: RoomKind, players: &[(Uuid, String)]) -> GameHandle {
    let room_id = Uuid::new_v4();
    let invite_code = (kind == RoomKind::Private).then(|| ctx.registry.unique_invite_code());

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(256);

    let handle = GameHandle {
        room_id,
        kind,
        invite_code: invite_code.clone(),
        cmd_tx,
        event_tx: event_tx.clone(),
    };

    ctx.registry.rooms.insert(room_id, handle.clone());
    if let Some(code) = &invite_code {
        ctx.registry.invite_codes.insert(code.clone(), room_id);
    }

    let mut state = RoomState::new(room_id, kind, invite_code.clone(), ctx);
    for (i, (user_id, username)) in players.iter().take(2).enumerate() {
        let mark = if i == 0 { Mark::X } else { Mark::O };
        state.seats.push(SeatState::new(*user_id, username.clone(), mark));
        state.ctx.registry.user_rooms.insert(*user_id, room_id);
    }
    if state.seats.len() == 2 {
        state.start();
    }

    tokio::spawn(game_task(state, cmd_rx, event_tx));

    tracing::info!("Room created: {} kind: {:?} invite: {:?}", room_id, kind, invite_code);

    handle
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn game_task(
    mut state: RoomState,
    mut cmd_rx: mpsc::Receiver<GameCommand>,
    event_tx: broadcast::Sender<GameEvent>,
) {
    while !state.closed {
        let deadline = state.next_deadline();
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => state.handle(&event_tx, cmd),
                None => break,
            },
            _ = sleep_until(deadline) => state.on_deadline(&event_tx),
        }
    }

    state.ctx.registry.remove_room(state.room_id);
    tracing::info!("Room {} task ended", state.room_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_user;

    struct Fixture {
        ctx: RoomContext,
        x: User,
        o: User,
    }

    fn fixture() -> Fixture {
        let store = Store::in_memory();
        let x = sample_user("xena");
        let o = sample_user("otto");
        store.insert_user(x.clone()).unwrap();
        store.insert_user(o.clone()).unwrap();
        Fixture {
            ctx: RoomContext {
                store,
                config: Arc::new(ServerConfig::default()),
                registry: Registry::new(),
            },
            x,
            o,
        }
    }

    fn ranked(f: &Fixture) -> GameHandle {
        create_room(
            f.ctx.clone(),
            RoomKind::Ranked,
            &[(f.x.id, f.x.username.clone()), (f.o.id, f.o.username.clone())],
        )
    }

    async fn next_for(rx: &mut broadcast::Receiver<GameEvent>, user: Uuid) -> ServerMsg {
        loop {
            let event = rx.recv().await.unwrap();
            if let Some(msg) = event.message_for(user) {
                return msg.clone();
            }
        }
    }

    async fn game_over(rx: &mut broadcast::Receiver<GameEvent>, user: Uuid) -> (Option<Uuid>, EndReason, Vec<ResultDelta>) {
        loop {
            if let ServerMsg::GameOver { winner, reason, results, .. } = next_for(rx, user).await {
                return (winner, reason, results);
            }
        }
    }

    async fn mv(handle: &GameHandle, user_id: Uuid, cell: usize) {
        handle.cmd_tx.send(GameCommand::Move { user_id, cell }).await.unwrap();
    }

    async fn attach(handle: &GameHandle, user_id: Uuid, conn_id: Uuid) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        handle.cmd_tx.send(GameCommand::Attach { user_id, conn_id, reply }).await.unwrap();
        rx.await.unwrap()
    }

    async fn detach(handle: &GameHandle, user_id: Uuid, conn_id: Uuid) {
        handle.cmd_tx.send(GameCommand::Disconnect { user_id, conn_id }).await.unwrap();
    }

    async fn reset_message(rx: &mut broadcast::Receiver<GameEvent>, user: Uuid) -> String {
        loop {
            if let ServerMsg::Reset { message } = next_for(rx, user).await {
                return message;
            }
        }
    }

    /// Wait until the room has applied the move at `cell`.
    async fn moved(rx: &mut broadcast::Receiver<GameEvent>, watcher: Uuid, cell: usize) {
        loop {
            if let ServerMsg::MoveMade { cell: c, .. } = next_for(rx, watcher).await {
                if c == cell {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn ranked_game_to_a_win_records_results() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        for (user, cell) in [(f.x.id, 0), (f.o.id, 3), (f.x.id, 1), (f.o.id, 4), (f.x.id, 2)] {
            mv(&handle, user, cell).await;
        }

        let (winner, reason, results) = game_over(&mut rx, f.o.id).await;
        assert_eq!(winner, Some(f.x.id));
        assert_eq!(reason, EndReason::Line);
        assert_eq!(results.len(), 2);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, RoomStatus::Finished);
        assert_eq!(f.ctx.store.user(f.x.id).unwrap().stats.wins, 1);
        assert_eq!(f.ctx.store.games_for(f.o.id, 10).len(), 1);
        assert!(f.ctx.registry.active_room_of(f.x.id).is_none());
    }

    #[tokio::test]
    async fn out_of_turn_and_occupied_moves_are_rejected() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        mv(&handle, f.o.id, 0).await;
        match next_for(&mut rx, f.o.id).await {
            ServerMsg::ErrorMessage { message } => assert_eq!(message, MoveError::NotYourTurn.to_string()),
            other => panic!("unexpected {other:?}"),
        }

        mv(&handle, f.x.id, 4).await;
        mv(&handle, f.o.id, 4).await;
        loop {
            if let ServerMsg::ErrorMessage { message } = next_for(&mut rx, f.o.id).await {
                assert_eq!(message, MoveError::Occupied.to_string());
                break;
            }
        }

        let stranger = Uuid::new_v4();
        mv(&handle, stranger, 5).await;
        match next_for(&mut rx, stranger).await {
            ServerMsg::ErrorMessage { message } => assert_eq!(message, MoveError::NotAPlayer.to_string()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn turn_timeout_forfeits_player_to_move() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        mv(&handle, f.x.id, 4).await;
        moved(&mut rx, f.x.id, 4).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let (winner, reason, _) = game_over(&mut rx, f.x.id).await;
        assert_eq!(reason, EndReason::Timeout);
        assert_eq!(winner, Some(f.x.id));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_past_grace_forfeits() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        let socket = Uuid::new_v4();
        attach(&handle, f.o.id, socket).await.unwrap();
        detach(&handle, f.o.id, socket).await;
        loop {
            if let ServerMsg::OpponentDisconnected { user_id, .. } = next_for(&mut rx, f.x.id).await {
                assert_eq!(user_id, f.o.id);
                break;
            }
        }

        // X keeps the turn timer alive by playing.
        tokio::time::advance(Duration::from_secs(20)).await;
        mv(&handle, f.x.id, 0).await;
        moved(&mut rx, f.x.id, 0).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let (winner, reason, _) = game_over(&mut rx, f.x.id).await;
        assert_eq!(reason, EndReason::Disconnect);
        assert_eq!(winner, Some(f.x.id));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_keeps_game_alive() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        let first = Uuid::new_v4();
        attach(&handle, f.o.id, first).await.unwrap();
        detach(&handle, f.o.id, first).await;
        loop {
            if let ServerMsg::OpponentDisconnected { .. } = next_for(&mut rx, f.x.id).await {
                break;
            }
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        attach(&handle, f.o.id, Uuid::new_v4()).await.unwrap();
        loop {
            if let ServerMsg::OpponentReconnected { .. } = next_for(&mut rx, f.x.id).await {
                break;
            }
        }
        mv(&handle, f.x.id, 0).await;
        moved(&mut rx, f.x.id, 0).await;
        tokio::time::advance(Duration::from_secs(25)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, RoomStatus::Playing);
        assert!(snapshot.seats.iter().all(|s| s.user_id != f.o.id || s.connected));
    }

    #[tokio::test]
    async fn private_room_seats_second_player_and_charges_both() {
        let f = fixture();
        let handle = create_room(f.ctx.clone(), RoomKind::Private, &[(f.x.id, f.x.username.clone())]);
        let code = handle.invite_code.clone().unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(f.ctx.registry.room_by_invite(&code).unwrap().room_id, handle.room_id);

        let (reply, rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(GameCommand::Seat { user_id: f.o.id, username: f.o.username.clone(), reply })
            .await
            .unwrap();
        let snapshot = rx.await.unwrap().unwrap();
        assert_eq!(snapshot.status, RoomStatus::Playing);
        assert_eq!(snapshot.seats.len(), 2);

        let lives = |id| f.ctx.store.user(id).unwrap().energy.lives;
        assert_eq!(lives(f.x.id), 4);
        assert_eq!(lives(f.o.id), 4);

        let (reply, rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(GameCommand::Seat { user_id: Uuid::new_v4(), username: "late".into(), reply })
            .await
            .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn rematch_swaps_marks() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        handle.cmd_tx.send(GameCommand::Resign { user_id: f.o.id }).await.unwrap();
        let (winner, reason, _) = game_over(&mut rx, f.x.id).await;
        assert_eq!((winner, reason), (Some(f.x.id), EndReason::Resign));

        handle.cmd_tx.send(GameCommand::Rematch { user_id: f.x.id }).await.unwrap();
        handle.cmd_tx.send(GameCommand::Rematch { user_id: f.o.id }).await.unwrap();

        loop {
            if let ServerMsg::RematchStarted { room } = next_for(&mut rx, f.x.id).await {
                let x_seat = room.seats.iter().find(|s| s.mark == Mark::X).unwrap();
                assert_eq!(x_seat.user_id, f.o.id);
                assert_eq!(room.status, RoomStatus::Playing);
                break;
            }
        }
        assert_eq!(f.ctx.registry.active_room_of(f.x.id), Some(handle.room_id));
    }

    #[tokio::test]
    async fn room_chat_is_broadcast_and_kept() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        handle
            .cmd_tx
            .send(GameCommand::Chat { user_id: f.x.id, text: "  good luck  ".into() })
            .await
            .unwrap();
        match next_for(&mut rx, f.o.id).await {
            ServerMsg::RoomChat { message } => assert_eq!(message.text, "good luck"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handle.snapshot().await.unwrap().chat.len(), 1);
        assert_eq!(f.ctx.store.room_messages(handle.room_id, 10).len(), 1);
    }

    #[tokio::test]
    async fn terminate_aborts_without_stats() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        handle
            .cmd_tx
            .send(GameCommand::Terminate { reason: "Closed by admin".into() })
            .await
            .unwrap();
        let (_, reason, results) = game_over(&mut rx, f.x.id).await;
        assert_eq!(reason, EndReason::Aborted);
        assert!(results.is_empty());
        match next_for(&mut rx, f.x.id).await {
            ServerMsg::Reset { message } => assert_eq!(message, "Closed by admin"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(f.ctx.registry.room(handle.room_id).is_none());
        assert_eq!(f.ctx.store.user(f.x.id).unwrap().stats.games_played, 0);
    }
    #[tokio::test(start_paused = true)]
    async fn closing_one_of_two_sockets_keeps_seat_online() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        let (phone, laptop) = (Uuid::new_v4(), Uuid::new_v4());
        attach(&handle, f.o.id, phone).await.unwrap();
        attach(&handle, f.o.id, laptop).await.unwrap();
        detach(&handle, f.o.id, phone).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        mv(&handle, f.x.id, 0).await;
        moved(&mut rx, f.x.id, 0).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, RoomStatus::Playing);
        let o_seat = snapshot.seats.iter().find(|s| s.user_id == f.o.id).unwrap();
        assert!(o_seat.connected);

        detach(&handle, f.o.id, laptop).await;
        loop {
            if let ServerMsg::OpponentDisconnected { user_id, .. } = next_for(&mut rx, f.x.id).await {
                assert_eq!(user_id, f.o.id);
                break;
            }
        }
    }

    #[tokio::test]
    async fn strangers_cannot_attach() {
        let f = fixture();
        let handle = ranked(&f);
        let err = attach(&handle, Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert!(attach(&handle, f.x.id, Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn rematch_refused_while_a_player_is_in_another_room() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        handle.cmd_tx.send(GameCommand::Resign { user_id: f.o.id }).await.unwrap();
        game_over(&mut rx, f.x.id).await;

        let elsewhere = Uuid::new_v4();
        f.ctx.registry.user_rooms.insert(f.x.id, elsewhere);
        handle.cmd_tx.send(GameCommand::Rematch { user_id: f.x.id }).await.unwrap();
        handle.cmd_tx.send(GameCommand::Rematch { user_id: f.o.id }).await.unwrap();

        loop {
            if let ServerMsg::ErrorMessage { message } = next_for(&mut rx, f.o.id).await {
                assert!(message.contains("already playing"), "{message}");
                break;
            }
        }
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status, RoomStatus::Finished);
        assert!(snapshot.rematch_requests.is_empty());
        assert_eq!(f.ctx.registry.active_room_of(f.x.id), Some(elsewhere));
        assert_eq!(f.ctx.registry.active_room_of(f.o.id), None);
        assert_eq!(f.ctx.store.user(f.x.id).unwrap().energy.lives, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rematch_window_expiry_closes_room() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        handle.cmd_tx.send(GameCommand::Resign { user_id: f.x.id }).await.unwrap();
        game_over(&mut rx, f.o.id).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(reset_message(&mut rx, f.o.id).await, "Room closed");
        assert!(f.ctx.registry.room(handle.room_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_room_closes_when_creator_stays_away() {
        let f = fixture();
        let handle = create_room(f.ctx.clone(), RoomKind::Private, &[(f.x.id, f.x.username.clone())]);
        let mut rx = handle.event_tx.subscribe();
        let code = handle.invite_code.clone().unwrap();

        let socket = Uuid::new_v4();
        attach(&handle, f.x.id, socket).await.unwrap();
        detach(&handle, f.x.id, socket).await;
        handle.snapshot().await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(reset_message(&mut rx, f.x.id).await, "Room creator left");
        assert!(f.ctx.registry.room_by_invite(&code).is_none());
        assert!(f.ctx.registry.active_room_of(f.x.id).is_none());
    }

    #[tokio::test]
    async fn deleted_message_leaves_room_history() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        handle
            .cmd_tx
            .send(GameCommand::Chat { user_id: f.o.id, text: "abusive".into() })
            .await
            .unwrap();
        let id = match next_for(&mut rx, f.x.id).await {
            ServerMsg::RoomChat { message } => message.id,
            other => panic!("unexpected {other:?}"),
        };

        chat::delete_message(&f.ctx.store, id).unwrap();
        handle.cmd_tx.send(GameCommand::DeleteMessage { id }).await.unwrap();
        match next_for(&mut rx, f.x.id).await {
            ServerMsg::ChatDeleted { message_id, .. } => assert_eq!(message_id, id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(handle.snapshot().await.unwrap().chat.is_empty());
        assert!(f.ctx.store.room_messages(handle.room_id, 10).is_empty());
    }

    #[tokio::test]
    async fn kicked_player_forfeits_and_room_closes() {
        let f = fixture();
        let handle = ranked(&f);
        let mut rx = handle.event_tx.subscribe();

        handle
            .cmd_tx
            .send(GameCommand::Kick { user_id: f.o.id, reason: "Player removed".into() })
            .await
            .unwrap();
        let (winner, reason, _) = game_over(&mut rx, f.x.id).await;
        assert_eq!((winner, reason), (Some(f.x.id), EndReason::Resign));
        assert_eq!(reset_message(&mut rx, f.x.id).await, "Player removed");
        assert!(f.ctx.registry.room(handle.room_id).is_none());
        assert!(f.ctx.registry.active_room_of(f.x.id).is_none());
    }
}
