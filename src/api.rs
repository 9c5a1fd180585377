use std::sync::Arc;

use askama::Template;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{Html, IntoResponse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::accounts::{self, LoginRequest, RegisterRequest, UpdateProfileRequest};
use crate::admin;
use crate::auth::{self, AuthUser};
use crate::board::Mark;
use crate::chat;
use crate::config::ServerConfig;
use crate::energy::EnergyView;
use crate::error::{AppError, AppResult};
use crate::friends::{self, FriendEntry, PendingRequests, RequestOutcome};
use crate::game::{self, GameCommand, Registry, RoomContext};
use crate::hub::Hub;
use crate::matchmaking::{self, JoinOutcome, Matchmaker, QueueEntry, QueueStatus};
use crate::rate_limit::{self, RateLimiter};
use crate::store::Store;
use crate::types::*;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<ServerConfig>,
    pub registry: Arc<Registry>,
    pub hub: Arc<Hub>,
    pub matchmaker: Arc<Matchmaker>,
    pub limiter: Arc<RateLimiter>,
    pub base_url: String,
}

impl AppState {
    pub fn new(store: Arc<Store>, config: ServerConfig, base_url: String) -> Self {
        Self {
            matchmaker: Arc::new(Matchmaker::new(config.matchmaking.clone())),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            config: Arc::new(config),
            store,
            registry: Registry::new(),
            hub: Hub::new(),
            base_url,
        }
    }

    pub fn room_ctx(&self) -> RoomContext {
        RoomContext {
            store: self.store.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
        }
    }
}

// ─── Templates ────────────────────────────────────────────────────

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    base_url: String,
}

async fn index_page(State(state): State<AppState>) -> impl IntoResponse {
    let page = IndexTemplate {
        base_url: state.base_url.clone(),
    };
    match page.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => AppError::Internal(e.to_string()).into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

// ─── Auth ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SessionResponse {
    token: String,
    user: PrivateProfile,
}

fn session(state: &AppState, user: &User) -> AppResult<Json<SessionResponse>> {
    Ok(Json(SessionResponse {
        token: auth::issue_token(user, &state.config)?,
        user: accounts::private_profile(&state.store, &state.config, user.id)?,
    }))
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<SessionResponse>)> {
    let (store, config) = (state.store.clone(), state.config.clone());
    let user = auth::off_thread(move || accounts::register(&store, &config, req)).await?;
    Ok((StatusCode::CREATED, session(&state, &user)?))
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> AppResult<Json<SessionResponse>> {
    let store = state.store.clone();
    let user = auth::off_thread(move || accounts::login(&store, req)).await?;
    session(&state, &user)
}

// ─── Users ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max)
    }
}

async fn me(AuthUser(user): AuthUser, State(state): State<AppState>) -> AppResult<Json<PrivateProfile>> {
    accounts::private_profile(&state.store, &state.config, user.id).map(Json)
}

async fn update_me(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<UpdateProfileRequest>,
) -> AppResult<Json<PrivateProfile>> {
    accounts::update_profile(&state.store, user.id, req)?;
    accounts::private_profile(&state.store, &state.config, user.id).map(Json)
}

async fn my_energy(AuthUser(user): AuthUser, State(state): State<AppState>) -> AppResult<Json<EnergyView>> {
    accounts::energy(&state.store, &state.config, user.id, Utc::now()).map(Json)
}

async fn my_games(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<GameRecord>> {
    Json(state.store.games_for(user.id, query.limit(20, 100)))
}

async fn search_users(
    _user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<PublicProfile>>> {
    let prefix = query.q.trim();
    if prefix.is_empty() {
        return Err(AppError::bad_request("Search query cannot be empty"));
    }
    let found = state.store.search_users(prefix, query.limit(20, 50));
    Ok(Json(found.iter().filter(|u| !u.banned).map(PublicProfile::from).collect()))
}

async fn user_profile(
    _user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<PublicProfile>> {
    accounts::public_profile(&state.store, id).map(Json)
}

async fn leaderboard(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Vec<PublicProfile>> {
    let users = state.store.leaderboard(query.limit(50, 100));
    Json(users.iter().map(PublicProfile::from).collect())
}

// ─── Matchmaking ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "state", rename = "matched")]
struct MatchFound {
    room_id: Uuid,
    opponent: PublicProfile,
    mark: Mark,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum JoinResponse {
    Matched(MatchFound),
    Status(QueueStatus),
}

fn ensure_not_in_room(state: &AppState, user_id: Uuid) -> AppResult<()> {
    if state.registry.active_room_of(user_id).is_some() {
        return Err(AppError::conflict("You are already in a game"));
    }
    Ok(())
}

/// Starting a game needs a life; it is charged once both players are seated.
fn ensure_energy(state: &AppState, user_id: Uuid) -> AppResult<()> {
    let view = accounts::energy(&state.store, &state.config, user_id, Utc::now())?;
    if view.lives == 0 {
        return Err(AppError::NoEnergy {
            next_life_in_secs: view.next_life_in_secs,
        });
    }
    Ok(())
}

async fn join_queue(AuthUser(user): AuthUser, State(state): State<AppState>) -> AppResult<Json<JoinResponse>> {
    ensure_not_in_room(&state, user.id)?;
    ensure_energy(&state, user.id)?;

    let now = Utc::now();
    match state.matchmaker.join(QueueEntry::new(&user, now), now)? {
        JoinOutcome::Queued {
            position,
            estimated_wait_secs,
        } => Ok(Json(JoinResponse::Status(QueueStatus::Queued {
            position,
            waited_secs: 0,
            estimated_wait_secs,
        }))),
        JoinOutcome::Paired(pairing) => {
            let (opponent_id, mark) = if pairing.first.user_id == user.id {
                (pairing.second.user_id, Mark::X)
            } else {
                (pairing.first.user_id, Mark::O)
            };
            match matchmaking::start_match(&state, pairing, now) {
                Some(room_id) => {
                    state.matchmaker.clear_pending(user.id);
                    Ok(Json(JoinResponse::Matched(MatchFound {
                        room_id,
                        opponent: accounts::public_profile(&state.store, opponent_id)?,
                        mark,
                    })))
                }
                None => Ok(Json(JoinResponse::Status(state.matchmaker.status(user.id, now)))),
            }
        }
    }
}

async fn leave_queue(AuthUser(user): AuthUser, State(state): State<AppState>) -> AppResult<StatusCode> {
    state.matchmaker.leave(user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn queue_status(AuthUser(user): AuthUser, State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.matchmaker.status(user.id, Utc::now()))
}

// ─── Rooms ────────────────────────────────────────────────────────

async fn create_room(AuthUser(user): AuthUser, State(state): State<AppState>) -> AppResult<(StatusCode, Json<RoomSnapshot>)> {
    ensure_not_in_room(&state, user.id)?;
    if state.matchmaker.leave(user.id).is_ok() {
        tracing::debug!("{} left the queue to host a private room", user.username);
    }
    ensure_energy(&state, user.id)?;

    let handle = game::create_room(state.room_ctx(), RoomKind::Private, &[(user.id, user.username.clone())]);
    let snapshot = handle
        .snapshot()
        .await
        .ok_or_else(|| AppError::Internal("room task stopped".to_string()))?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomRequest {
    invite_code: String,
}

async fn join_room(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<JoinRoomRequest>,
) -> AppResult<Json<RoomSnapshot>> {
    let code = req.invite_code.trim();
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::bad_request("Invalid invite code"));
    }
    let handle = state
        .registry
        .room_by_invite(code)
        .ok_or_else(|| AppError::not_found("Room not found"))?;
    if state.registry.active_room_of(user.id).is_some_and(|r| r != handle.room_id) {
        return Err(AppError::conflict("You are already in a game"));
    }

    let (reply, rx) = oneshot::channel();
    handle
        .cmd_tx
        .send(GameCommand::Seat {
            user_id: user.id,
            username: user.username.clone(),
            reply,
        })
        .await
        .map_err(|_| AppError::not_found("Room not found"))?;
    let snapshot = rx.await.map_err(|_| AppError::not_found("Room not found"))??;
    let _ = state.matchmaker.leave(user.id);
    Ok(Json(snapshot))
}

async fn room_state(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<RoomSnapshot>> {
    let handle = state.registry.room(id).ok_or_else(|| AppError::not_found("Room not found"))?;
    let snapshot = handle
        .snapshot()
        .await
        .ok_or_else(|| AppError::not_found("Room not found"))?;
    let seated = snapshot.seats.iter().any(|s| s.user_id == user.id);
    if !seated && user.role != Role::Admin {
        return Err(AppError::forbidden("You are not in this room"));
    }
    Ok(Json(snapshot))
}

/// A finished game with the chat from its room.
#[derive(Debug, Serialize)]
struct GameDetail {
    #[serde(flatten)]
    record: GameRecord,
    chat: Vec<ChatMessage>,
}

async fn game_record(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<GameDetail>> {
    let record = state
        .store
        .game(id)
        .ok_or_else(|| AppError::not_found("Game not found"))?;
    if user.id != record.player_x && user.id != record.player_o && user.role != Role::Admin {
        return Err(AppError::forbidden("You did not play in this game"));
    }
    let chat = state.store.room_messages(record.room_id, 200);
    Ok(Json(GameDetail { record, chat }))
}

// ─── Friends ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendRequestBody {
    user_id: Uuid,
}

async fn friend_list(AuthUser(user): AuthUser, State(state): State<AppState>) -> Json<Vec<FriendEntry>> {
    Json(friends::list(&state.store, &state.hub, user.id))
}

async fn friend_requests(AuthUser(user): AuthUser, State(state): State<AppState>) -> Json<PendingRequests> {
    Json(friends::pending(&state.store, user.id))
}

async fn send_friend_request(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(body): Json<FriendRequestBody>,
) -> AppResult<Json<RequestOutcome>> {
    friends::request(&state.store, &state.hub, user.id, body.user_id).map(Json)
}

async fn accept_friend(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    friends::accept(&state.store, &state.hub, id, user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn decline_friend(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    friends::decline(&state.store, id, user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_friend(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(friend): Path<Uuid>,
) -> AppResult<StatusCode> {
    friends::remove(&state.store, user.id, friend)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Direct messages ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessageBody {
    text: String,
}

async fn conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(other): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ChatMessage>>> {
    chat::conversation(&state.store, user.id, other, query.limit.unwrap_or(50)).map(Json)
}

async fn send_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(to): Path<Uuid>,
    Json(body): Json<MessageBody>,
) -> AppResult<(StatusCode, Json<ChatMessage>)> {
    let message = chat::send_direct(&state.store, &state.hub, &user, to, &body.text)?;
    Ok((StatusCode::CREATED, Json(message)))
}

// ─── Router ───────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit::limit_auth));

    let api_routes = Router::new()
        .route("/api/users/me", get(me).patch(update_me))
        .route("/api/users/me/energy", get(my_energy))
        .route("/api/users/me/games", get(my_games))
        .route("/api/users/search", get(search_users))
        .route("/api/users/{id}", get(user_profile))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/matchmaking", post(join_queue).delete(leave_queue).get(queue_status))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/join", post(join_room))
        .route("/api/rooms/{id}", get(room_state))
        .route("/api/games/{id}", get(game_record))
        .route("/api/friends", get(friend_list))
        .route("/api/friends/requests", get(friend_requests).post(send_friend_request))
        .route("/api/friends/requests/{id}/accept", post(accept_friend))
        .route("/api/friends/requests/{id}/decline", post(decline_friend))
        .route("/api/friends/{user_id}", delete(remove_friend))
        .route("/api/messages/{user_id}", get(conversation).post(send_message))
        .route("/api/admin/stats", get(admin::stats))
        .route("/api/admin/users", get(admin::users))
        .route("/api/admin/users/{id}/ban", post(admin::ban))
        .route("/api/admin/users/{id}/unban", post(admin::unban))
        .route("/api/admin/users/{id}/role", post(admin::set_role))
        .route("/api/admin/users/{id}/energy", post(admin::set_energy))
        .route("/api/admin/rooms", get(admin::rooms))
        .route("/api/admin/rooms/{id}", delete(admin::terminate_room))
        .route("/api/admin/messages/{id}", delete(admin::delete_message))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit::limit_api));

    Router::new()
        .route("/", get(index_page))
        .route("/admin", get(admin::admin_page))
        .route("/healthz", get(healthz))
        .route("/ws", get(ws::ws_handler))
        .merge(auth_routes)
        .merge(api_routes)
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
