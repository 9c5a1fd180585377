use askama::Template;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::AdminUser;
use crate::chat;
use crate::energy::EnergyView;
use crate::error::{AppError, AppResult};
use crate::game::GameCommand;
use crate::matchmaking::QueueStats;
use crate::types::*;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub users: usize,
    pub banned_users: usize,
    pub online_users: usize,
    pub active_rooms: usize,
    pub finished_games: usize,
    pub matchmaking: QueueStats,
}

impl AdminStats {
    pub fn collect(state: &AppState) -> Self {
        Self {
            users: state.store.user_count(),
            banned_users: state.store.banned_count(),
            online_users: state.hub.online_count(),
            active_rooms: state.registry.rooms.len(),
            finished_games: state.store.game_count(),
            matchmaking: state.matchmaker.stats(),
        }
    }
}

#[derive(Template)]
#[template(path = "admin.html")]
struct AdminTemplate {
    users: usize,
    banned_users: usize,
    online_users: usize,
    active_rooms: usize,
    finished_games: usize,
    players_in_queue: usize,
    matches_made: u64,
}

pub async fn admin_page(State(state): State<AppState>) -> impl IntoResponse {
    let stats = AdminStats::collect(&state);
    let page = AdminTemplate {
        users: stats.users,
        banned_users: stats.banned_users,
        online_users: stats.online_users,
        active_rooms: stats.active_rooms,
        finished_games: stats.finished_games,
        players_in_queue: stats.matchmaking.players_in_queue,
        matches_made: stats.matchmaking.matches_made,
    };
    match page.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => AppError::Internal(e.to_string()).into_response(),
    }
}

pub async fn stats(_admin: AdminUser, State(state): State<AppState>) -> Json<AdminStats> {
    Json(AdminStats::collect(&state))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

pub async fn users(
    _admin: AdminUser,
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Json<Vec<UserSummary>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let users = state.store.search_users(query.q.trim(), limit);
    Json(users.iter().map(UserSummary::from).collect())
}

fn set_banned(state: &AppState, id: Uuid, banned: bool) -> AppResult<UserSummary> {
    state
        .store
        .update_user(id, |u| {
            u.banned = banned;
            UserSummary::from(&*u)
        })
        .ok_or_else(|| AppError::not_found("User not found"))
}

pub async fn ban(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserSummary>> {
    if admin.id == id {
        return Err(AppError::bad_request("Cannot ban yourself"));
    }
    let summary = set_banned(&state, id, true)?;
    let _ = state.matchmaker.leave(id);
    state.matchmaker.clear_pending(id);
    if let Some(handle) = state.registry.active_room_of(id).and_then(|room| state.registry.room(room)) {
        let _ = handle
            .cmd_tx
            .send(GameCommand::Kick {
                user_id: id,
                reason: "A player was removed by an administrator".to_string(),
            })
            .await;
    }
    state.hub.kick(id, "Your account has been banned");
    tracing::info!("Admin {} banned {}", admin.username, summary.profile.username);
    Ok(Json(summary))
}

pub async fn unban(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserSummary>> {
    let summary = set_banned(&state, id, false)?;
    tracing::info!("Admin {} unbanned {}", admin.username, summary.profile.username);
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    role: Role,
}

pub async fn set_role(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RoleRequest>,
) -> AppResult<Json<UserSummary>> {
    if admin.id == id && req.role != Role::Admin {
        return Err(AppError::bad_request("Cannot demote yourself"));
    }
    let summary = state
        .store
        .update_user(id, |u| {
            u.role = req.role;
            UserSummary::from(&*u)
        })
        .ok_or_else(|| AppError::not_found("User not found"))?;
    tracing::info!("Admin {} set role of {} to {:?}", admin.username, summary.profile.username, req.role);
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct EnergyRequest {
    lives: u32,
}

pub async fn set_energy(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<EnergyRequest>,
) -> AppResult<Json<EnergyView>> {
    let cfg = &state.config.energy;
    let view = state
        .store
        .update_user(id, |u| u.energy.set(req.lives, cfg, Utc::now()))
        .ok_or_else(|| AppError::not_found("User not found"))?;
    tracing::info!("Admin {} set energy of {} to {}", admin.username, id, view.lives);
    Ok(Json(view))
}

pub async fn rooms(_admin: AdminUser, State(state): State<AppState>) -> Json<Vec<RoomSnapshot>> {
    let handles: Vec<_> = state.registry.rooms.iter().map(|r| r.value().clone()).collect();
    let mut snapshots = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Some(snapshot) = handle.snapshot().await {
            snapshots.push(snapshot);
        }
    }
    Json(snapshots)
}

pub async fn terminate_room(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let handle = state
        .registry
        .room(id)
        .ok_or_else(|| AppError::not_found("Room not found"))?;
    handle
        .cmd_tx
        .send(GameCommand::Terminate {
            reason: "Room closed by an administrator".to_string(),
        })
        .await
        .map_err(|_| AppError::not_found("Room not found"))?;
    tracing::info!("Admin {} terminated room {}", admin.username, id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_message(
    AdminUser(admin): AdminUser,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let message = chat::delete_message(&state.store, id)?;
    if let ChatTarget::Room { room_id } = message.target {
        if let Some(handle) = state.registry.room(room_id) {
            let _ = handle.cmd_tx.send(GameCommand::DeleteMessage { id }).await;
        }
    }
    tracing::info!("Admin {} deleted message {} from {}", admin.username, id, message.from_name);
    Ok(StatusCode::NO_CONTENT)
}
