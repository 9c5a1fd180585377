use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth;
use crate::board::Mark;
use crate::config::ServerConfig;
use crate::energy::{Energy, EnergyView};
use crate::error::{AppError, AppResult};
use crate::store::{Store, StoreError};
use crate::types::*;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

pub fn validate_username(username: &str) -> AppResult<()> {
    let len = username.chars().count();
    if !(3..=20).contains(&len) {
        return Err(AppError::bad_request("Username must be between 3 and 20 characters"));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::bad_request(
            "Username may only contain letters, digits and underscores",
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> AppResult<()> {
    let len = password.chars().count();
    if len < 6 {
        return Err(AppError::bad_request("Password must be at least 6 characters"));
    }
    if len > 128 {
        return Err(AppError::bad_request("Password cannot exceed 128 characters"));
    }
    Ok(())
}

fn validate_email(email: &str) -> AppResult<()> {
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(AppError::bad_request("Invalid email address"));
    }
    Ok(())
}

pub fn register(store: &Store, cfg: &ServerConfig, req: RegisterRequest) -> AppResult<User> {
    let username = req.username.trim().to_string();
    validate_username(&username)?;
    validate_password(&req.password)?;
    let email = req.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
    if let Some(email) = &email {
        validate_email(email)?;
    }

    let role = if cfg
        .admin_usernames
        .iter()
        .any(|a| a.eq_ignore_ascii_case(&username))
    {
        Role::Admin
    } else {
        Role::Player
    };

    let now = Utc::now();
    let salt = auth::new_salt();
    let user = User {
        id: Uuid::new_v4(),
        display_name: username.clone(),
        username,
        email,
        password_hash: auth::hash_password(&req.password, &salt),
        salt,
        role,
        banned: false,
        avatar: None,
        created_at: now,
        last_seen: now,
        stats: Stats::default(),
        xp: 0,
        level: 1,
        skill: cfg.progression.starting_skill,
        energy: Energy::full(&cfg.energy, now),
    };

    store.insert_user(user.clone()).map_err(|e| match e {
        StoreError::UsernameTaken => AppError::conflict("Username is already taken"),
    })?;
    tracing::info!("Registered user {} ({:?})", user.username, user.role);
    Ok(user)
}

pub fn login(store: &Store, req: LoginRequest) -> AppResult<User> {
    let invalid = || AppError::Unauthorized("Invalid username or password".to_string());
    let user = store.user_by_username(req.username.trim()).ok_or_else(invalid)?;
    if !auth::verify_password(&req.password, &user.salt, &user.password_hash) {
        return Err(invalid());
    }
    if user.banned {
        return Err(AppError::forbidden("Account is banned"));
    }
    store.update_user(user.id, |u| u.last_seen = Utc::now());
    Ok(user)
}

fn require_user<R>(store: &Store, id: Uuid, f: impl FnOnce(&mut User) -> R) -> AppResult<R> {
    store
        .update_user(id, f)
        .ok_or_else(|| AppError::not_found("User not found"))
}

/// Owner view; applies pending energy regeneration first.
pub fn private_profile(store: &Store, cfg: &ServerConfig, id: Uuid) -> AppResult<PrivateProfile> {
    let now = Utc::now();
    require_user(store, id, |u| {
        let energy = u.energy.current(&cfg.energy, now);
        PrivateProfile {
            profile: PublicProfile::from(&*u),
            email: u.email.clone(),
            role: u.role,
            xp: u.xp,
            energy,
            created_at: u.created_at,
        }
    })
}

pub fn public_profile(store: &Store, id: Uuid) -> AppResult<PublicProfile> {
    store
        .user(id)
        .map(|u| PublicProfile::from(&u))
        .ok_or_else(|| AppError::not_found("User not found"))
}

pub fn update_profile(store: &Store, id: Uuid, req: UpdateProfileRequest) -> AppResult<()> {
    let display_name = req.display_name.map(|d| d.trim().to_string());
    if let Some(name) = &display_name {
        let len = name.chars().count();
        if !(1..=32).contains(&len) {
            return Err(AppError::bad_request("Display name must be between 1 and 32 characters"));
        }
    }
    if let Some(avatar) = &req.avatar {
        if avatar.len() > 256 {
            return Err(AppError::bad_request("Avatar cannot exceed 256 characters"));
        }
    }
    require_user(store, id, |u| {
        if let Some(name) = display_name {
            u.display_name = name;
        }
        if let Some(avatar) = req.avatar {
            u.avatar = (!avatar.is_empty()).then_some(avatar);
        }
    })
}

pub fn energy(store: &Store, cfg: &ServerConfig, id: Uuid, now: DateTime<Utc>) -> AppResult<EnergyView> {
    require_user(store, id, |u| u.energy.current(&cfg.energy, now))
}

pub fn consume_energy(store: &Store, cfg: &ServerConfig, id: Uuid, now: DateTime<Utc>) -> AppResult<EnergyView> {
    require_user(store, id, |u| u.energy.try_consume(&cfg.energy, now))?.map_err(AppError::from)
}

pub fn refund_energy(store: &Store, cfg: &ServerConfig, id: Uuid, now: DateTime<Utc>) {
    store.update_user(id, |u| u.energy.refund(&cfg.energy, now));
}

/// Both players pay one life, or neither does.
pub fn consume_pair(
    store: &Store,
    cfg: &ServerConfig,
    a: Uuid,
    b: Uuid,
    now: DateTime<Utc>,
) -> Result<(), (Uuid, AppError)> {
    consume_energy(store, cfg, a, now).map_err(|e| (a, e))?;
    if let Err(e) = consume_energy(store, cfg, b, now) {
        refund_energy(store, cfg, a, now);
        return Err((b, e));
    }
    Ok(())
}

pub fn level_for(xp: u64) -> u32 {
    (xp / 100) as u32 + 1
}

/// Elo rating change for a player scoring `score` (1, 0.5, 0) against `opponent`.
pub fn elo_change(skill: i32, opponent: i32, score: f64, k: f64) -> i32 {
    let expected = 1.0 / (1.0 + 10f64.powf((opponent - skill) as f64 / 400.0));
    (k * (score - expected)).round() as i32
}

/// Apply a finished game to both players' stats, XP, level and (ranked only) skill.
pub fn record_result(store: &Store, cfg: &ServerConfig, record: &GameRecord) -> Vec<ResultDelta> {
    if record.reason == EndReason::Aborted {
        return Vec::new();
    }
    let ranked = record.kind == RoomKind::Ranked;
    let progression = &cfg.progression;

    let skill_of = |id: Uuid| store.user(id).map(|u| u.skill).unwrap_or(progression.starting_skill);
    let skill_x = skill_of(record.player_x);
    let skill_o = skill_of(record.player_o);

    let mut deltas = Vec::with_capacity(2);
    for (mark, id, skill, opponent) in [
        (Mark::X, record.player_x, skill_x, skill_o),
        (Mark::O, record.player_o, skill_o, skill_x),
    ] {
        let score = match record.winner {
            Some(w) if w == id => 1.0,
            Some(_) => 0.0,
            None => 0.5,
        };
        let xp_gained = if score == 1.0 {
            progression.xp_win
        } else if score == 0.5 {
            progression.xp_draw
        } else {
            progression.xp_loss
        };
        let skill_change = if ranked {
            elo_change(skill, opponent, score, progression.elo_k)
        } else {
            0
        };

        let delta = store.update_user(id, |u| {
            u.stats.games_played += 1;
            if score == 1.0 {
                u.stats.wins += 1;
                u.stats.current_streak += 1;
                u.stats.best_streak = u.stats.best_streak.max(u.stats.current_streak);
            } else {
                if score == 0.5 {
                    u.stats.draws += 1;
                } else {
                    u.stats.losses += 1;
                }
                u.stats.current_streak = 0;
            }
            u.xp += xp_gained;
            u.level = level_for(u.xp);
            u.skill = (u.skill + skill_change).max(0);
            ResultDelta {
                user_id: id,
                xp_gained,
                skill_change,
                level: u.level,
                skill: u.skill,
            }
        });
        if let Some(delta) = delta {
            tracing::debug!("Player {} ({}) result applied: {:?}", id, mark, delta);
            deltas.push(delta);
        }
    }
    deltas
}
