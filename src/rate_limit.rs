use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;

use crate::api::AppState;
use crate::config::RateLimitConfig;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Auth,
    Api,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter per client and policy.
pub struct RateLimiter {
    cfg: RateLimitConfig,
    windows: DashMap<(String, Policy), Window>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            windows: DashMap::new(),
        }
    }

    fn window_len(&self) -> Duration {
        Duration::from_secs(self.cfg.window_seconds.max(1))
    }

    fn limit(&self, policy: Policy) -> u32 {
        match policy {
            Policy::Auth => self.cfg.auth_requests,
            Policy::Api => self.cfg.api_requests,
        }
    }

    pub fn check(&self, key: &str, policy: Policy) -> Result<(), u64> {
        self.check_at(key, policy, Instant::now())
    }

    /// Count one request. `Err` carries the seconds until the window resets.
    pub fn check_at(&self, key: &str, policy: Policy, now: Instant) -> Result<(), u64> {
        let window_len = self.window_len();
        let mut window = self
            .windows
            .entry((key.to_string(), policy))
            .or_insert(Window { started: now, count: 0 });

        if now.duration_since(window.started) >= window_len {
            *window = Window { started: now, count: 0 };
        }
        if window.count >= self.limit(policy) {
            let reset_in = window_len.saturating_sub(now.duration_since(window.started));
            return Err(reset_in.as_secs().max(1));
        }
        window.count += 1;
        Ok(())
    }

    /// Drop windows that have expired.
    pub fn prune(&self, now: Instant) -> usize {
        let window_len = self.window_len();
        let before = self.windows.len();
        self.windows.retain(|_, w| now.duration_since(w.started) < window_len);
        before - self.windows.len()
    }

    pub async fn prune_task(self: std::sync::Arc<Self>) {
        let mut interval = tokio::time::interval(self.window_len());
        loop {
            interval.tick().await;
            let pruned = self.prune(Instant::now());
            if pruned > 0 {
                tracing::debug!("Pruned {} rate limit windows", pruned);
            }
        }
    }
}

/// First `X-Forwarded-For` hop, else the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn enforce(state: &AppState, policy: Policy, req: Request, next: Next) -> Result<Response, AppError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(req.headers(), peer);

    if let Err(retry_after_secs) = state.limiter.check(&key, policy) {
        tracing::warn!("Rate limited {} on {:?} ({})", key, policy, req.uri().path());
        return Err(AppError::RateLimited { retry_after_secs });
    }
    Ok(next.run(req).await)
}

pub async fn limit_auth(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, AppError> {
    enforce(&state, Policy::Auth, req, next).await
}

pub async fn limit_api(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, AppError> {
    enforce(&state, Policy::Api, req, next).await
}
