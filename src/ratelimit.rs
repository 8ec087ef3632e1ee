use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderMap,
};
use dashmap::DashMap;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Admission
///
/// The limiter's verdict. `retry_after` is zero when permitted and otherwise the
/// time left until the key's window resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub permitted: bool,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// FixedWindowLimiter
///
/// Counts requests per client key inside fixed windows.
///
/// The read-modify-write of a key's counter happens while holding that key's
/// `DashMap` entry, so concurrent requests sharing a key can never both observe
/// the same count.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    windows: Arc<DashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Arc::new(DashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_window, config.window)
    }

    /// allow
    ///
    /// Registers one request for `client_key` and decides whether it may proceed.
    pub fn allow(&self, client_key: &str) -> Admission {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(client_key.to_string())
            .or_insert(Window {
                started: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        entry.count = entry.count.saturating_add(1);
        if entry.count <= self.limit {
            return Admission {
                permitted: true,
                retry_after: Duration::ZERO,
            };
        }

        let remaining = self
            .window
            .saturating_sub(now.saturating_duration_since(entry.started));
        Admission {
            permitted: false,
            // Never hand out a zero retry hint for a denial.
            retry_after: remaining.max(Duration::from_millis(1)),
        }
    }

    /// purge_expired
    ///
    /// Drops keys whose window has already finished. Run periodically so idle
    /// clients do not accumulate.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        // `retain` locks one shard at a time, so the map size may grow while it
        // runs. Count the removals directly.
        let mut purged = 0;
        self.windows.retain(|_, w| {
            let live = now.saturating_duration_since(w.started) < self.window;
            if !live {
                purged += 1;
            }
            live
        });
        purged
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// client_key
///
/// The admission key for a request: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address.
pub fn client_key(request: &Request) -> String {
    if let Some(ip) = forwarded_ip(request.headers()) {
        return ip;
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_string)
}
