//! Request gate: sliding-window rate limiting per (client, path) and the
//! API-token check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

struct Bucket {
    count: u64,
    reset_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub enum RateDecision {
    Allowed {
        remaining: u64,
        reset_in: Duration,
    },
    Limited {
        retry_after: Duration,
    },
}

pub struct RateLimiter {
    max_requests: u64,
    window: Duration,
    sweep_interval: Duration,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_requests,
            window,
            // Expired buckets are recreated on sight; the sweep only bounds
            // memory for clients that never come back.
            sweep_interval: window.max(Duration::from_secs(30)),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Count one request against the (client, path) window.
    pub fn check(&self, client: &str, path: &str) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry((client.to_string(), path.to_string()))
            .or_insert(Bucket {
                count: 0,
                reset_at: now + self.window,
            });

        if bucket.reset_at <= now {
            bucket.count = 0;
            bucket.reset_at = now + self.window;
        }

        bucket.count += 1;
        let reset_in = bucket.reset_at.saturating_duration_since(now);
        if bucket.count > self.max_requests {
            RateDecision::Limited {
                retry_after: reset_in,
            }
        } else {
            RateDecision::Allowed {
                remaining: self.max_requests - bucket.count,
                reset_in,
            }
        }
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    /// Drop expired buckets; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, b| b.reset_at > now);
        let removed = before - buckets.len();
        if removed > 0 {
            tracing::debug!("[sweep:ratelimit] dropped {} expired buckets", removed);
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Check an `Authorization` header value against the configured token.
/// Accepted forms: `Bearer <t>`, `Basic base64(user:<t>)`, and the raw
/// token itself.
pub fn authorize(header: Option<&str>, token: &str) -> bool {
    let Some(value) = header else { return false };
    let value = value.trim();

    if let Some(bearer) = value.strip_prefix("Bearer ") {
        return bearer.trim() == token;
    }

    if let Some(encoded) = value.strip_prefix("Basic ") {
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            if let Ok(credentials) = String::from_utf8(decoded) {
                if let Some((_, password)) = credentials.split_once(':') {
                    return password == token;
                }
            }
        }
        return false;
    }

    value == token
}
