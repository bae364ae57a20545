//! Per-tenant event rate limiting.
//!
//! Fixed windows: each tenant gets `ceiling` accepted events per window;
//! the counter resets once the window lapses. Enforcement happens after
//! classification and before dispatch, so the webhook ack is unaffected.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Counter state for one tenant.
#[derive(Debug, Clone)]
struct RateLimitWindow {
    count: u32,
    window_reset_at: DateTime<Utc>,
}

/// Fixed-window rate limiter keyed by tenant id.
pub struct RateLimiter {
    ceiling: u32,
    window: Duration,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    /// `ceiling` accepted events per tenant per `window_secs` seconds.
    pub fn new(ceiling: u32, window_secs: i64) -> Self {
        Self {
            ceiling,
            window: Duration::seconds(window_secs),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count an event for a tenant; `true` means it may proceed.
    pub fn check(&self, tenant_id: &str) -> bool {
        self.check_at(tenant_id, Utc::now())
    }

    /// Count an event with an explicit clock.
    pub fn check_at(&self, tenant_id: &str, now: DateTime<Utc>) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            // A poisoned lock fails open; dropping events over a counter
            // bug would be worse than briefly unmetered traffic.
            return true;
        };

        let window = windows
            .entry(tenant_id.to_string())
            .or_insert_with(|| RateLimitWindow {
                count: 0,
                window_reset_at: now + self.window,
            });

        if now > window.window_reset_at {
            window.count = 0;
            window.window_reset_at = now + self.window;
        }

        window.count += 1;
        window.count <= self.ceiling
    }
}
