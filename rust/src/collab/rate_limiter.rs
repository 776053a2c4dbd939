use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;

use super::errors::RateLimited;
use super::model::UserId;

/// Request routes the limiter distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    CreateDraft,
    Append,
    Pass,
    AddCollaborator,
    Invite,
    AcceptInvite,
    SetStatus,
    ReadDraft,
}

impl Route {
    pub fn is_mutating(self) -> bool {
        !matches!(self, Route::ReadDraft)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Route::CreateDraft => "create_draft",
            Route::Append => "append",
            Route::Pass => "pass",
            Route::AddCollaborator => "add_collaborator",
            Route::Invite => "invite",
            Route::AcceptInvite => "accept_invite",
            Route::SetStatus => "set_status",
            Route::ReadDraft => "read_draft",
        }
    }
}

/// Who a bucket belongs to. The client IP is only used when the caller
/// has no resolved identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RateKey {
    Actor(UserId),
    Ip(IpAddr),
    Anonymous,
}

impl RateKey {
    pub fn from_parts(actor: Option<&UserId>, ip: Option<IpAddr>) -> Self {
        match (actor, ip) {
            (Some(user), _) => RateKey::Actor(user.clone()),
            (None, Some(ip)) => RateKey::Ip(ip),
            (None, None) => RateKey::Anonymous,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub mutating_per_minute: u32,
    pub mutating_burst: u32,
    pub read_per_minute: u32,
    pub read_burst: u32,
    /// Buckets untouched for this long are swept.
    pub idle_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mutating_per_minute: 60,
            mutating_burst: 10,
            read_per_minute: 600,
            read_burst: 60,
            idle_secs: 600,
        }
    }
}

/// Token bucket.
///
/// Refills at a constant rate. Each `acquire` refills based on elapsed time
/// since the last refill, then attempts to deduct one token.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    per_minute: u32,
}

impl TokenBucket {
    fn new(per_minute: u32, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_rate: f64::from(per_minute.max(1)) / 60.0,
            tokens: capacity,
            last_refill: now,
            per_minute,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn acquire(&mut self, now: Instant) -> Result<u32, RateLimited> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(self.tokens.floor() as u32)
        } else {
            let missing = 1.0 - self.tokens;
            Err(RateLimited {
                retry_after: Duration::from_secs_f64(missing / self.refill_rate),
                limit: self.per_minute,
                remaining: 0,
            })
        }
    }
}

/// Per-(caller, route) token buckets for the mutation request path.
///
/// Disabled unless `enabled` is set; a disabled limiter admits everything
/// and keeps no state.
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: DashMap<(RateKey, Route), TokenBucket>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitSettings::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Take one token for `key` on `route`. Returns the tokens left.
    pub fn check(&self, key: &RateKey, route: Route) -> Result<u32, RateLimited> {
        self.check_at(key, route, Instant::now())
    }

    fn check_at(&self, key: &RateKey, route: Route, now: Instant) -> Result<u32, RateLimited> {
        if !self.settings.enabled {
            return Ok(u32::MAX);
        }
        let (per_minute, burst) = if route.is_mutating() {
            (self.settings.mutating_per_minute, self.settings.mutating_burst)
        } else {
            (self.settings.read_per_minute, self.settings.read_burst)
        };
        let mut bucket = self
            .buckets
            .entry((key.clone(), route))
            .or_insert_with(|| TokenBucket::new(per_minute, burst, now));
        let result = bucket.acquire(now);
        if let Err(limited) = &result {
            tracing::debug!(
                route = route.as_str(),
                retry_after_ms = limited.retry_after.as_millis() as u64,
                "rate limited"
            );
        }
        result
    }

    /// Drop buckets idle past the configured period. Returns how many went.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    fn sweep_idle_at(&self, now: Instant) -> usize {
        let idle = Duration::from_secs(self.settings.idle_secs);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle);
        before - self.buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
