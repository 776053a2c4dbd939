use std::sync::{Arc, Mutex, MutexGuard};

use ahash::AHashMap;
use http::HeaderMap;
use http::header::ORIGIN;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use super::identity::IdentityChain;
use super::model::UserId;

/// Connection ceilings. Zero means unlimited.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionLimits {
    pub per_user: usize,
    pub per_room: usize,
    pub global: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            per_user: 10,
            per_room: 200,
            global: 10_000,
        }
    }
}

/// Why an upgrade was refused. Checked in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("origin {origin} is not allowed")]
    OriginForbidden { origin: String },
    #[error("authentication required")]
    Unauthorized,
    #[error("too many connections for this user (limit {limit})")]
    UserLimit { limit: usize },
    #[error("too many connections to this draft (limit {limit})")]
    RoomLimit { limit: usize },
    #[error("server connection limit reached (limit {limit})")]
    GlobalLimit { limit: usize },
}

impl GateRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OriginForbidden { .. } => "origin_forbidden",
            Self::Unauthorized => "unauthorized",
            Self::UserLimit { .. } | Self::RoomLimit { .. } | Self::GlobalLimit { .. } => {
                "ws_limit"
            }
        }
    }

    /// WebSocket close code sent after the error frame.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::OriginForbidden { .. } => 4403,
            Self::Unauthorized => 4401,
            // 1013 Try Again Later
            Self::UserLimit { .. } | Self::RoomLimit { .. } | Self::GlobalLimit { .. } => 1013,
        }
    }
}

#[derive(Default)]
struct Counts {
    per_user: AHashMap<UserId, usize>,
    per_room: AHashMap<String, usize>,
    total: usize,
}

fn lock(counts: &Mutex<Counts>) -> MutexGuard<'_, Counts> {
    counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn decrement<K: std::hash::Hash + Eq>(map: &mut AHashMap<K, usize>, key: &K) {
    if let Some(n) = map.get_mut(key) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            map.remove(key);
        }
    }
}

/// Capacity held by one admitted connection. Released on drop.
pub struct ConnectionPermit {
    counts: Arc<Mutex<Counts>>,
    user: UserId,
    room: String,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut counts = lock(&self.counts);
        decrement(&mut counts.per_user, &self.user);
        decrement(&mut counts.per_room, &self.room);
        counts.total = counts.total.saturating_sub(1);
    }
}

pub struct Admission {
    pub user_id: UserId,
    pub permit: ConnectionPermit,
}

/// Admission control in front of the hub.
pub struct Gatekeeper {
    limits: ConnectionLimits,
    allowed_origins: Vec<String>,
    identity: Arc<IdentityChain>,
    counts: Arc<Mutex<Counts>>,
}

impl Gatekeeper {
    pub fn new(
        limits: ConnectionLimits,
        allowed_origins: Vec<String>,
        identity: Arc<IdentityChain>,
    ) -> Self {
        Self {
            limits,
            allowed_origins: allowed_origins
                .into_iter()
                .map(|o| o.trim_end_matches('/').to_ascii_lowercase())
                .collect(),
            identity,
            counts: Arc::new(Mutex::new(Counts::default())),
        }
    }

    /// Origin, identity, then per-user, per-room and global ceilings. The
    /// counters are checked and taken under one lock, so concurrent upgrades
    /// cannot overshoot a ceiling.
    pub fn admit(&self, headers: &HeaderMap, room: &str) -> Result<Admission, GateRejection> {
        let result = self.check(headers, room);
        match &result {
            Ok(admission) => info!(room, user_id = %admission.user_id, "connection admitted"),
            Err(rejection) => warn!(room, code = rejection.code(), reason = %rejection, "connection rejected"),
        }
        result
    }

    fn check(&self, headers: &HeaderMap, room: &str) -> Result<Admission, GateRejection> {
        self.check_origin(headers)?;
        let user = self
            .identity
            .resolve(headers)
            .ok_or(GateRejection::Unauthorized)?;

        let mut counts = lock(&self.counts);
        let user_count = counts.per_user.get(&user).copied().unwrap_or(0);
        if exceeds(self.limits.per_user, user_count) {
            return Err(GateRejection::UserLimit {
                limit: self.limits.per_user,
            });
        }
        let room_count = counts.per_room.get(room).copied().unwrap_or(0);
        if exceeds(self.limits.per_room, room_count) {
            return Err(GateRejection::RoomLimit {
                limit: self.limits.per_room,
            });
        }
        if exceeds(self.limits.global, counts.total) {
            return Err(GateRejection::GlobalLimit {
                limit: self.limits.global,
            });
        }

        *counts.per_user.entry(user.clone()).or_insert(0) += 1;
        *counts.per_room.entry(room.to_owned()).or_insert(0) += 1;
        counts.total += 1;
        drop(counts);

        Ok(Admission {
            permit: ConnectionPermit {
                counts: Arc::clone(&self.counts),
                user: user.clone(),
                room: room.to_owned(),
            },
            user_id: user,
        })
    }

    /// Requests without an Origin header come from non-browser clients and
    /// are let through.
    fn check_origin(&self, headers: &HeaderMap) -> Result<(), GateRejection> {
        if self.allowed_origins.is_empty() {
            return Ok(());
        }
        let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };
        let normalized = origin.trim_end_matches('/').to_ascii_lowercase();
        if self
            .allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || *allowed == normalized)
        {
            Ok(())
        } else {
            Err(GateRejection::OriginForbidden {
                origin: origin.to_owned(),
            })
        }
    }

    pub fn active_connections(&self) -> usize {
        lock(&self.counts).total
    }

    pub fn user_connections(&self, user: &UserId) -> usize {
        lock(&self.counts).per_user.get(user).copied().unwrap_or(0)
    }

    pub fn room_connections(&self, room: &str) -> usize {
        lock(&self.counts).per_room.get(room).copied().unwrap_or(0)
    }
}

fn exceeds(limit: usize, current: usize) -> bool {
    limit != 0 && current >= limit
}
