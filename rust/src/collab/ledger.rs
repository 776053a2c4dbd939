//! Idempotency ledger.
//!
//! Maps (actor, draft, client key) to the result of the first request that
//! used it. `check_or_reserve` is atomic under one mutex: the first caller
//! gets a [`Reservation`] and executes the mutation; every later caller with
//! the same key gets a [`Replay`] that resolves to the winner's result,
//! waiting for it if the winner is still in flight.
//!
//! Successful results are retained until evicted (FIFO window plus TTL).
//! Failed results are handed to the callers that raced the winner and then
//! forgotten, so a later retry with the same key runs again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tokio::sync::watch;

use super::errors::MutationError;
use super::model::{DraftId, UserId};
use super::ring::Outcome;

pub const DEFAULT_MAX_ENTRIES: usize = 50_000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

type LedgerResult = Result<Outcome, MutationError>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub actor: UserId,
    pub draft: DraftId,
    pub key: String,
}

impl LedgerKey {
    pub fn new(actor: &UserId, draft: &DraftId, key: impl Into<String>) -> Self {
        Self {
            actor: actor.clone(),
            draft: draft.clone(),
            key: key.into(),
        }
    }
}

enum Slot {
    InFlight {
        kind: &'static str,
        rx: watch::Receiver<Option<LedgerResult>>,
    },
    Done {
        kind: &'static str,
        outcome: Outcome,
        at: Instant,
    },
}

impl Slot {
    fn kind(&self) -> &'static str {
        match self {
            Slot::InFlight { kind, .. } | Slot::Done { kind, .. } => kind,
        }
    }
}

#[derive(Default)]
struct LedgerState {
    entries: AHashMap<LedgerKey, Slot>,
    /// Completed keys in insertion order, for eviction.
    order: VecDeque<(LedgerKey, Instant)>,
}

impl LedgerState {
    fn evict(&mut self, max_entries: usize, ttl: Duration, now: Instant) {
        while let Some(oldest) = self.order.front().map(|(_, at)| *at) {
            let expired = now.duration_since(oldest) > ttl;
            if !expired && self.order.len() <= max_entries {
                break;
            }
            let Some((key, at)) = self.order.pop_front() else {
                break;
            };
            // Only drop the slot if it is the completion this order entry
            // refers to; a key may have been forgotten and reserved again.
            if matches!(self.entries.get(&key), Some(Slot::Done { at: done_at, .. }) if *done_at == at)
            {
                self.entries.remove(&key);
            }
        }
    }
}

pub enum Reserve {
    Fresh(Reservation),
    Duplicate(Replay),
}

/// Handle to the winner's result.
pub enum Replay {
    Ready(Outcome),
    Pending(watch::Receiver<Option<LedgerResult>>),
}

impl Replay {
    pub async fn wait(self) -> Result<Outcome, MutationError> {
        match self {
            Replay::Ready(outcome) => Ok(outcome),
            Replay::Pending(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(result) => result
                    .clone()
                    .unwrap_or_else(|| Err(MutationError::Storage("request abandoned".into()))),
                Err(_) => Err(MutationError::Storage("request abandoned".into())),
            },
        }
    }
}

/// Exclusive right to execute the mutation for one key. Must be finished
/// with [`Reservation::complete`]; dropping it releases the key and fails
/// any waiters.
pub struct Reservation {
    state: Arc<Mutex<LedgerState>>,
    key: LedgerKey,
    kind: &'static str,
    tx: watch::Sender<Option<LedgerResult>>,
    max_entries: usize,
    ttl: Duration,
    finished: bool,
}

impl Reservation {
    pub fn complete(mut self, result: &LedgerResult) {
        self.finished = true;
        let mut state = lock(&self.state);
        match result {
            Ok(outcome) => {
                let now = Instant::now();
                state.entries.insert(
                    self.key.clone(),
                    Slot::Done {
                        kind: self.kind,
                        outcome: outcome.clone(),
                        at: now,
                    },
                );
                state.order.push_back((self.key.clone(), now));
                state.evict(self.max_entries, self.ttl, now);
            }
            Err(_) => {
                state.entries.remove(&self.key);
            }
        }
        drop(state);
        self.tx.send_replace(Some(result.clone()));
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        lock(&self.state).entries.remove(&self.key);
        self.tx.send_replace(Some(Err(MutationError::Storage(
            "request abandoned".into(),
        ))));
    }
}

fn lock(state: &Mutex<LedgerState>) -> MutexGuard<'_, LedgerState> {
    // Critical sections never panic midway; recover the guard if a
    // caller's thread did.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct IdempotencyLedger {
    state: Arc<Mutex<LedgerState>>,
    max_entries: usize,
    ttl: Duration,
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TTL)
    }
}

impl IdempotencyLedger {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Atomically look up `key` and reserve it if unseen.
    ///
    /// Returns `KeyReused` when the key was recorded for a different
    /// operation kind.
    pub fn check_or_reserve(
        &self,
        key: LedgerKey,
        kind: &'static str,
    ) -> Result<Reserve, MutationError> {
        let mut state = lock(&self.state);
        let now = Instant::now();

        if let Some(slot) = state.entries.get(&key) {
            if slot.kind() != kind {
                return Err(MutationError::KeyReused {
                    previous: slot.kind(),
                });
            }
            match slot {
                Slot::InFlight { rx, .. } => {
                    return Ok(Reserve::Duplicate(Replay::Pending(rx.clone())));
                }
                Slot::Done { outcome, at, .. } if now.duration_since(*at) <= self.ttl => {
                    return Ok(Reserve::Duplicate(Replay::Ready(outcome.clone())));
                }
                Slot::Done { .. } => {
                    state.entries.remove(&key);
                }
            }
        }

        let (tx, rx) = watch::channel(None);
        state
            .entries
            .insert(key.clone(), Slot::InFlight { kind, rx });
        Ok(Reserve::Fresh(Reservation {
            state: Arc::clone(&self.state),
            key,
            kind,
            tx,
            max_entries: self.max_entries,
            ttl: self.ttl,
            finished: false,
        }))
    }

    /// Drop completed entries older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let mut state = lock(&self.state);
        let before = state.entries.len();
        state.evict(self.max_entries, self.ttl, Instant::now());
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
