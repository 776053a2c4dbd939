//! Mutation request path.
//!
//! rate limiter -> idempotency ledger -> per-draft lock -> ring planning ->
//! mutation service commit -> ledger completion -> event enqueue.
//!
//! Different drafts proceed in parallel. Within one draft, the per-draft
//! lock serializes load/plan/commit so two requests never plan against the
//! same stale state.
//!
//! Everything from the lock to the ledger completion runs in its own task.
//! A caller that goes away (a dropped HTTP handler future) cannot leave a
//! committed change without its ledger entry or event.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::errors::MutationError;
use super::events::{Event, EventQueue};
use super::ledger::{IdempotencyLedger, LedgerKey, Reservation, Reserve};
use super::model::{Draft, DraftId, UserId};
use super::rate_limiter::{RateKey, RateLimiter, Route};
use super::ring::{self, Operation, Outcome};
use super::store::MutationService;

/// Ledger scope for draft creation, where no draft id exists yet.
const CREATION_SCOPE: &str = "";

/// One mutating request against an existing draft.
#[derive(Clone, Debug)]
pub struct Command {
    pub draft_id: DraftId,
    pub actor: UserId,
    pub op: Operation,
    pub idempotency_key: Option<String>,
}

impl Command {
    pub fn new(draft_id: DraftId, actor: UserId, op: Operation) -> Self {
        Self {
            draft_id,
            actor,
            op,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A successful result, and whether it was replayed from the ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    pub outcome: Outcome,
    pub replayed: bool,
}

pub struct Coordinator {
    pipeline: Pipeline,
    ledger: IdempotencyLedger,
    limiter: RateLimiter,
}

/// The part of the request path that outlives its caller.
#[derive(Clone)]
struct Pipeline {
    store: Arc<dyn MutationService>,
    events: EventQueue,
    locks: Arc<DashMap<DraftId, Arc<Mutex<()>>>>,
}

pub(crate) fn route_for(op: &Operation) -> Route {
    match op {
        Operation::Append { .. } => Route::Append,
        Operation::Pass { .. } => Route::Pass,
        Operation::AddCollaborator { .. } => Route::AddCollaborator,
        Operation::Invite { .. } => Route::Invite,
        Operation::AcceptInvite => Route::AcceptInvite,
        Operation::Lock | Operation::Unlock | Operation::Complete => Route::SetStatus,
    }
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn MutationService>,
        ledger: IdempotencyLedger,
        limiter: RateLimiter,
        events: EventQueue,
    ) -> Self {
        Self {
            pipeline: Pipeline {
                store,
                events,
                locks: Arc::new(DashMap::new()),
            },
            ledger,
            limiter,
        }
    }

    /// Create a draft held by `actor`, optionally seeded with segment 0.
    pub async fn create(
        &self,
        actor: &UserId,
        opening: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<Applied, MutationError> {
        self.limiter
            .check(&RateKey::Actor(actor.clone()), Route::CreateDraft)?;

        let reservation = match idempotency_key {
            Some(key) => {
                let ledger_key = LedgerKey::new(actor, &DraftId::new(CREATION_SCOPE), key);
                match self.ledger.check_or_reserve(ledger_key, "create")? {
                    Reserve::Duplicate(replay) => return replayed(replay.wait().await),
                    Reserve::Fresh(reservation) => Some(reservation),
                }
            }
            None => None,
        };

        let draft = ring::open(DraftId::generate(), actor, opening, Utc::now());
        let store = self.pipeline.store.clone();
        let result = detached(reservation, async move {
            store
                .create(draft.clone())
                .await
                .map(|()| Outcome::Created { draft })
                .map_err(MutationError::from)
        })
        .await;

        if let Ok(Outcome::Created { draft }) = &result {
            info!(draft_id = %draft.id, user_id = %actor, "draft created");
        }
        result.map(|outcome| Applied {
            outcome,
            replayed: false,
        })
    }

    /// Charge a request that carries no identity to its fallback key. The
    /// caller is rejected afterwards either way.
    pub fn throttle_anonymous(&self, caller: &RateKey, route: Route) -> Result<(), MutationError> {
        self.limiter.check(caller, route)?;
        Ok(())
    }

    /// Full current state, for the initial fetch on connect and for polling.
    pub async fn snapshot(&self, draft_id: &DraftId, caller: &RateKey) -> Result<Draft, MutationError> {
        self.limiter.check(caller, Route::ReadDraft)?;
        self.pipeline
            .store
            .load(draft_id)
            .await?
            .ok_or(MutationError::NotFound)
    }

    /// Run one mutating command. Duplicate keys return the first result
    /// without touching the draft again.
    pub async fn execute(&self, cmd: Command) -> Result<Applied, MutationError> {
        self.limiter
            .check(&RateKey::Actor(cmd.actor.clone()), route_for(&cmd.op))?;

        let reservation = match &cmd.idempotency_key {
            Some(key) => {
                let ledger_key = LedgerKey::new(&cmd.actor, &cmd.draft_id, key.as_str());
                match self.ledger.check_or_reserve(ledger_key, cmd.op.kind())? {
                    Reserve::Duplicate(replay) => {
                        debug!(
                            draft_id = %cmd.draft_id,
                            user_id = %cmd.actor,
                            op = cmd.op.kind(),
                            "idempotent replay"
                        );
                        return replayed(replay.wait().await);
                    }
                    Reserve::Fresh(reservation) => Some(reservation),
                }
            }
            None => None,
        };

        let pipeline = self.pipeline.clone();
        let task_cmd = cmd.clone();
        let result = detached(reservation, async move { pipeline.apply(&task_cmd).await }).await;

        match &result {
            Ok(_) => debug!(
                draft_id = %cmd.draft_id,
                user_id = %cmd.actor,
                op = cmd.op.kind(),
                "mutation applied"
            ),
            Err(e) => debug!(
                draft_id = %cmd.draft_id,
                user_id = %cmd.actor,
                op = cmd.op.kind(),
                code = e.code(),
                "mutation rejected"
            ),
        }
        result.map(|outcome| Applied {
            outcome,
            replayed: false,
        })
    }

    /// Periodic housekeeping: expired ledger entries and idle rate buckets.
    pub fn maintain(&self) {
        let purged = self.ledger.purge_expired();
        let swept = self.limiter.sweep_idle();
        if purged > 0 || swept > 0 {
            debug!(purged, swept, "coordinator maintenance");
        }
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }
}

impl Pipeline {
    async fn apply(&self, cmd: &Command) -> Result<Outcome, MutationError> {
        let lock = self.draft_lock(&cmd.draft_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(cmd).await
        };
        drop(lock);
        self.locks
            .remove_if(&cmd.draft_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn apply_locked(&self, cmd: &Command) -> Result<Outcome, MutationError> {
        let mut draft = self
            .store
            .load(&cmd.draft_id)
            .await?
            .ok_or(MutationError::NotFound)?;
        let now = Utc::now();
        let transition = ring::plan(&draft, &cmd.actor, &cmd.op, now)?;

        if let Some(change) = &transition.change {
            self.store.commit(&cmd.draft_id, change).await?;
            draft.apply(change);
            self.events
                .enqueue(Event::from_change(&draft, &cmd.actor, change, now));
        }
        Ok(transition.outcome)
    }

    fn draft_lock(&self, id: &DraftId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }
}

/// Run `work` to completion on its own task and record its result under
/// `reservation`, whether or not the awaiting caller is still there.
async fn detached<F>(reservation: Option<Reservation>, work: F) -> Result<Outcome, MutationError>
where
    F: Future<Output = Result<Outcome, MutationError>> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let result = work.await;
        if let Some(reservation) = reservation {
            reservation.complete(&result);
        }
        result
    });
    task.await.unwrap_or_else(|e| {
        warn!(error = %e, "mutation task failed");
        Err(MutationError::Storage("mutation task failed".into()))
    })
}

fn replayed(result: Result<Outcome, MutationError>) -> Result<Applied, MutationError> {
    result.map(|outcome| Applied {
        outcome,
        replayed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::events::EventKind;
    use crate::collab::model::DraftStatus;
    use crate::collab::rate_limiter::RateLimitSettings;
    use crate::collab::errors::StoreError;
    use crate::collab::model::Change;
    use crate::collab::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Commits immediately, acknowledges late.
    struct SlowAck {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl MutationService for SlowAck {
        async fn create(&self, draft: Draft) -> Result<(), StoreError> {
            self.inner.create(draft).await
        }

        async fn load(&self, id: &DraftId) -> Result<Option<Draft>, StoreError> {
            self.inner.load(id).await
        }

        async fn commit(&self, id: &DraftId, change: &Change) -> Result<(), StoreError> {
            self.inner.commit(id, change).await?;
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    struct Fixture {
        coordinator: Arc<Coordinator>,
        store: Arc<MemoryStore>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    fn fixture_with(limiter: RateLimiter) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let (queue, events) = EventQueue::channel();
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            IdempotencyLedger::default(),
            limiter,
            queue,
        ));
        Fixture {
            coordinator,
            store,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RateLimiter::disabled())
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }
    fn bob() -> UserId {
        UserId::new("bob")
    }

    async fn create(f: &Fixture, opening: Option<&str>) -> DraftId {
        match f.coordinator.create(&alice(), opening, None).await.unwrap().outcome {
            Outcome::Created { draft } => draft.id,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn append(id: &DraftId, actor: UserId, content: &str) -> Command {
        Command::new(
            id.clone(),
            actor,
            Operation::Append {
                content: content.into(),
            },
        )
    }

    #[tokio::test]
    async fn turn_taking_scenario() {
        let f = fixture();
        let id = create(&f, Some("It was a dark night.")).await;
        f.coordinator
            .execute(Command::new(
                id.clone(),
                alice(),
                Operation::AddCollaborator { user: bob() },
            ))
            .await
            .unwrap();

        let err = f
            .coordinator
            .execute(append(&id, bob(), "too early"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ring_required");

        f.coordinator
            .execute(Command::new(id.clone(), alice(), Operation::Pass { to: bob() }))
            .await
            .unwrap();
        let err = f
            .coordinator
            .execute(append(&id, alice(), "mine"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ring_required");

        let applied = f.coordinator.execute(append(&id, bob(), "The wind")).await.unwrap();
        match applied.outcome {
            Outcome::Appended { segment } => assert_eq!(segment.order, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_passes_and_appends_keep_one_holder() {
        let mut f = fixture();
        let id = create(&f, None).await;
        let carol = UserId::new("carol");
        for user in [bob(), carol.clone()] {
            f.coordinator
                .execute(Command::new(
                    id.clone(),
                    alice(),
                    Operation::AddCollaborator { user },
                ))
                .await
                .unwrap();
        }
        let users = [alice(), bob(), carol];

        let mut handles = Vec::new();
        for (i, actor) in users.iter().enumerate() {
            let next = users[(i + 1) % users.len()].clone();
            for round in 0..20 {
                let c = f.coordinator.clone();
                let op = if round % 2 == 0 {
                    Operation::Append {
                        content: format!("{actor} {round}"),
                    }
                } else {
                    Operation::Pass { to: next.clone() }
                };
                let cmd = Command::new(id.clone(), actor.clone(), op);
                handles.push(tokio::spawn(async move { c.execute(cmd).await }));
            }
        }
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => {}
                Err(e) => assert_eq!(e.code(), "ring_required"),
            }
        }

        // replay the committed events: every append came from the holder
        // of its epoch
        let mut holder = alice();
        let mut passes = 0;
        let mut appends = 0;
        while let Ok(event) = f.events.try_recv() {
            match event.kind {
                EventKind::RingPassed => {
                    assert_eq!(event.user_id, holder);
                    holder = UserId::from(event.data["to_user_id"].as_str().unwrap());
                    passes += 1;
                }
                EventKind::SegmentAdded => {
                    assert_eq!(event.user_id, holder);
                    appends += 1;
                }
                _ => {}
            }
        }

        let draft = f.store.load(&id).await.unwrap().unwrap();
        assert_eq!(draft.ring.current_holder_id, holder);
        assert_eq!(draft.ring.sequence(), passes);
        assert_eq!(draft.segments.len(), appends);
        assert!(draft.is_member(&draft.ring.current_holder_id));
        for segment in &draft.segments {
            assert_eq!(segment.ring_holder_id.as_ref(), Some(&segment.author_id));
        }
    }

    #[tokio::test]
    async fn abandoned_caller_still_records_its_key() {
        let store = Arc::new(MemoryStore::new());
        let (queue, mut events) = EventQueue::channel();
        let coordinator = Coordinator::new(
            Arc::new(SlowAck {
                inner: store.clone(),
                delay: Duration::from_millis(50),
            }),
            IdempotencyLedger::default(),
            RateLimiter::disabled(),
            queue,
        );
        let id = match coordinator.create(&alice(), None, None).await.unwrap().outcome {
            Outcome::Created { draft } => draft.id,
            other => panic!("unexpected {other:?}"),
        };
        let cmd = append(&id, alice(), "hello").with_key("k1");

        // caller gives up after the commit but before the acknowledgement
        let gave_up = tokio::time::timeout(Duration::from_millis(10), coordinator.execute(cmd.clone())).await;
        assert!(gave_up.is_err());

        let retry = coordinator.execute(cmd).await.unwrap();
        assert!(retry.replayed);
        let draft = store.load(&id).await.unwrap().unwrap();
        assert_eq!(draft.segments.len(), 1);
        match retry.outcome {
            Outcome::Appended { segment } => assert_eq!(segment.id, draft.segments[0].id),
            other => panic!("unexpected {other:?}"),
        }

        // the event still went out, exactly once
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::SegmentAdded);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_duplicates_append_once() {
        let f = fixture();
        let id = create(&f, None).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = f.coordinator.clone();
            let cmd = append(&id, alice(), "hello").with_key("k1");
            handles.push(tokio::spawn(async move { c.execute(cmd).await }));
        }

        let mut segment_ids = Vec::new();
        let mut fresh = 0;
        for h in handles {
            let applied = h.await.unwrap().unwrap();
            if !applied.replayed {
                fresh += 1;
            }
            match applied.outcome {
                Outcome::Appended { segment } => segment_ids.push(segment.id),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(fresh, 1);
        segment_ids.dedup();
        assert_eq!(segment_ids.len(), 1);

        let draft = f.store.load(&id).await.unwrap().unwrap();
        assert_eq!(draft.segments.len(), 1);
        assert_eq!(draft.segments[0].content, "hello");
    }

    #[tokio::test]
    async fn replayed_pass_does_not_extend_history() {
        let f = fixture();
        let id = create(&f, None).await;
        f.coordinator
            .execute(Command::new(
                id.clone(),
                alice(),
                Operation::AddCollaborator { user: bob() },
            ))
            .await
            .unwrap();

        let pass = Command::new(id.clone(), alice(), Operation::Pass { to: bob() }).with_key("p1");
        let first = f.coordinator.execute(pass.clone()).await.unwrap();
        let second = f.coordinator.execute(pass).await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.outcome, second.outcome);

        let draft = f.store.load(&id).await.unwrap().unwrap();
        assert_eq!(draft.ring.history, vec![alice(), bob()]);
    }

    #[tokio::test]
    async fn invalid_target_leaves_ring_unchanged() {
        let f = fixture();
        let id = create(&f, None).await;
        let before = f.store.load(&id).await.unwrap().unwrap().ring;
        let err = f
            .coordinator
            .execute(Command::new(
                id.clone(),
                alice(),
                Operation::Pass {
                    to: UserId::new("carol"),
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_target");
        assert_eq!(f.store.load(&id).await.unwrap().unwrap().ring, before);
    }

    #[tokio::test]
    async fn events_follow_commit_order() {
        let mut f = fixture();
        let id = create(&f, None).await;
        f.coordinator
            .execute(Command::new(
                id.clone(),
                alice(),
                Operation::AddCollaborator { user: bob() },
            ))
            .await
            .unwrap();
        f.coordinator.execute(append(&id, alice(), "one")).await.unwrap();
        f.coordinator
            .execute(Command::new(id.clone(), alice(), Operation::Pass { to: bob() }))
            .await
            .unwrap();
        // Rejected and no-op requests emit nothing.
        let _ = f.coordinator.execute(append(&id, alice(), "nope")).await;
        f.coordinator
            .execute(Command::new(id.clone(), bob(), Operation::Unlock))
            .await
            .unwrap();

        let kinds: Vec<EventKind> = std::iter::from_fn(|| f.events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::CollaboratorAdded,
                EventKind::SegmentAdded,
                EventKind::RingPassed
            ]
        );
    }

    #[tokio::test]
    async fn key_reuse_across_operations_conflicts() {
        let f = fixture();
        let id = create(&f, None).await;
        f.coordinator
            .execute(append(&id, alice(), "x").with_key("k"))
            .await
            .unwrap();
        let err = f
            .coordinator
            .execute(Command::new(id.clone(), alice(), Operation::Lock).with_key("k"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "idempotency_conflict");
        let draft = f.store.load(&id).await.unwrap().unwrap();
        assert_eq!(draft.status, DraftStatus::Active);
    }

    #[tokio::test]
    async fn create_is_idempotent_by_key() {
        let f = fixture();
        let first = f.coordinator.create(&alice(), Some("hi"), Some("c1")).await.unwrap();
        let second = f.coordinator.create(&alice(), Some("hi"), Some("c1")).await.unwrap();
        assert!(second.replayed);
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(f.store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_draft_is_not_found() {
        let f = fixture();
        let err = f
            .coordinator
            .execute(append(&DraftId::new("missing"), alice(), "x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
        let err = f
            .coordinator
            .snapshot(&DraftId::new("missing"), &RateKey::Anonymous)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn rate_limited_when_enabled() {
        let f = fixture_with(RateLimiter::new(RateLimitSettings {
            enabled: true,
            mutating_per_minute: 60,
            mutating_burst: 2,
            ..RateLimitSettings::default()
        }));
        let id = create(&f, None).await;
        f.coordinator.execute(append(&id, alice(), "a")).await.unwrap();
        f.coordinator.execute(append(&id, alice(), "b")).await.unwrap();
        let err = f
            .coordinator
            .execute(append(&id, alice(), "c"))
            .await
            .unwrap_err();
        match err {
            MutationError::RateLimited(limited) => {
                assert_eq!(limited.limit, 60);
                assert!(limited.retry_after.as_millis() > 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        let draft = f.store.load(&id).await.unwrap().unwrap();
        assert_eq!(draft.segments.len(), 2);
    }

    #[tokio::test]
    async fn draft_locks_are_released() {
        let f = fixture();
        let id = create(&f, None).await;
        f.coordinator.execute(append(&id, alice(), "x")).await.unwrap();
        assert!(f.coordinator.pipeline.locks.is_empty());
    }
}
