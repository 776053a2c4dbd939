//! Ring state machine.
//!
//! Pure transition rules for one draft: given the current [`Draft`], the
//! acting user and the requested [`Operation`], decide whether the operation
//! is allowed and which [`Change`] (if any) it commits. Nothing here touches
//! storage or the network; the coordinator owns sequencing and persistence.
//!
//! Rules:
//!   - COMPLETED is terminal: every operation is rejected with
//!     `DraftCompleted`.
//!   - Only the current holder may append or pass, and only while ACTIVE.
//!   - The ring may only go to the creator or an accepted collaborator.
//!   - Membership and status operations are gated on creator-or-holder.
//!   - Repeating a membership or status operation that is already in effect
//!     succeeds without a change.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::errors::MutationError;
use super::model::{Change, Draft, DraftId, DraftStatus, Segment, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Append { content: String },
    Pass { to: UserId },
    AddCollaborator { user: UserId },
    Invite { user: UserId },
    AcceptInvite,
    Lock,
    Unlock,
    Complete,
}

impl Operation {
    /// Name recorded in the idempotency ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Append { .. } => "append",
            Self::Pass { .. } => "pass",
            Self::AddCollaborator { .. } => "add_collaborator",
            Self::Invite { .. } => "invite",
            Self::AcceptInvite => "accept_invite",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Complete => "complete",
        }
    }
}

/// Result returned to the caller (and replayed verbatim for duplicates).
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Created {
        draft: Draft,
    },
    Appended {
        segment: Segment,
    },
    Passed {
        from_user_id: UserId,
        to_user_id: UserId,
        sequence: u64,
    },
    CollaboratorAdded {
        collaborator_id: UserId,
        added: bool,
    },
    Invited {
        invited_user_id: UserId,
        added: bool,
    },
    StatusChanged {
        status: DraftStatus,
        changed: bool,
    },
}

/// What an allowed operation does: the change to persist (none for a
/// no-op) and the outcome to report once it is durable.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub change: Option<Change>,
    pub outcome: Outcome,
}

impl Transition {
    fn commit(change: Change, outcome: Outcome) -> Self {
        Self {
            change: Some(change),
            outcome,
        }
    }

    fn noop(outcome: Outcome) -> Self {
        Self {
            change: None,
            outcome,
        }
    }
}

pub fn plan(
    draft: &Draft,
    actor: &UserId,
    op: &Operation,
    now: DateTime<Utc>,
) -> Result<Transition, MutationError> {
    if draft.status == DraftStatus::Completed {
        return Err(MutationError::DraftCompleted);
    }
    match op {
        Operation::Append { content } => append(draft, actor, content, now),
        Operation::Pass { to } => pass(draft, actor, to, now),
        Operation::AddCollaborator { user } => add_collaborator(draft, actor, user),
        Operation::Invite { user } => invite(draft, actor, user),
        Operation::AcceptInvite => accept_invite(draft, actor),
        Operation::Lock => set_status(draft, actor, DraftStatus::Locked),
        Operation::Unlock => set_status(draft, actor, DraftStatus::Active),
        Operation::Complete => set_status(draft, actor, DraftStatus::Completed),
    }
}

/// Build a new draft held by `creator`. A non-empty `opening` becomes
/// segment 0, attributed to the creator.
pub fn open(
    id: DraftId,
    creator: &UserId,
    opening: Option<&str>,
    now: DateTime<Utc>,
) -> Draft {
    let mut draft = Draft::new(id, creator.clone(), now);
    if let Some(content) = opening.filter(|c| !c.trim().is_empty()) {
        let segment = new_segment(&draft, creator, content, now);
        draft.apply(&Change::SegmentAppended(segment));
    }
    draft
}

fn new_segment(draft: &Draft, author: &UserId, content: &str, now: DateTime<Utc>) -> Segment {
    Segment {
        id: Uuid::now_v7(),
        draft_id: draft.id.clone(),
        author_id: author.clone(),
        content: content.to_owned(),
        order: draft.next_order(),
        created_at: now,
        ring_holder_id: Some(draft.holder().clone()),
    }
}

fn require_active(draft: &Draft) -> Result<(), MutationError> {
    match draft.status {
        DraftStatus::Active => Ok(()),
        DraftStatus::Locked => Err(MutationError::DraftLocked),
        DraftStatus::Completed => Err(MutationError::DraftCompleted),
    }
}

fn require_holder(draft: &Draft, actor: &UserId) -> Result<(), MutationError> {
    if draft.is_holder(actor) {
        Ok(())
    } else {
        Err(MutationError::RingRequired {
            holder: draft.holder().clone(),
        })
    }
}

fn require_creator_or_holder(draft: &Draft, actor: &UserId) -> Result<(), MutationError> {
    if draft.is_creator(actor) || draft.is_holder(actor) {
        Ok(())
    } else {
        Err(MutationError::Forbidden(
            "only the creator or the ring holder may do this",
        ))
    }
}

fn append(
    draft: &Draft,
    actor: &UserId,
    content: &str,
    now: DateTime<Utc>,
) -> Result<Transition, MutationError> {
    require_active(draft)?;
    require_holder(draft, actor)?;
    let segment = new_segment(draft, actor, content, now);
    Ok(Transition::commit(
        Change::SegmentAppended(segment.clone()),
        Outcome::Appended { segment },
    ))
}

fn pass(
    draft: &Draft,
    actor: &UserId,
    to: &UserId,
    now: DateTime<Utc>,
) -> Result<Transition, MutationError> {
    require_active(draft)?;
    require_holder(draft, actor)?;
    if !draft.is_member(to) {
        return Err(MutationError::InvalidTarget { user: to.clone() });
    }
    Ok(Transition::commit(
        Change::RingPassed {
            from: actor.clone(),
            to: to.clone(),
            at: now,
        },
        Outcome::Passed {
            from_user_id: actor.clone(),
            to_user_id: to.clone(),
            sequence: draft.ring.sequence() + 1,
        },
    ))
}

fn add_collaborator(
    draft: &Draft,
    actor: &UserId,
    user: &UserId,
) -> Result<Transition, MutationError> {
    require_creator_or_holder(draft, actor)?;
    if draft.is_member(user) {
        return Ok(Transition::noop(Outcome::CollaboratorAdded {
            collaborator_id: user.clone(),
            added: false,
        }));
    }
    Ok(Transition::commit(
        Change::CollaboratorAdded(user.clone()),
        Outcome::CollaboratorAdded {
            collaborator_id: user.clone(),
            added: true,
        },
    ))
}

fn invite(draft: &Draft, actor: &UserId, user: &UserId) -> Result<Transition, MutationError> {
    require_creator_or_holder(draft, actor)?;
    if draft.is_member(user) || draft.invitations.contains(user) {
        return Ok(Transition::noop(Outcome::Invited {
            invited_user_id: user.clone(),
            added: false,
        }));
    }
    Ok(Transition::commit(
        Change::Invited(user.clone()),
        Outcome::Invited {
            invited_user_id: user.clone(),
            added: true,
        },
    ))
}

fn accept_invite(draft: &Draft, actor: &UserId) -> Result<Transition, MutationError> {
    if draft.is_member(actor) {
        return Ok(Transition::noop(Outcome::CollaboratorAdded {
            collaborator_id: actor.clone(),
            added: false,
        }));
    }
    if !draft.invitations.contains(actor) {
        return Err(MutationError::Forbidden("no pending invitation"));
    }
    Ok(Transition::commit(
        Change::CollaboratorAdded(actor.clone()),
        Outcome::CollaboratorAdded {
            collaborator_id: actor.clone(),
            added: true,
        },
    ))
}

fn set_status(
    draft: &Draft,
    actor: &UserId,
    target: DraftStatus,
) -> Result<Transition, MutationError> {
    require_creator_or_holder(draft, actor)?;
    if draft.status == target {
        return Ok(Transition::noop(Outcome::StatusChanged {
            status: target,
            changed: false,
        }));
    }
    Ok(Transition::commit(
        Change::StatusChanged(target),
        Outcome::StatusChanged {
            status: target,
            changed: true,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::model::DraftId;

    fn alice() -> UserId {
        UserId::new("alice")
    }
    fn bob() -> UserId {
        UserId::new("bob")
    }
    fn carol() -> UserId {
        UserId::new("carol")
    }

    fn draft_with_bob() -> Draft {
        let mut d = Draft::new(DraftId::new("d1"), alice(), Utc::now());
        d.apply(&Change::CollaboratorAdded(bob()));
        d
    }

    fn run(d: &mut Draft, actor: &UserId, op: Operation) -> Result<Outcome, MutationError> {
        let t = plan(d, actor, &op, Utc::now())?;
        if let Some(change) = &t.change {
            d.apply(change);
        }
        Ok(t.outcome)
    }

    #[test]
    fn non_holder_cannot_append() {
        let mut d = draft_with_bob();
        let err = run(&mut d, &bob(), Operation::Append { content: "x".into() }).unwrap_err();
        assert!(matches!(err, MutationError::RingRequired { ref holder } if *holder == alice()));
        assert!(d.segments.is_empty());
    }

    #[test]
    fn pass_then_append_flips_turn() {
        let mut d = draft_with_bob();
        run(&mut d, &alice(), Operation::Append { content: "opening".into() }).unwrap();
        let out = run(&mut d, &alice(), Operation::Pass { to: bob() }).unwrap();
        assert_eq!(
            out,
            Outcome::Passed {
                from_user_id: alice(),
                to_user_id: bob(),
                sequence: 1
            }
        );

        let err = run(&mut d, &alice(), Operation::Append { content: "late".into() }).unwrap_err();
        assert_eq!(err.code(), "ring_required");

        match run(&mut d, &bob(), Operation::Append { content: "reply".into() }).unwrap() {
            Outcome::Appended { segment } => {
                assert_eq!(segment.order, 1);
                assert_eq!(segment.author_id, bob());
                assert_eq!(segment.ring_holder_id, Some(bob()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn pass_to_outsider_is_invalid_target() {
        let mut d = draft_with_bob();
        let before = d.ring.clone();
        let err = run(&mut d, &alice(), Operation::Pass { to: carol() }).unwrap_err();
        assert!(matches!(err, MutationError::InvalidTarget { ref user } if *user == carol()));
        assert_eq!(d.ring, before);
    }

    #[test]
    fn invited_but_not_accepted_is_not_a_target() {
        let mut d = draft_with_bob();
        run(&mut d, &alice(), Operation::Invite { user: carol() }).unwrap();
        let err = run(&mut d, &alice(), Operation::Pass { to: carol() }).unwrap_err();
        assert_eq!(err.code(), "invalid_target");

        run(&mut d, &carol(), Operation::AcceptInvite).unwrap();
        run(&mut d, &alice(), Operation::Pass { to: carol() }).unwrap();
        assert_eq!(d.holder(), &carol());
    }

    #[test]
    fn accept_without_invitation_is_forbidden() {
        let mut d = draft_with_bob();
        let err = run(&mut d, &carol(), Operation::AcceptInvite).unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn re_adding_collaborator_is_noop() {
        let mut d = draft_with_bob();
        let t = plan(&d, &alice(), &Operation::AddCollaborator { user: bob() }, Utc::now())
            .unwrap();
        assert!(t.change.is_none());
        assert_eq!(
            t.outcome,
            Outcome::CollaboratorAdded {
                collaborator_id: bob(),
                added: false
            }
        );
        let out = run(&mut d, &alice(), Operation::AddCollaborator { user: carol() }).unwrap();
        assert_eq!(
            out,
            Outcome::CollaboratorAdded {
                collaborator_id: carol(),
                added: true
            }
        );
    }

    #[test]
    fn add_collaborator_gated_on_creator_or_holder() {
        let mut d = draft_with_bob();
        let err = run(&mut d, &bob(), Operation::AddCollaborator { user: carol() }).unwrap_err();
        assert_eq!(err.code(), "forbidden");

        run(&mut d, &alice(), Operation::Pass { to: bob() }).unwrap();
        run(&mut d, &bob(), Operation::AddCollaborator { user: carol() }).unwrap();
        assert!(d.collaborators.contains(&carol()));
    }

    #[test]
    fn locked_draft_rejects_append_and_pass() {
        let mut d = draft_with_bob();
        run(&mut d, &alice(), Operation::Lock).unwrap();
        let err = run(&mut d, &alice(), Operation::Append { content: "x".into() }).unwrap_err();
        assert_eq!(err.code(), "draft_locked");
        let err = run(&mut d, &alice(), Operation::Pass { to: bob() }).unwrap_err();
        assert_eq!(err.code(), "draft_locked");

        run(&mut d, &alice(), Operation::Unlock).unwrap();
        run(&mut d, &alice(), Operation::Append { content: "x".into() }).unwrap();
    }

    #[test]
    fn lock_twice_is_noop() {
        let mut d = draft_with_bob();
        run(&mut d, &alice(), Operation::Lock).unwrap();
        let t = plan(&d, &alice(), &Operation::Lock, Utc::now()).unwrap();
        assert!(t.change.is_none());
    }

    #[test]
    fn completed_is_terminal() {
        let mut d = draft_with_bob();
        run(&mut d, &alice(), Operation::Complete).unwrap();
        for op in [
            Operation::Append { content: "x".into() },
            Operation::Pass { to: bob() },
            Operation::AddCollaborator { user: carol() },
            Operation::Unlock,
            Operation::Complete,
        ] {
            let err = run(&mut d, &alice(), op).unwrap_err();
            assert_eq!(err.code(), "draft_completed");
        }
    }

    #[test]
    fn status_change_gated() {
        let mut d = draft_with_bob();
        let err = run(&mut d, &bob(), Operation::Complete).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        run(&mut d, &alice(), Operation::Pass { to: bob() }).unwrap();
        run(&mut d, &bob(), Operation::Lock).unwrap();
        assert_eq!(d.status, DraftStatus::Locked);
    }

    #[test]
    fn holder_stays_a_member_across_passes() {
        let mut d = draft_with_bob();
        run(&mut d, &alice(), Operation::AddCollaborator { user: carol() }).unwrap();
        let chain = [bob(), carol(), alice(), carol(), bob()];
        let mut actor = alice();
        for next in chain {
            run(&mut d, &actor, Operation::Pass { to: next.clone() }).unwrap();
            assert!(d.is_member(d.holder()));
            actor = next;
        }
        assert_eq!(d.ring.sequence(), 5);
        assert_eq!(d.ring.history.len(), 6);
    }

    #[test]
    fn open_with_opening_text_writes_segment_zero() {
        let d = open(DraftId::new("d2"), &alice(), Some("Once upon a time"), Utc::now());
        assert_eq!(d.segments.len(), 1);
        assert_eq!(d.segments[0].order, 0);
        assert_eq!(d.segments[0].author_id, alice());
        assert_eq!(d.holder(), &alice());

        let blank = open(DraftId::new("d3"), &alice(), Some("   "), Utc::now());
        assert!(blank.segments.is_empty());
    }
}
