//! Client-side draft state.
//!
//! Push events and polled snapshots both land here. Segments are keyed by id
//! and ring passes by sequence, so anything observed on both channels is
//! applied once, and a stale snapshot never moves the view backwards.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use ringwire::collab::{Draft, DraftId, DraftStatus, Event, EventKind, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentView {
    pub id: Uuid,
    pub order: u64,
    pub author_id: UserId,
    pub content: String,
}

#[derive(Deserialize)]
struct SegmentAdded {
    segment_id: Uuid,
    order: u64,
    author_id: UserId,
    content: String,
}

#[derive(Deserialize)]
struct RingPassed {
    to_user_id: UserId,
    sequence: u64,
}

#[derive(Deserialize)]
struct CollaboratorAdded {
    collaborator_id: UserId,
}

#[derive(Deserialize)]
struct DraftUpdated {
    #[serde(default)]
    status: Option<DraftStatus>,
    #[serde(default)]
    invited_user_id: Option<UserId>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DraftView {
    draft_id: Option<DraftId>,
    segments: BTreeMap<u64, SegmentView>,
    seen: HashSet<Uuid>,
    holder: Option<UserId>,
    ring_sequence: Option<u64>,
    status: Option<DraftStatus>,
    collaborators: BTreeSet<UserId>,
    invitations: BTreeSet<UserId>,
}

impl DraftView {
    pub fn new(draft_id: DraftId) -> Self {
        Self {
            draft_id: Some(draft_id),
            ..Self::default()
        }
    }

    pub fn draft_id(&self) -> Option<&DraftId> {
        self.draft_id.as_ref()
    }

    /// Segments in append order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentView> {
        self.segments.values()
    }

    pub fn contents(&self) -> Vec<&str> {
        self.segments.values().map(|s| s.content.as_str()).collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn holder(&self) -> Option<&UserId> {
        self.holder.as_ref()
    }

    pub fn ring_sequence(&self) -> Option<u64> {
        self.ring_sequence
    }

    pub fn status(&self) -> Option<DraftStatus> {
        self.status
    }

    pub fn collaborators(&self) -> &BTreeSet<UserId> {
        &self.collaborators
    }

    pub fn invitations(&self) -> &BTreeSet<UserId> {
        &self.invitations
    }

    /// Fold one push event in. Returns whether anything changed.
    pub fn apply_event(&mut self, event: &Event) -> bool {
        if self.draft_id.as_ref().is_some_and(|id| id != &event.draft_id) {
            return false;
        }
        let data = event.data.clone();
        let applied = match event.kind {
            EventKind::SegmentAdded => serde_json::from_value::<SegmentAdded>(data).map(|s| {
                self.insert_segment(SegmentView {
                    id: s.segment_id,
                    order: s.order,
                    author_id: s.author_id,
                    content: s.content,
                })
            }),
            EventKind::RingPassed => serde_json::from_value::<RingPassed>(data)
                .map(|p| self.advance_ring(p.to_user_id, p.sequence)),
            EventKind::CollaboratorAdded => serde_json::from_value::<CollaboratorAdded>(data)
                .map(|c| self.add_collaborator(c.collaborator_id)),
            EventKind::DraftUpdated => serde_json::from_value::<DraftUpdated>(data).map(|u| {
                let mut changed = false;
                if let Some(user) = u.invited_user_id {
                    changed |= !self.collaborators.contains(&user) && self.invitations.insert(user);
                }
                if let Some(status) = u.status {
                    changed |= self.set_status(status);
                }
                changed
            }),
        };
        match applied {
            Ok(changed) => changed,
            Err(e) => {
                debug!(kind = ?event.kind, error = %e, "dropping malformed event");
                false
            }
        }
    }

    /// Merge a full snapshot. Returns whether anything changed.
    pub fn apply_snapshot(&mut self, draft: &Draft) -> bool {
        if self.draft_id.as_ref().is_some_and(|id| id != &draft.id) {
            return false;
        }
        let before = self.clone();
        self.draft_id = Some(draft.id.clone());

        for segment in &draft.segments {
            self.insert_segment(SegmentView {
                id: segment.id,
                order: segment.order,
                author_id: segment.author_id.clone(),
                content: segment.content.clone(),
            });
        }
        self.advance_ring(draft.holder().clone(), draft.ring.sequence());
        for user in &draft.collaborators {
            self.add_collaborator(user.clone());
        }
        self.invitations = draft
            .invitations
            .iter()
            .filter(|u| !self.collaborators.contains(*u))
            .cloned()
            .collect();
        self.set_status(draft.status);

        *self != before
    }

    fn insert_segment(&mut self, segment: SegmentView) -> bool {
        if !self.seen.insert(segment.id) {
            return false;
        }
        self.segments.entry(segment.order).or_insert(segment);
        true
    }

    fn advance_ring(&mut self, holder: UserId, sequence: u64) -> bool {
        if self.ring_sequence.is_some_and(|seen| sequence <= seen) {
            return false;
        }
        self.ring_sequence = Some(sequence);
        self.holder = Some(holder);
        true
    }

    fn add_collaborator(&mut self, user: UserId) -> bool {
        self.invitations.remove(&user);
        self.collaborators.insert(user)
    }

    /// Status carries no version; COMPLETED is terminal so it is never left.
    fn set_status(&mut self, status: DraftStatus) -> bool {
        if self.status == Some(DraftStatus::Completed) || self.status == Some(status) {
            return false;
        }
        self.status = Some(status);
        true
    }
}
