use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(DraftId);
string_id!(UserId);

impl DraftId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

// ---------------------------------------------------------------------------
// Draft
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftStatus {
    Active,
    Locked,
    Completed,
}

impl DraftStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Locked => "LOCKED",
            Self::Completed => "COMPLETED",
        }
    }
}

/// One appended piece of a draft. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub draft_id: DraftId,
    pub author_id: UserId,
    pub content: String,
    pub order: u64,
    pub created_at: DateTime<Utc>,
    /// Who held the ring when this segment was written.
    pub ring_holder_id: Option<UserId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RingState {
    pub draft_id: DraftId,
    pub current_holder_id: UserId,
    /// Every holder in order, starting with the creator.
    pub history: Vec<UserId>,
    pub last_passed_at: Option<DateTime<Utc>>,
}

impl RingState {
    fn new(draft_id: DraftId, creator: UserId) -> Self {
        Self {
            draft_id,
            current_holder_id: creator.clone(),
            history: vec![creator],
            last_passed_at: None,
        }
    }

    /// Number of passes so far. The creator's initial hold is sequence 0.
    pub fn sequence(&self) -> u64 {
        self.history.len().saturating_sub(1) as u64
    }
}

/// Full draft state as owned by the mutation service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: DraftId,
    pub creator_id: UserId,
    pub status: DraftStatus,
    pub segments: Vec<Segment>,
    pub ring: RingState,
    pub collaborators: BTreeSet<UserId>,
    pub invitations: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Draft {
    pub fn new(id: DraftId, creator: UserId, now: DateTime<Utc>) -> Self {
        Self {
            ring: RingState::new(id.clone(), creator.clone()),
            id,
            creator_id: creator,
            status: DraftStatus::Active,
            segments: Vec::new(),
            collaborators: BTreeSet::new(),
            invitations: BTreeSet::new(),
            created_at: now,
        }
    }

    pub fn holder(&self) -> &UserId {
        &self.ring.current_holder_id
    }

    pub fn is_creator(&self, user: &UserId) -> bool {
        &self.creator_id == user
    }

    pub fn is_holder(&self, user: &UserId) -> bool {
        self.holder() == user
    }

    /// Creator or accepted collaborator: the set the ring may be passed to.
    pub fn is_member(&self, user: &UserId) -> bool {
        self.is_creator(user) || self.collaborators.contains(user)
    }

    pub fn next_order(&self) -> u64 {
        self.segments.len() as u64
    }

    /// Apply a committed change. Used both by stores and by in-process
    /// views that replay the same change stream.
    pub fn apply(&mut self, change: &Change) {
        match change {
            Change::SegmentAppended(segment) => {
                self.segments.push(segment.clone());
            }
            Change::RingPassed { to, at, .. } => {
                self.ring.history.push(to.clone());
                self.ring.current_holder_id = to.clone();
                self.ring.last_passed_at = Some(*at);
            }
            Change::CollaboratorAdded(user) => {
                self.invitations.remove(user);
                self.collaborators.insert(user.clone());
            }
            Change::Invited(user) => {
                self.invitations.insert(user.clone());
            }
            Change::StatusChanged(status) => {
                self.status = *status;
            }
        }
    }
}

/// A single durable state transition handed to the mutation service.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    SegmentAppended(Segment),
    RingPassed {
        from: UserId,
        to: UserId,
        at: DateTime<Utc>,
    },
    CollaboratorAdded(UserId),
    Invited(UserId),
    StatusChanged(DraftStatus),
}
