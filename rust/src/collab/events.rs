//! Outbound draft events.
//!
//! The request path enqueues an [`Event`] once its change is durable and
//! returns immediately; [`run_dispatcher`] drains the queue into
//! [`Hub::broadcast`] in enqueue order, so events for one draft leave in
//! commit order.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::hub::Hub;
use super::model::{Change, Draft, DraftId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SegmentAdded,
    RingPassed,
    CollaboratorAdded,
    DraftUpdated,
}

/// `{"type", "draft_id", "ts", "user_id", "data"}`. `data` is a minimal
/// diff, never the full draft.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub draft_id: DraftId,
    pub ts: String,
    pub user_id: UserId,
    pub data: serde_json::Value,
}

impl Event {
    /// Describe `change`, already applied to `draft`, as done by `actor`.
    pub fn from_change(draft: &Draft, actor: &UserId, change: &Change, at: DateTime<Utc>) -> Self {
        let (kind, data) = match change {
            Change::SegmentAppended(segment) => (
                EventKind::SegmentAdded,
                json!({
                    "segment_id": segment.id,
                    "order": segment.order,
                    "author_id": segment.author_id,
                    "content": segment.content,
                    "ring_holder_id": segment.ring_holder_id,
                }),
            ),
            Change::RingPassed { from, to, .. } => (
                EventKind::RingPassed,
                json!({
                    "from_user_id": from,
                    "to_user_id": to,
                    "sequence": draft.ring.sequence(),
                }),
            ),
            Change::CollaboratorAdded(user) => (
                EventKind::CollaboratorAdded,
                json!({ "collaborator_id": user }),
            ),
            Change::Invited(user) => (
                EventKind::DraftUpdated,
                json!({ "invited_user_id": user }),
            ),
            Change::StatusChanged(status) => {
                (EventKind::DraftUpdated, json!({ "status": status }))
            }
        };
        Self {
            kind,
            draft_id: draft.id.clone(),
            ts: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            user_id: actor.clone(),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Non-blocking handle the request path pushes events into.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks. Events enqueued after the dispatcher stopped are
    /// dropped with a warning.
    pub fn enqueue(&self, event: Event) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            warn!(
                draft_id = %event.draft_id,
                kind = ?event.kind,
                "event dispatcher gone, dropping event"
            );
        }
    }
}

/// Drain `rx` into `hub` until shutdown, then flush what is already queued.
pub async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Event>,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => dispatch(&hub, &event),
                None => break,
            },
            _ = shutdown.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    dispatch(&hub, &event);
                }
                break;
            }
        }
    }
    debug!("event dispatcher stopped");
}

fn dispatch(hub: &Hub, event: &Event) {
    let payload = match event.to_json() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(draft_id = %event.draft_id, error = %e, "failed to encode event");
            return;
        }
    };
    let report = hub.broadcast(event.draft_id.as_str(), &payload);
    trace!(
        draft_id = %event.draft_id,
        kind = ?event.kind,
        delivered = report.delivered,
        pruned = report.pruned,
        "event dispatched"
    );
}
