//! Collaborative draft core: the turn-taking ring, its idempotent mutation
//! path and the room push gateway that fans changes out to watchers.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod gatekeeper;
pub mod hub;
pub mod identity;
pub mod ledger;
pub mod model;
pub mod rate_limiter;
pub mod reliability;
pub mod ring;
pub mod runtime;
pub mod server;
pub mod store;

pub use coordinator::{Applied, Command, Coordinator};
pub use errors::{MutationError, RateLimited, StoreError};
pub use events::{Event, EventKind};
pub use hub::Hub;
pub use model::{Draft, DraftId, DraftStatus, RingState, Segment, UserId};
pub use ring::{Operation, Outcome};
pub use runtime::{Ringwire, RunningServer};
pub use store::{MemoryStore, MutationService};
