//! Follow one draft: push channel first, full-state polling when push is
//! unavailable, both folded into a single deduplicating [`view::DraftView`].

pub mod config;
pub mod http;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod view;

pub use protocol::Credentials;
pub use session::{Mode, RemoteTransport, Session, SessionConfig, Transport};
pub use view::DraftView;
