use std::time::Duration;

use clap::Parser;
use tokio_tungstenite::tungstenite::http::HeaderName;

use crate::protocol::{Credentials, DEFAULT_USER_HEADER};
use crate::session::SessionConfig;

pub const DEFAULT_PUSH_URL: &str = "ws://127.0.0.1:7070";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:7071";

#[derive(Parser, Debug, Clone)]
#[command(name = "ringwire-watch", about = "Follow a draft live, falling back to polling")]
pub struct Cli {
    /// Draft to follow
    pub draft: String,

    /// Push gateway base URL
    #[arg(long, env = "RINGWIRE_PUSH_URL", default_value = DEFAULT_PUSH_URL)]
    pub push_url: String,

    /// HTTP API base URL
    #[arg(long, env = "RINGWIRE_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Bearer token
    #[arg(long, env = "RINGWIRE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Plain user id, for servers that accept the identity header
    #[arg(long, env = "RINGWIRE_USER")]
    pub user: Option<String>,

    #[arg(long, default_value = DEFAULT_USER_HEADER)]
    pub user_header: HeaderName,

    /// Poll interval in seconds while push is down
    #[arg(long, default_value_t = 5)]
    pub poll_secs: u64,

    /// Upper bound for the poll interval after failures
    #[arg(long, default_value_t = 60)]
    pub poll_max_secs: u64,

    /// Push reconnects before polling for good
    #[arg(long, default_value_t = 10)]
    pub max_reconnects: u32,

    /// Never open the push channel
    #[arg(long)]
    pub poll_only: bool,
}

impl Cli {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            bearer: self.token.clone(),
            user: self.user.clone(),
            user_header: self.user_header.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            push_enabled: !self.poll_only,
            max_reconnect_attempts: self.max_reconnects,
            poll_interval: Duration::from_secs(self.poll_secs.max(1)),
            poll_max_interval: Duration::from_secs(self.poll_max_secs.max(1)),
            ..SessionConfig::default()
        }
    }
}
