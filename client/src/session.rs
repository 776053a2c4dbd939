//! Push/poll mode driver.
//!
//! The session tries the push channel first. Every successful subscribe is
//! followed by a full snapshot fetch so events missed before joining are
//! recovered. While push is down it polls on a [`PollSchedule`] and retries
//! push with exponential backoff; once the reconnect budget is spent it
//! stays on polling for good.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ringwire::collab::reliability::ExponentialBackoff;
use ringwire::collab::{Draft, DraftId, Event};

use crate::http::{ApiClient, FetchError};
use crate::poller::PollSchedule;
use crate::protocol::{ConnectError, Credentials, connect, pump_events};
use crate::view::DraftView;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Unavailable(String),
}

/// Stream of draft events for one push channel; closes when it drops.
pub type Subscription = mpsc::Receiver<Event>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn subscribe(&self) -> Result<Subscription, TransportError>;
    async fn fetch(&self) -> Result<Draft, TransportError>;
}

/// Push over WebSocket, snapshots over HTTP.
pub struct RemoteTransport {
    push_url: String,
    draft_id: DraftId,
    credentials: Credentials,
    api: ApiClient,
    connect_timeout: Duration,
}

impl RemoteTransport {
    pub fn new(push_base: &str, api_base: &str, draft_id: DraftId, credentials: Credentials) -> Self {
        Self {
            push_url: format!("{}/ws/drafts/{}", push_base.trim_end_matches('/'), draft_id),
            api: ApiClient::new(api_base, credentials.clone()),
            draft_id,
            credentials,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    async fn subscribe(&self) -> Result<Subscription, TransportError> {
        let (ws, connected) = connect(&self.push_url, &self.credentials, self.connect_timeout).await?;
        debug!(
            connection_id = %connected.connection_id,
            draft_id = %connected.draft_id,
            "push channel open"
        );
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(pump_events(
            ws,
            Duration::from_secs(connected.keepalive_secs),
            tx,
        ));
        Ok(rx)
    }

    async fn fetch(&self) -> Result<Draft, TransportError> {
        Ok(self.api.snapshot(&self.draft_id).await?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Connecting,
    Push,
    Polling,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// `false` skips push entirely.
    pub push_enabled: bool,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Reconnects after the first attempt before push is abandoned.
    pub max_reconnect_attempts: u32,
    pub poll_interval: Duration,
    pub poll_max_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            poll_interval: Duration::from_secs(5),
            poll_max_interval: Duration::from_secs(60),
        }
    }
}

pub struct Session<T> {
    transport: T,
    config: SessionConfig,
    view: watch::Sender<DraftView>,
    mode: watch::Sender<Mode>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let initial = if config.push_enabled {
            Mode::Connecting
        } else {
            Mode::Polling
        };
        Self {
            transport,
            config,
            view: watch::channel(DraftView::default()).0,
            mode: watch::channel(initial).0,
        }
    }

    pub fn view(&self) -> watch::Receiver<DraftView> {
        self.view.subscribe()
    }

    pub fn mode(&self) -> watch::Receiver<Mode> {
        self.mode.subscribe()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut reconnect =
            ExponentialBackoff::new(self.config.reconnect_initial, self.config.reconnect_max)
                .with_multiplier(2.0)
                .with_max_attempts(self.config.max_reconnect_attempts);
        let mut poll = PollSchedule::new(self.config.poll_interval, self.config.poll_max_interval);
        let mut next_push = self.config.push_enabled.then(Instant::now);
        let mut next_poll = Instant::now();

        while !shutdown.is_cancelled() {
            if next_push.is_some_and(|at| at <= Instant::now()) {
                match self.transport.subscribe().await {
                    Ok(subscription) => {
                        reconnect.reset();
                        poll.on_success();
                        self.mode.send_replace(Mode::Push);
                        info!("push channel established");
                        self.refresh().await;
                        if !self.follow(subscription, &shutdown).await {
                            break;
                        }
                        info!("push channel lost");
                        next_poll = Instant::now();
                    }
                    Err(e) => warn!(error = %e, attempts = reconnect.attempts(), "push unavailable"),
                }
                next_push = reconnect.next_delay().map(|delay| Instant::now() + delay);
                if next_push.is_none() {
                    warn!(
                        attempts = reconnect.attempts(),
                        "reconnect budget spent, polling from now on"
                    );
                }
                self.mode.send_replace(Mode::Polling);
                continue;
            }

            if Instant::now() >= next_poll {
                let delay = match self.transport.fetch().await {
                    Ok(draft) => {
                        self.view.send_if_modified(|view| view.apply_snapshot(&draft));
                        poll.on_success()
                    }
                    Err(e) => {
                        let delay = poll.on_failure();
                        warn!(error = %e, failures = poll.failures(), retry_in = ?delay, "poll failed");
                        delay
                    }
                };
                next_poll = Instant::now() + delay;
            }

            let wake = next_push.map_or(next_poll, |at| at.min(next_poll));
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("session stopped");
    }

    /// Fetch the full draft once, e.g. right after (re)subscribing.
    async fn refresh(&self) {
        match self.transport.fetch().await {
            Ok(draft) => {
                self.view.send_if_modified(|view| view.apply_snapshot(&draft));
            }
            Err(e) => warn!(error = %e, "snapshot after subscribe failed"),
        }
    }

    /// Apply events until the channel closes (`true`) or shutdown (`false`).
    async fn follow(&self, mut subscription: Subscription, shutdown: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => {
                        self.view.send_if_modified(|view| view.apply_event(&event));
                    }
                    None => return true,
                },
                _ = shutdown.cancelled() => return false,
            }
        }
    }
}
