//! Process wiring: builds every component from [`Settings`], binds both
//! listeners and owns the background tasks until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::api::{self, ApiState};
use super::config::Settings;
use super::coordinator::Coordinator;
use super::events::{EventQueue, run_dispatcher};
use super::gatekeeper::Gatekeeper;
use super::hub::Hub;
use super::rate_limiter::RateLimiter;
use super::server::{GatewayConfig, PushGateway};
use super::store::{MemoryStore, MutationService};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Ringwire {
    settings: Settings,
    store: Arc<dyn MutationService>,
    gateway: GatewayConfig,
}

impl Ringwire {
    pub fn new(settings: Settings) -> Self {
        let gateway = GatewayConfig::from(&settings.push);
        Self {
            settings,
            store: Arc::new(MemoryStore::new()),
            gateway,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MutationService>) -> Self {
        self.store = store;
        self
    }

    /// Override the gateway knobs derived from `push` settings.
    pub fn with_gateway_config(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    pub async fn start(self) -> std::io::Result<RunningServer> {
        let push_listener = TcpListener::bind(&self.settings.push.bind).await?;
        let api_listener = TcpListener::bind(&self.settings.api.bind).await?;
        let push_addr = push_listener.local_addr()?;
        let api_addr = api_listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let identity = Arc::new(self.settings.auth.identity_chain());
        let hub = Arc::new(Hub::new());
        let gatekeeper = Arc::new(Gatekeeper::new(
            self.settings.limits.clone(),
            self.settings.push.allowed_origins.clone(),
            Arc::clone(&identity),
        ));

        let (events, event_rx) = EventQueue::channel();
        let coordinator = Arc::new(Coordinator::new(
            self.store,
            self.settings.ledger.build(),
            RateLimiter::new(self.settings.rate_limit.clone()),
            events,
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_dispatcher(
            event_rx,
            Arc::clone(&hub),
            shutdown.clone(),
        )));

        let gateway = Arc::new(PushGateway::new(
            self.gateway,
            Arc::clone(&hub),
            Arc::clone(&gatekeeper),
        ));
        tasks.push(tokio::spawn(gateway.serve(push_listener, shutdown.clone())));

        let app = api::router(ApiState {
            coordinator: Arc::clone(&coordinator),
            identity,
        });
        let api_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            info!(addr = %api_addr, "http api listening");
            let serve = axum::serve(
                api_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "http api stopped with error");
            }
        }));

        tasks.push(tokio::spawn(maintenance(
            Arc::clone(&coordinator),
            shutdown.clone(),
        )));

        Ok(RunningServer {
            push_addr,
            api_addr,
            hub,
            gatekeeper,
            coordinator,
            shutdown,
            tasks,
        })
    }
}

async fn maintenance(coordinator: Arc<Coordinator>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => coordinator.maintain(),
            _ = shutdown.cancelled() => break,
        }
    }
}

pub struct RunningServer {
    push_addr: SocketAddr,
    api_addr: SocketAddr,
    hub: Arc<Hub>,
    gatekeeper: Arc<Gatekeeper>,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn push_addr(&self) -> SocketAddr {
        self.push_addr
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn gatekeeper(&self) -> &Arc<Gatekeeper> {
        &self.gatekeeper
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Stop accepting, close every connection with 1001, drain the event
    /// queue, then wait for the background tasks.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.cancel();
        self.hub.close_all();
        let join_all = futures_util::future::join_all(self.tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
            warn!("background tasks did not stop within the grace period");
        }
        info!("shut down");
    }
}
