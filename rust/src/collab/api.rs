//! HTTP request path.
//!
//! | Method | Path                           | Operation        |
//! |--------|--------------------------------|------------------|
//! | POST   | `/drafts`                      | create           |
//! | GET    | `/drafts/:id`                  | snapshot         |
//! | POST   | `/drafts/:id/segments`         | append           |
//! | POST   | `/drafts/:id/ring/pass`        | pass             |
//! | POST   | `/drafts/:id/collaborators`    | add collaborator |
//! | POST   | `/drafts/:id/invites`          | invite           |
//! | POST   | `/drafts/:id/invites/accept`   | accept invite    |
//! | POST   | `/drafts/:id/lock`             | lock             |
//! | POST   | `/drafts/:id/unlock`           | unlock           |
//! | POST   | `/drafts/:id/complete`         | complete         |
//!
//! Mutations take an optional `Idempotency-Key` header; replays are marked
//! with `Idempotent-Replayed: true`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::coordinator::{Applied, Command, Coordinator, route_for};
use super::errors::MutationError;
use super::identity::IdentityChain;
use super::model::{DraftId, UserId};
use super::rate_limiter::{RateKey, Route};
use super::ring::Operation;

pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");
pub const IDEMPOTENT_REPLAYED: HeaderName = HeaderName::from_static("idempotent-replayed");
const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Longest accepted idempotency key.
const MAX_KEY_LEN: usize = 255;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
    pub identity: Arc<IdentityChain>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/drafts", post(create_draft))
        .route("/drafts/:id", get(get_draft))
        .route("/drafts/:id/segments", post(append))
        .route("/drafts/:id/ring/pass", post(pass))
        .route("/drafts/:id/collaborators", post(add_collaborator))
        .route("/drafts/:id/invites", post(invite))
        .route("/drafts/:id/invites/accept", post(accept_invite))
        .route("/drafts/:id/lock", post(lock))
        .route("/drafts/:id/unlock", post(unlock))
        .route("/drafts/:id/complete", post(complete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    Unauthorized,
    BadRequest(&'static str),
    Mutation(MutationError),
}

impl From<MutationError> for ApiError {
    fn from(e: MutationError) -> Self {
        ApiError::Mutation(e)
    }
}

fn status_for(e: &MutationError) -> StatusCode {
    match e {
        MutationError::Forbidden(_) => StatusCode::FORBIDDEN,
        MutationError::NotFound => StatusCode::NOT_FOUND,
        MutationError::RingRequired { .. }
        | MutationError::InvalidTarget { .. }
        | MutationError::DraftLocked
        | MutationError::DraftCompleted
        | MutationError::KeyReused { .. } => StatusCode::CONFLICT,
        MutationError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        MutationError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"code": "unauthorized", "message": "authentication required"})),
            )
                .into_response(),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"code": "bad_request", "message": message})),
            )
                .into_response(),
            ApiError::Mutation(e) => {
                let body = Json(json!({"code": e.code(), "message": e.to_string()}));
                let mut response = (status_for(&e), body).into_response();
                if let MutationError::RateLimited(limited) = &e {
                    let headers = response.headers_mut();
                    let retry_secs = limited.retry_after.as_secs_f64().ceil().max(1.0) as u64;
                    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
                    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limited.limit));
                    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(limited.remaining));
                }
                response
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

type Peer = Option<ConnectInfo<SocketAddr>>;

/// The acting user. Requests without one still spend from the client IP's
/// bucket for `route` before the 401, so a 429 wins once that is empty.
fn actor(state: &ApiState, headers: &HeaderMap, peer: Peer, route: Route) -> Result<UserId, ApiError> {
    if let Some(user) = state.identity.resolve(headers) {
        return Ok(user);
    }
    let fallback = RateKey::from_parts(None, peer.map(|ConnectInfo(addr)| addr.ip()));
    state.coordinator.throttle_anonymous(&fallback, route)?;
    Err(ApiError::Unauthorized)
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(&IDEMPOTENCY_KEY) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("idempotency key must be ASCII"))?
        .trim();
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(ApiError::BadRequest("idempotency key must be 1-255 characters"));
    }
    Ok(Some(key.to_owned()))
}

fn respond(applied: Applied, status: StatusCode) -> Response {
    let mut response = (status, Json(&applied.outcome)).into_response();
    if applied.replayed {
        response
            .headers_mut()
            .insert(IDEMPOTENT_REPLAYED, HeaderValue::from_static("true"));
    }
    response
}

async fn run(
    state: &ApiState,
    headers: &HeaderMap,
    peer: Peer,
    draft_id: String,
    op: Operation,
) -> Result<Response, ApiError> {
    let actor = actor(state, headers, peer, route_for(&op))?;
    let cmd = Command {
        draft_id: DraftId::from(draft_id),
        actor,
        op,
        idempotency_key: idempotency_key(headers)?,
    };
    let applied = state.coordinator.execute(cmd).await?;
    Ok(respond(applied, StatusCode::OK))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CreateDraftBody {
    #[serde(default)]
    pub opening: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AppendBody {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct PassBody {
    pub to_user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserBody {
    pub user_id: String,
}

async fn create_draft(
    State(state): State<ApiState>,
    headers: HeaderMap,
    peer: Peer,
    body: Option<Json<CreateDraftBody>>,
) -> Result<Response, ApiError> {
    let actor = actor(&state, &headers, peer, Route::CreateDraft)?;
    let key = idempotency_key(&headers)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let applied = state
        .coordinator
        .create(&actor, body.opening.as_deref(), key.as_deref())
        .await?;
    Ok(respond(applied, StatusCode::CREATED))
}

async fn get_draft(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
) -> Result<Response, ApiError> {
    let caller = actor(&state, &headers, peer, Route::ReadDraft)?;
    let draft = state
        .coordinator
        .snapshot(&DraftId::from(id), &RateKey::Actor(caller))
        .await?;
    Ok(Json(draft).into_response())
}

async fn append(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
    Json(body): Json<AppendBody>,
) -> Result<Response, ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty"));
    }
    run(&state, &headers, peer, id, Operation::Append { content: body.content }).await
}

async fn pass(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
    Json(body): Json<PassBody>,
) -> Result<Response, ApiError> {
    let to = UserId::from(body.to_user_id);
    run(&state, &headers, peer, id, Operation::Pass { to }).await
}

async fn add_collaborator(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
    Json(body): Json<UserBody>,
) -> Result<Response, ApiError> {
    let user = UserId::from(body.user_id);
    run(&state, &headers, peer, id, Operation::AddCollaborator { user }).await
}

async fn invite(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
    Json(body): Json<UserBody>,
) -> Result<Response, ApiError> {
    let user = UserId::from(body.user_id);
    run(&state, &headers, peer, id, Operation::Invite { user }).await
}

async fn accept_invite(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
) -> Result<Response, ApiError> {
    run(&state, &headers, peer, id, Operation::AcceptInvite).await
}

async fn lock(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
) -> Result<Response, ApiError> {
    run(&state, &headers, peer, id, Operation::Lock).await
}

async fn unlock(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
) -> Result<Response, ApiError> {
    run(&state, &headers, peer, id, Operation::Unlock).await
}

async fn complete(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    peer: Peer,
) -> Result<Response, ApiError> {
    run(&state, &headers, peer, id, Operation::Complete).await
}
