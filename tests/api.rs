use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

use ringwire::collab::api::{self, ApiState};
use ringwire::collab::coordinator::Coordinator;
use ringwire::collab::events::{Event, EventQueue};
use ringwire::collab::identity::{HeaderIdentityResolver, IdentityChain};
use ringwire::collab::ledger::IdempotencyLedger;
use ringwire::collab::rate_limiter::{RateLimitSettings, RateLimiter};
use ringwire::collab::store::MemoryStore;

struct Harness {
    app: Router,
    events: mpsc::UnboundedReceiver<Event>,
}

fn harness(rate_limit: RateLimitSettings) -> Harness {
    let (queue, events) = EventQueue::channel();
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(MemoryStore::new()),
        IdempotencyLedger::default(),
        RateLimiter::new(rate_limit),
        queue,
    ));
    let identity = Arc::new(IdentityChain::new().with(HeaderIdentityResolver::new("x-user-id")));
    Harness {
        app: api::router(ApiState {
            coordinator,
            identity,
        }),
        events,
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl Harness {
    async fn call(
        &self,
        method: Method,
        uri: &str,
        user: Option<&str>,
        key: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header("x-user-id", user);
        }
        if let Some(key) = key {
            req = req.header("idempotency-key", key);
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn post(&self, uri: &str, user: &str, body: Value) -> Reply {
        self.call(Method::POST, uri, Some(user), None, Some(body)).await
    }

    /// Create a draft owned by alice with bob as collaborator.
    async fn draft_with_bob(&self) -> String {
        let created = self
            .post("/drafts", "alice", json!({"opening": "Once upon a time"}))
            .await;
        assert_eq!(created.status, StatusCode::CREATED);
        let id = created.body["draft"]["id"].as_str().unwrap().to_owned();
        let added = self
            .post(&format!("/drafts/{id}/collaborators"), "alice", json!({"user_id": "bob"}))
            .await;
        assert_eq!(added.status, StatusCode::OK);
        id
    }
}

fn disabled() -> RateLimitSettings {
    RateLimitSettings::default()
}

#[tokio::test]
async fn create_then_snapshot() {
    let h = harness(disabled());
    let created = h.post("/drafts", "alice", json!({"opening": "Hello"})).await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["result"], "created");
    let id = created.body["draft"]["id"].as_str().unwrap();

    let snap = h
        .call(Method::GET, &format!("/drafts/{id}"), Some("alice"), None, None)
        .await;
    assert_eq!(snap.status, StatusCode::OK);
    assert_eq!(snap.body["status"], "ACTIVE");
    assert_eq!(snap.body["creator_id"], "alice");
    assert_eq!(snap.body["ring"]["current_holder_id"], "alice");
    assert_eq!(snap.body["segments"][0]["content"], "Hello");
}

#[tokio::test]
async fn create_without_body() {
    let h = harness(disabled());
    let created = h.call(Method::POST, "/drafts", Some("alice"), None, None).await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["draft"]["segments"], json!([]));
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let h = harness(disabled());
    let r = h.call(Method::POST, "/drafts", None, None, Some(json!({}))).await;
    assert_eq!(r.status, StatusCode::UNAUTHORIZED);
    assert_eq!(r.body["code"], "unauthorized");

    let r = h.call(Method::GET, "/drafts/anything", None, None, None).await;
    assert_eq!(r.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_draft_is_not_found() {
    let h = harness(disabled());
    let r = h.call(Method::GET, "/drafts/nope", Some("alice"), None, None).await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
    assert_eq!(r.body["code"], "not_found");

    let r = h
        .post("/drafts/nope/segments", "alice", json!({"content": "x"}))
        .await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn turn_taking_over_http() {
    let mut h = harness(disabled());
    let id = h.draft_with_bob().await;

    let r = h
        .post(&format!("/drafts/{id}/segments"), "bob", json!({"content": "Bob first"}))
        .await;
    assert_eq!(r.status, StatusCode::CONFLICT);
    assert_eq!(r.body["code"], "ring_required");

    let r = h
        .post(&format!("/drafts/{id}/segments"), "alice", json!({"content": "Alice writes"}))
        .await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.body["result"], "appended");
    assert_eq!(r.body["segment"]["order"], 1);

    let r = h
        .post(&format!("/drafts/{id}/ring/pass"), "alice", json!({"to_user_id": "bob"}))
        .await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.body["to_user_id"], "bob");
    assert_eq!(r.body["sequence"], 1);

    let r = h
        .post(&format!("/drafts/{id}/segments"), "bob", json!({"content": "Bob writes"}))
        .await;
    assert_eq!(r.status, StatusCode::OK);

    let kinds: Vec<String> = std::iter::from_fn(|| h.events.try_recv().ok())
        .map(|e| serde_json::to_value(e.kind).unwrap().as_str().unwrap().to_owned())
        .collect();
    assert_eq!(
        kinds,
        ["collaborator_added", "segment_added", "ring_passed", "segment_added"]
    );
}

#[tokio::test]
async fn pass_to_outsider_is_invalid_target() {
    let h = harness(disabled());
    let id = h.draft_with_bob().await;
    let r = h
        .post(&format!("/drafts/{id}/ring/pass"), "alice", json!({"to_user_id": "mallory"}))
        .await;
    assert_eq!(r.status, StatusCode::CONFLICT);
    assert_eq!(r.body["code"], "invalid_target");

    let snap = h
        .call(Method::GET, &format!("/drafts/{id}"), Some("alice"), None, None)
        .await;
    assert_eq!(snap.body["ring"]["current_holder_id"], "alice");
}

#[tokio::test]
async fn idempotent_replay_is_marked() {
    let mut h = harness(disabled());
    let id = h.draft_with_bob().await;
    let uri = format!("/drafts/{id}/segments");
    while h.events.try_recv().is_ok() {}

    let body = json!({"content": "only once"});
    let first = h
        .call(Method::POST, &uri, Some("alice"), Some("k-1"), Some(body.clone()))
        .await;
    assert_eq!(first.status, StatusCode::OK);
    assert!(first.headers.get("idempotent-replayed").is_none());

    let second = h
        .call(Method::POST, &uri, Some("alice"), Some("k-1"), Some(body))
        .await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.headers["idempotent-replayed"], "true");
    assert_eq!(second.body, first.body);

    let snap = h
        .call(Method::GET, &format!("/drafts/{id}"), Some("alice"), None, None)
        .await;
    assert_eq!(snap.body["segments"].as_array().unwrap().len(), 2);
    assert!(h.events.try_recv().is_ok());
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn key_reused_for_other_operation_conflicts() {
    let h = harness(disabled());
    let id = h.draft_with_bob().await;
    let r = h
        .call(
            Method::POST,
            &format!("/drafts/{id}/segments"),
            Some("alice"),
            Some("k-2"),
            Some(json!({"content": "x"})),
        )
        .await;
    assert_eq!(r.status, StatusCode::OK);

    let r = h
        .call(
            Method::POST,
            &format!("/drafts/{id}/ring/pass"),
            Some("alice"),
            Some("k-2"),
            Some(json!({"to_user_id": "bob"})),
        )
        .await;
    assert_eq!(r.status, StatusCode::CONFLICT);
    assert_eq!(r.body["code"], "idempotency_conflict");
}

#[tokio::test]
async fn lifecycle_errors() {
    let h = harness(disabled());
    let id = h.draft_with_bob().await;

    let r = h.post(&format!("/drafts/{id}/lock"), "bob", json!({})).await;
    assert_eq!(r.status, StatusCode::FORBIDDEN);
    assert_eq!(r.body["code"], "forbidden");

    let r = h.call(Method::POST, &format!("/drafts/{id}/lock"), Some("alice"), None, None).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.body["status"], "LOCKED");

    let r = h
        .post(&format!("/drafts/{id}/segments"), "alice", json!({"content": "x"}))
        .await;
    assert_eq!(r.status, StatusCode::CONFLICT);
    assert_eq!(r.body["code"], "draft_locked");

    let r = h.call(Method::POST, &format!("/drafts/{id}/complete"), Some("alice"), None, None).await;
    assert_eq!(r.status, StatusCode::OK);

    let r = h.call(Method::POST, &format!("/drafts/{id}/unlock"), Some("alice"), None, None).await;
    assert_eq!(r.status, StatusCode::CONFLICT);
    assert_eq!(r.body["code"], "draft_completed");
}

#[tokio::test]
async fn invitation_flow() {
    let h = harness(disabled());
    let id = h.draft_with_bob().await;

    let r = h
        .call(Method::POST, &format!("/drafts/{id}/invites/accept"), Some("carol"), None, None)
        .await;
    assert_eq!(r.status, StatusCode::FORBIDDEN);

    let r = h
        .post(&format!("/drafts/{id}/invites"), "alice", json!({"user_id": "carol"}))
        .await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.body["added"], true);

    let r = h
        .call(Method::POST, &format!("/drafts/{id}/invites/accept"), Some("carol"), None, None)
        .await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.body["collaborator_id"], "carol");

    let r = h
        .post(&format!("/drafts/{id}/ring/pass"), "alice", json!({"to_user_id": "carol"}))
        .await;
    assert_eq!(r.status, StatusCode::OK);
}

#[tokio::test]
async fn bad_requests() {
    let h = harness(disabled());
    let id = h.draft_with_bob().await;

    let r = h
        .post(&format!("/drafts/{id}/segments"), "alice", json!({"content": "   "}))
        .await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);

    let long_key = "k".repeat(256);
    let r = h
        .call(
            Method::POST,
            &format!("/drafts/{id}/segments"),
            Some("alice"),
            Some(&long_key),
            Some(json!({"content": "x"})),
        )
        .await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rate_limited_reports_headers() {
    let h = harness(RateLimitSettings {
        enabled: true,
        mutating_per_minute: 1,
        mutating_burst: 2,
        ..RateLimitSettings::default()
    });
    let created = h.post("/drafts", "alice", json!({})).await;
    let id = created.body["draft"]["id"].as_str().unwrap().to_owned();
    let uri = format!("/drafts/{id}/segments");

    for _ in 0..2 {
        let r = h.post(&uri, "alice", json!({"content": "x"})).await;
        assert_eq!(r.status, StatusCode::OK);
    }
    let r = h.post(&uri, "alice", json!({"content": "x"})).await;
    assert_eq!(r.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(r.body["code"], "rate_limited");
    let retry: u64 = r.headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry));
    assert_eq!(r.headers["x-ratelimit-limit"], "1");
    assert_eq!(r.headers["x-ratelimit-remaining"], "0");

    // other callers have their own buckets
    let r = h.post(&uri, "bob", json!({"content": "x"})).await;
    assert_eq!(r.body["code"], "ring_required");
}

/// Status of an unauthenticated request arriving from `peer`.
async fn anonymous_status(h: &Harness, method: Method, uri: &str, peer: &str, body: Option<Value>) -> StatusCode {
    let peer: SocketAddr = peer.parse().unwrap();
    let req = Request::builder().method(method).uri(uri);
    let mut req = match body {
        Some(body) => req
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    req.extensions_mut().insert(ConnectInfo(peer));
    h.app.clone().oneshot(req).await.unwrap().status()
}

#[tokio::test]
async fn anonymous_callers_are_limited_by_address() {
    let h = harness(RateLimitSettings {
        enabled: true,
        read_per_minute: 1,
        read_burst: 2,
        mutating_per_minute: 1,
        mutating_burst: 1,
        ..RateLimitSettings::default()
    });
    let id = h.draft_with_bob().await;
    let read = format!("/drafts/{id}");

    for _ in 0..2 {
        let status = anonymous_status(&h, Method::GET, &read, "10.0.0.7:4000", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let status = anonymous_status(&h, Method::GET, &read, "10.0.0.7:4001", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // another address still gets the plain rejection
    let status = anonymous_status(&h, Method::GET, &read, "10.0.0.8:4000", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let append = format!("/drafts/{id}/segments");
    let body = json!({"content": "sneaky"});
    let status = anonymous_status(&h, Method::POST, &append, "10.0.0.9:4000", Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let status = anonymous_status(&h, Method::POST, &append, "10.0.0.9:4000", Some(body)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // identified callers keep their own buckets
    let r = h.call(Method::GET, &read, Some("alice"), None, None).await;
    assert_eq!(r.status, StatusCode::OK);
}
