//! Request/response side of the draft API: the snapshot fetch that polling
//! and reconnect reconciliation depend on, plus thin mutation calls.

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::protocol::Credentials;
use ringwire::collab::{Draft, DraftId, UserId};

const IDEMPOTENCY_KEY: &str = "idempotency-key";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("invalid credential header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("request failed with {status}: {code}")]
    Status { status: StatusCode, code: String },
}

impl FetchError {
    /// Structured error code from the server, if the request got that far.
    pub fn code(&self) -> Option<&str> {
        match self {
            FetchError::Status { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
}

#[derive(Deserialize)]
struct Created {
    draft: Draft,
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    credentials: Credentials,
}

impl ApiClient {
    pub fn new(base: &str, credentials: Credentials) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_owned(),
            credentials,
        }
    }

    fn headers(&self, key: Option<&str>) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        self.credentials.apply(&mut headers)?;
        if let Some(key) = key {
            headers.insert(IDEMPOTENCY_KEY, HeaderValue::from_str(key)?);
        }
        Ok(headers)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, FetchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let code = match response.json::<ErrorBody>().await {
            Ok(body) => body.code,
            Err(_) => status.canonical_reason().unwrap_or("unknown").to_owned(),
        };
        Err(FetchError::Status { status, code })
    }

    pub async fn snapshot(&self, draft: &DraftId) -> Result<Draft, FetchError> {
        let response = self
            .http
            .get(format!("{}/drafts/{}", self.base, draft))
            .headers(self.headers(None)?)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn create(&self, opening: Option<&str>, key: Option<&str>) -> Result<Draft, FetchError> {
        let response = self
            .http
            .post(format!("{}/drafts", self.base))
            .headers(self.headers(key)?)
            .json(&json!({ "opening": opening }))
            .send()
            .await?;
        Ok(Self::decode::<Created>(response).await?.draft)
    }

    /// POST to `/drafts/{id}/{action}` and return the outcome JSON.
    pub async fn mutate(
        &self,
        draft: &DraftId,
        action: &str,
        body: Value,
        key: Option<&str>,
    ) -> Result<Value, FetchError> {
        let response = self
            .http
            .post(format!("{}/drafts/{}/{}", self.base, draft, action))
            .headers(self.headers(key)?)
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn append(&self, draft: &DraftId, content: &str, key: Option<&str>) -> Result<Value, FetchError> {
        self.mutate(draft, "segments", json!({ "content": content }), key)
            .await
    }

    pub async fn pass(&self, draft: &DraftId, to: &UserId, key: Option<&str>) -> Result<Value, FetchError> {
        self.mutate(draft, "ring/pass", json!({ "to_user_id": to }), key)
            .await
    }

    pub async fn add_collaborator(
        &self,
        draft: &DraftId,
        user: &UserId,
        key: Option<&str>,
    ) -> Result<Value, FetchError> {
        self.mutate(draft, "collaborators", json!({ "user_id": user }), key)
            .await
    }
}
