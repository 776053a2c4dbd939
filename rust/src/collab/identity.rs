//! Caller identity.
//!
//! An [`IdentityChain`] asks each [`IdentityResolver`] in priority order
//! for the acting user. A resolver either names the user or has no opinion;
//! the chain fails only when every resolver declines.

use std::sync::Arc;

use http::HeaderMap;
use http::header::{AUTHORIZATION, COOKIE};
use thiserror::Error;
use tracing::debug;

use super::model::UserId;
use crate::jwt::{JwtConfig, JwtError};

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const DEFAULT_IDENTITY_HEADER: &str = "x-user-id";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error("token has no subject")]
    MissingSubject,
}

/// External token verifier: token in, opaque user id out.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

pub struct JwtVerifier {
    config: JwtConfig,
}

impl JwtVerifier {
    pub fn new(config: JwtConfig) -> Self {
        Self { config }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let claims = self.config.verify(token)?;
        if claims.sub.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(UserId::from(claims.sub))
    }
}

/// Value of cookie `name` in a `Cookie` header. Placeholder values some
/// browser clients write (`undefined`, `null`) count as absent.
fn cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty() && *value != "undefined" && *value != "null")
}

pub trait IdentityResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` means "no opinion", not "rejected".
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId>;
}

fn verify_logged(verifier: &dyn TokenVerifier, token: &str, source: &'static str) -> Option<UserId> {
    match verifier.verify(token) {
        Ok(user) => Some(user),
        Err(e) => {
            debug!(source, error = %e, "token rejected");
            None
        }
    }
}

/// `Authorization: Bearer <token>`.
pub struct BearerTokenResolver {
    verifier: Arc<dyn TokenVerifier>,
}

impl BearerTokenResolver {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }
}

impl IdentityResolver for BearerTokenResolver {
    fn name(&self) -> &'static str {
        "bearer"
    }

    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))?
            .trim();
        if token.is_empty() {
            return None;
        }
        verify_logged(self.verifier.as_ref(), token, "bearer")
    }
}

/// Browsers cannot set headers on a WebSocket upgrade, so the same token
/// is also accepted from a cookie.
pub struct CookieTokenResolver {
    verifier: Arc<dyn TokenVerifier>,
    cookie: String,
}

impl CookieTokenResolver {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier,
            cookie: ACCESS_TOKEN_COOKIE.to_owned(),
        }
    }
}

impl IdentityResolver for CookieTokenResolver {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|cookies| cookie_value(cookies, &self.cookie))
            .and_then(|token| verify_logged(self.verifier.as_ref(), token, "cookie"))
    }
}

/// Trusts a plain header. For tests and trusted internal callers only.
pub struct HeaderIdentityResolver {
    header: String,
}

impl HeaderIdentityResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
        }
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn name(&self) -> &'static str {
        "header"
    }

    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        let value = headers.get(self.header.as_str())?.to_str().ok()?.trim();
        (!value.is_empty()).then(|| UserId::from(value))
    }
}

#[derive(Default)]
pub struct IdentityChain {
    resolvers: Vec<Box<dyn IdentityResolver>>,
}

impl IdentityChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl IdentityResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    /// Bearer token, then access_token cookie, then (if enabled) the plain
    /// identity header.
    pub fn standard(
        verifier: Option<Arc<dyn TokenVerifier>>,
        identity_header: Option<&str>,
    ) -> Self {
        let mut chain = Self::new();
        if let Some(verifier) = verifier {
            chain = chain
                .with(BearerTokenResolver::new(verifier.clone()))
                .with(CookieTokenResolver::new(verifier));
        }
        if let Some(header) = identity_header {
            chain = chain.with(HeaderIdentityResolver::new(header));
        }
        chain
    }

    pub fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        self.resolvers.iter().find_map(|r| {
            let user = r.resolve(headers)?;
            debug!(resolver = r.name(), user_id = %user, "identity resolved");
            Some(user)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}
