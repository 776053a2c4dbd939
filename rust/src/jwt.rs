// HS256 access tokens.
//
// Only what the identity chain needs: verify a compact token against one
// shared secret and read its claims, plus minting for tests and tooling.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

const ALGORITHM: &str = "HS256";
/// Allowed clock drift for `nbf`.
const NBF_LEEWAY_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token is not three dot-separated segments")]
    Malformed,
    #[error("token segment is not base64url: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("unsupported algorithm {0:?}")]
    Algorithm(String),
    #[error("signature mismatch")]
    Signature,
    #[error("unreadable header or claims: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token expired")]
    Expired,
    #[error("token not valid yet")]
    NotYetValid,
    #[error("issuer mismatch")]
    Issuer,
    #[error("audience mismatch")]
    Audience,
    #[error("signing key rejected")]
    Key,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Registered claims ringwire reads. Unknown claims are ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Shared secret plus the expected `iss` / `aud`. Empty strings skip the
/// corresponding check.
#[derive(Clone)]
pub struct JwtConfig {
    pub secret: Vec<u8>,
    pub issuer: String,
    pub audience: String,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

impl JwtConfig {
    fn mac(&self) -> Result<Hmac<Sha256>, JwtError> {
        Hmac::<Sha256>::new_from_slice(&self.secret).map_err(|_| JwtError::Key)
    }

    /// Check signature, algorithm and time window, then `iss` / `aud` when
    /// configured.
    pub fn verify(&self, token: &str) -> Result<Claims, JwtError> {
        let (signed, signature) = token.rsplit_once('.').ok_or(JwtError::Malformed)?;
        let (header, body) = signed.split_once('.').ok_or(JwtError::Malformed)?;
        if body.contains('.') {
            return Err(JwtError::Malformed);
        }

        let mut mac = self.mac()?;
        mac.update(signed.as_bytes());
        mac.verify_slice(&B64.decode(signature)?)
            .map_err(|_| JwtError::Signature)?;

        let header: Header = serde_json::from_slice(&B64.decode(header)?)?;
        if header.alg != ALGORITHM {
            return Err(JwtError::Algorithm(header.alg));
        }
        let claims: Claims = serde_json::from_slice(&B64.decode(body)?)?;
        self.check(&claims, Utc::now().timestamp())?;
        Ok(claims)
    }

    fn check(&self, claims: &Claims, now: i64) -> Result<(), JwtError> {
        if now >= claims.exp {
            return Err(JwtError::Expired);
        }
        if claims.nbf.is_some_and(|nbf| now + NBF_LEEWAY_SECS < nbf) {
            return Err(JwtError::NotYetValid);
        }
        if !self.issuer.is_empty() && claims.iss.as_deref() != Some(self.issuer.as_str()) {
            return Err(JwtError::Issuer);
        }
        if !self.audience.is_empty() && claims.aud.as_deref() != Some(self.audience.as_str()) {
            return Err(JwtError::Audience);
        }
        Ok(())
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, JwtError> {
        let header = Header {
            alg: ALGORITHM.to_owned(),
            typ: Some("JWT".to_owned()),
        };
        let signed = format!(
            "{}.{}",
            B64.encode(serde_json::to_vec(&header)?),
            B64.encode(serde_json::to_vec(claims)?)
        );
        let mut mac = self.mac()?;
        mac.update(signed.as_bytes());
        let signature = B64.encode(mac.finalize().into_bytes());
        Ok(format!("{signed}.{signature}"))
    }

    /// Token for `subject` valid for `ttl`, carrying the configured
    /// issuer and audience.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, JwtError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_owned(),
            exp: now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX - now),
            iat: Some(now),
            nbf: None,
            iss: (!self.issuer.is_empty()).then(|| self.issuer.clone()),
            aud: (!self.audience.is_empty()).then(|| self.audience.clone()),
        };
        self.sign(&claims)
    }
}
