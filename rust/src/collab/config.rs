//! Server settings.
//!
//! Sources, later overriding earlier:
//! 1. built-in defaults
//! 2. `ringwire.yaml` in the working directory (if present)
//! 3. file passed on the command line
//! 4. file named by `RINGWIRE_CONFIG`
//! 5. `RINGWIRE__SECTION__KEY` environment variables

use std::sync::Arc;
use std::time::Duration;

use ::config::{Config as ConfigLib, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

use super::gatekeeper::ConnectionLimits;
use super::identity::{DEFAULT_IDENTITY_HEADER, IdentityChain, JwtVerifier, TokenVerifier};
use super::ledger::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL, IdempotencyLedger};
use super::rate_limiter::RateLimitSettings;
use super::server::PushSettings;
use crate::jwt::JwtConfig;

pub const DEFAULT_CONFIG_FILE: &str = "ringwire.yaml";
pub const CONFIG_ENV_VAR: &str = "RINGWIRE_CONFIG";
pub const CONFIG_ENV_PREFIX: &str = "RINGWIRE";
pub const LOG_ENV_VAR: &str = "RINGWIRE_LOG";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub bind: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7071".into(),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    /// Trust a plain identity header. Test and internal use only.
    pub allow_header_identity: bool,
    pub identity_header: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_issuer: String::new(),
            jwt_audience: String::new(),
            allow_header_identity: false,
            identity_header: DEFAULT_IDENTITY_HEADER.into(),
        }
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &"<redacted>")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("allow_header_identity", &self.allow_header_identity)
            .field("identity_header", &self.identity_header)
            .finish()
    }
}

impl AuthSettings {
    pub fn jwt_config(&self) -> Option<JwtConfig> {
        (!self.jwt_secret.is_empty()).then(|| JwtConfig {
            secret: self.jwt_secret.as_bytes().to_vec(),
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
        })
    }

    pub fn identity_chain(&self) -> IdentityChain {
        let verifier = self
            .jwt_config()
            .map(|c| Arc::new(JwtVerifier::new(c)) as Arc<dyn TokenVerifier>);
        let header = self
            .allow_header_identity
            .then_some(self.identity_header.as_str());
        IdentityChain::standard(verifier, header)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl_secs: DEFAULT_TTL.as_secs(),
        }
    }
}

impl LedgerSettings {
    pub fn build(&self) -> IdempotencyLedger {
        IdempotencyLedger::new(self.max_entries, Duration::from_secs(self.ttl_secs))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub push: PushSettings,
    pub api: ApiSettings,
    pub limits: ConnectionLimits,
    pub rate_limit: RateLimitSettings,
    pub auth: AuthSettings,
    pub ledger: LedgerSettings,
}

fn environment() -> Environment {
    Environment::with_prefix(CONFIG_ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("push.allowed_origins")
        .try_parsing(true)
}

impl Settings {
    pub fn load(path: Option<&str>) -> Result<Self, SettingsError> {
        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));
        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }
        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }
        let settings: Settings = builder.add_source(environment()).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.auth.jwt_secret.is_empty() && !self.auth.allow_header_identity {
            return Err(SettingsError::Invalid {
                field: "auth",
                reason: "set auth.jwt_secret or enable auth.allow_header_identity".into(),
            });
        }
        if self.push.keepalive_timeout_secs <= self.push.keepalive_interval_secs {
            return Err(SettingsError::Invalid {
                field: "push.keepalive_timeout_secs",
                reason: "must be greater than push.keepalive_interval_secs".into(),
            });
        }
        if self.push.max_payload_bytes == 0 {
            return Err(SettingsError::Invalid {
                field: "push.max_payload_bytes",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}
