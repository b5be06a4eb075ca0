//! Authorization server configuration.
//!
//! The configuration is loaded once (usually from TOML), validated, and then
//! shared as an immutable `Arc<AuthConfig>` snapshot by every strategy and
//! handler. Reloading means building a new provider from a new snapshot, see
//! [`ProviderHandle`](crate::oauth::ProviderHandle).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scope::{AudienceStrategy, ScopeStrategy};
use crate::token::TokenKind;

/// Minimum length of the HMAC secret and of the random part of opaque tokens.
pub const MIN_SECRET_BYTES: usize = 64;

/// Root authorization server configuration.
///
/// # Example (TOML)
///
/// ```toml
/// issuer = "https://auth.example.com"
///
/// [oauth]
/// access_token_lifetime = "1h"
/// scope_strategy = "hierarchic"
///
/// [tokens]
/// secret = "...at least 64 bytes..."
///
/// [flow]
/// login_url = "https://login.example.com/login"
/// consent_url = "https://login.example.com/consent"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Issuer URL (used in the `iss` claim and introspection responses).
    pub issuer: String,

    /// OAuth 2.0 protocol settings.
    pub oauth: OAuthConfig,

    /// Token generation settings.
    pub tokens: TokensConfig,

    /// PKCE enforcement.
    pub pkce: PkceConfig,

    /// Login/consent flow settings.
    pub flow: FlowConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:4444".to_string(),
            oauth: OAuthConfig::default(),
            tokens: TokensConfig::default(),
            pkce: PkceConfig::default(),
            flow: FlowConfig::default(),
        }
    }
}

/// OAuth 2.0 protocol settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Authorization code lifetime.
    #[serde(with = "humantime_serde")]
    pub authorization_code_lifetime: Duration,

    /// Access token lifetime.
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,

    /// Refresh token lifetime.
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,

    /// ID token lifetime.
    #[serde(with = "humantime_serde")]
    pub id_token_lifetime: Duration,

    /// Granting any of these scopes issues a refresh token.
    pub refresh_token_scopes: Vec<String>,

    /// How requested scopes are matched against a client's scopes.
    pub scope_strategy: ScopeStrategy,

    /// How requested audiences are matched against a client's audiences.
    pub audience_strategy: AudienceStrategy,

    /// Minimum length of the `state` parameter.
    pub min_parameter_entropy: usize,

    /// Only access tokens are introspected when set.
    pub disable_refresh_token_validation: bool,

    /// Include `error_debug` in error responses.
    pub send_debug_messages: bool,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            authorization_code_lifetime: Duration::from_secs(600),
            access_token_lifetime: Duration::from_secs(3600),
            refresh_token_lifetime: Duration::from_secs(30 * 24 * 3600),
            id_token_lifetime: Duration::from_secs(3600),
            refresh_token_scopes: vec!["offline".to_string(), "offline_access".to_string()],
            scope_strategy: ScopeStrategy::default(),
            audience_strategy: AudienceStrategy::default(),
            min_parameter_entropy: 8,
            disable_refresh_token_validation: false,
            send_debug_messages: false,
        }
    }
}

impl OAuthConfig {
    /// Returns the configured lifetime of a token kind.
    #[must_use]
    pub fn lifetime(&self, kind: TokenKind) -> time::Duration {
        let lifetime = match kind {
            TokenKind::AuthorizeCode => self.authorization_code_lifetime,
            TokenKind::AccessToken => self.access_token_lifetime,
            TokenKind::RefreshToken => self.refresh_token_lifetime,
            TokenKind::IdToken => self.id_token_lifetime,
        };
        to_time_duration(lifetime)
    }
}

/// Format of issued access tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTokenFormat {
    /// HMAC-signed random tokens.
    #[default]
    Opaque,
    /// Signed JWT access tokens.
    Jwt,
}

/// Token generation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokensConfig {
    /// Access token format.
    pub access_token_format: AccessTokenFormat,

    /// HMAC signing secret. Must be at least 64 bytes.
    pub secret: String,

    /// Previous secrets still accepted when validating tokens.
    pub rotated_secrets: Vec<String>,

    /// Number of random bytes in an opaque token.
    pub entropy: usize,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            access_token_format: AccessTokenFormat::default(),
            secret: String::new(),
            rotated_secrets: Vec::new(),
            entropy: MIN_SECRET_BYTES,
        }
    }
}

/// PKCE enforcement.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PkceConfig {
    /// Require PKCE for every client.
    pub enforce: bool,

    /// Require PKCE for public clients.
    pub enforce_for_public_clients: bool,

    /// Accept the `plain` challenge method.
    pub allow_plain: bool,
}

/// Login/consent flow settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Login page the user agent is sent to with a `login_challenge`.
    pub login_url: String,

    /// Consent page the user agent is sent to with a `consent_challenge`.
    pub consent_url: String,

    /// How long a login/consent flow may stay open.
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,

    /// Name of the login CSRF cookie.
    pub login_csrf_cookie: String,

    /// Name of the consent CSRF cookie.
    pub consent_csrf_cookie: String,

    /// Name of the remembered authentication session cookie.
    pub session_cookie: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            login_url: "http://localhost:3000/login".to_string(),
            consent_url: "http://localhost:3000/consent".to_string(),
            lifetime: Duration::from_secs(30 * 60),
            login_csrf_cookie: "login_csrf".to_string(),
            consent_csrf_cookie: "consent_csrf".to_string(),
            session_cookie: "authentication_session".to_string(),
        }
    }
}

impl FlowConfig {
    /// Flow lifetime as a [`time::Duration`].
    #[must_use]
    pub fn lifetime(&self) -> time::Duration {
        to_time_duration(self.lifetime)
    }
}

pub(crate) fn to_time_duration(d: Duration) -> time::Duration {
    time::Duration::seconds(i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Configuration loading and validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("Failed to read configuration file {path}: {message}")]
    Io { path: String, message: String },
}

impl AuthConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML and any error of
    /// [`AuthConfig::validate`].
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise the
    /// errors of [`AuthConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the token secret is empty, and
    /// `ConfigError::InvalidValue` if:
    /// - The issuer, login or consent URL does not parse
    /// - A secret is shorter than 64 bytes
    /// - The token entropy is below 64 bytes
    /// - A lifetime is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.is_empty() {
            return Err(ConfigError::InvalidValue(
                "issuer cannot be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("issuer", &self.issuer),
            ("flow.login_url", &self.flow.login_url),
            ("flow.consent_url", &self.flow.consent_url),
        ] {
            url::Url::parse(value).map_err(|e| {
                ConfigError::InvalidValue(format!("{name} '{value}' is not a valid URL: {e}"))
            })?;
        }

        if self.tokens.secret.is_empty() {
            return Err(ConfigError::Missing("tokens.secret".to_string()));
        }
        if self.tokens.secret.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "tokens.secret must be at least {MIN_SECRET_BYTES} bytes long"
            )));
        }
        if self
            .tokens
            .rotated_secrets
            .iter()
            .any(|s| s.len() < MIN_SECRET_BYTES)
        {
            return Err(ConfigError::InvalidValue(format!(
                "tokens.rotated_secrets entries must be at least {MIN_SECRET_BYTES} bytes long"
            )));
        }
        if self.tokens.entropy < MIN_SECRET_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "tokens.entropy must be at least {MIN_SECRET_BYTES}"
            )));
        }

        for (name, value) in [
            ("oauth.authorization_code_lifetime", self.oauth.authorization_code_lifetime),
            ("oauth.access_token_lifetime", self.oauth.access_token_lifetime),
            ("oauth.refresh_token_lifetime", self.oauth.refresh_token_lifetime),
            ("oauth.id_token_lifetime", self.oauth.id_token_lifetime),
            ("flow.lifetime", self.flow.lifetime),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(format!("{name} must be > 0")));
            }
        }

        Ok(())
    }
}
