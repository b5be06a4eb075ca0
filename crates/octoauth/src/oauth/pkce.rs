//! PKCE (Proof Key for Code Exchange), RFC 7636.
//!
//! `S256` is always accepted; `plain` only when `pkce.allow_plain` is set.
//! The challenge is stored next to the authorization code, keyed by the
//! code's signature, and consumed only by a token request that presents the
//! matching verifier. The code session also records the challenge, so a code
//! whose PKCE session is gone cannot be redeemed without one.
//!
//! # Example
//!
//! ```
//! use octoauth::oauth::{PkceChallenge, PkceChallengeMethod, PkceVerifier};
//!
//! let verifier = PkceVerifier::generate();
//! let challenge = PkceChallenge::from_verifier(&verifier, PkceChallengeMethod::S256);
//!
//! let stored = PkceChallenge::new(challenge.as_str().to_string(), PkceChallengeMethod::S256).unwrap();
//! assert!(stored.verify(&verifier).is_ok());
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

use super::handler::{AuthorizeEndpointHandler, HandlerOutcome, TokenEndpointHandler};
use crate::AuthResult;
use crate::config::PkceConfig;
use crate::error::AuthError;
use crate::secret::constant_time_eq;
use crate::storage::OAuth2Storage;
use crate::token::{TokenKind, TokenStrategy, log_signature};
use crate::types::{AuthorizeRequest, AuthorizeResponse, GrantType, TokenRequest, TokenResponse};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during PKCE operations.
#[derive(Debug, thiserror::Error)]
pub enum PkceError {
    /// Verifier length is outside the valid range (43-128 characters).
    #[error("Invalid verifier length: must be 43-128 characters, got {0}")]
    InvalidVerifierLength(usize),

    /// Verifier contains invalid characters.
    #[error("Invalid verifier characters: must be unreserved URI characters ([A-Za-z0-9-._~])")]
    InvalidVerifierCharacters,

    /// Challenge format is invalid for its method.
    #[error("Invalid challenge format for method {0}")]
    InvalidChallengeFormat(PkceChallengeMethod),

    /// Unknown challenge method.
    #[error("Unsupported challenge method: {0}")]
    UnsupportedMethod(String),

    /// The verifier does not match the challenge.
    #[error("PKCE verification failed: verifier does not match challenge")]
    VerificationFailed,
}

impl PkceError {
    /// Returns `true` if this is a verifier validation error.
    #[must_use]
    pub fn is_verifier_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidVerifierLength(_) | Self::InvalidVerifierCharacters
        )
    }

    /// Returns `true` if this is a challenge validation error.
    #[must_use]
    pub fn is_challenge_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidChallengeFormat(_) | Self::UnsupportedMethod(_)
        )
    }

    /// Get the OAuth 2.0 error code for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidChallengeFormat(_) | Self::UnsupportedMethod(_) => "invalid_request",
            Self::InvalidVerifierLength(_)
            | Self::InvalidVerifierCharacters
            | Self::VerificationFailed => "invalid_grant",
        }
    }
}

impl From<PkceError> for AuthError {
    fn from(err: PkceError) -> Self {
        let hint = err.to_string();
        if err.oauth_error_code() == "invalid_request" {
            AuthError::invalid_request(hint)
        } else {
            AuthError::invalid_grant(hint)
        }
    }
}

// =============================================================================
// PKCE Challenge Method
// =============================================================================

/// PKCE challenge method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PkceChallengeMethod {
    /// `BASE64URL(SHA256(verifier))`.
    #[default]
    S256,
    /// The challenge is the verifier.
    Plain,
}

impl PkceChallengeMethod {
    /// Parses the `code_challenge_method` parameter. An absent method means
    /// `plain` (RFC 7636 §4.3).
    ///
    /// # Errors
    ///
    /// Returns `PkceError::UnsupportedMethod` for unknown methods.
    pub fn parse(method: Option<&str>) -> Result<Self, PkceError> {
        match method {
            Some("S256") => Ok(Self::S256),
            Some("plain") | None | Some("") => Ok(Self::Plain),
            Some(other) => Err(PkceError::UnsupportedMethod(other.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

impl std::fmt::Display for PkceChallengeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// PKCE Verifier
// =============================================================================

/// PKCE code verifier: 43-128 characters from
/// `[A-Z] / [a-z] / [0-9] / "-" / "." / "_" / "~"`.
#[derive(Debug, Clone)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// # Errors
    ///
    /// Returns an error if the length or the character set is wrong.
    pub fn new(verifier: String) -> Result<Self, PkceError> {
        check_unreserved(&verifier)?;
        Ok(Self(verifier))
    }

    /// Generates 32 random bytes encoded as base64url (43 characters).
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; 32] = rand::thread_rng().r#gen();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_unreserved(value: &str) -> Result<(), PkceError> {
    let len = value.len();
    if !(43..=128).contains(&len) {
        return Err(PkceError::InvalidVerifierLength(len));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
    {
        return Err(PkceError::InvalidVerifierCharacters);
    }
    Ok(())
}

// =============================================================================
// PKCE Challenge
// =============================================================================

/// A code challenge and the method it was derived with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge {
    value: String,
    method: PkceChallengeMethod,
}

impl PkceChallenge {
    /// Derives the challenge of `verifier`.
    #[must_use]
    pub fn from_verifier(verifier: &PkceVerifier, method: PkceChallengeMethod) -> Self {
        let value = match method {
            PkceChallengeMethod::S256 => s256(verifier.as_str()),
            PkceChallengeMethod::Plain => verifier.as_str().to_string(),
        };
        Self { value, method }
    }

    /// Wraps a challenge received from a client.
    ///
    /// # Errors
    ///
    /// Returns `PkceError::InvalidChallengeFormat` if an `S256` challenge is
    /// not the base64url encoding of 32 bytes, or a `plain` challenge is not
    /// a well-formed verifier.
    pub fn new(value: String, method: PkceChallengeMethod) -> Result<Self, PkceError> {
        let valid = match method {
            PkceChallengeMethod::S256 => URL_SAFE_NO_PAD
                .decode(&value)
                .is_ok_and(|digest| digest.len() == 32),
            PkceChallengeMethod::Plain => check_unreserved(&value).is_ok(),
        };
        if !valid {
            return Err(PkceError::InvalidChallengeFormat(method));
        }
        Ok(Self { value, method })
    }

    /// # Errors
    ///
    /// Returns `PkceError::VerificationFailed` if the verifier doesn't match.
    pub fn verify(&self, verifier: &PkceVerifier) -> Result<(), PkceError> {
        let expected = Self::from_verifier(verifier, self.method);
        if constant_time_eq(&self.value, &expected.value) {
            Ok(())
        } else {
            Err(PkceError::VerificationFailed)
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn method(&self) -> PkceChallengeMethod {
        self.method
    }
}

fn s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

// =============================================================================
// Handler
// =============================================================================

/// Binds authorization codes to a code challenge.
pub struct PkceHandler {
    config: PkceConfig,
    strategy: Arc<dyn TokenStrategy>,
    storage: Arc<dyn OAuth2Storage>,
}

impl PkceHandler {
    #[must_use]
    pub fn new(
        config: PkceConfig,
        strategy: Arc<dyn TokenStrategy>,
        storage: Arc<dyn OAuth2Storage>,
    ) -> Self {
        Self {
            config,
            strategy,
            storage,
        }
    }

    fn is_enforced_for(&self, public_client: bool) -> bool {
        self.config.enforce || (self.config.enforce_for_public_clients && public_client)
    }

    fn parse_challenge(&self, value: &str, method: Option<&str>) -> AuthResult<PkceChallenge> {
        let method = PkceChallengeMethod::parse(method)?;
        if method == PkceChallengeMethod::Plain && !self.config.allow_plain {
            return Err(AuthError::invalid_request(
                "Clients must use code_challenge_method=S256, plain is not allowed.",
            ));
        }
        Ok(PkceChallenge::new(value.to_string(), method)?)
    }

    /// The code session records the challenge sent at authorize time, so a
    /// lost PKCE session cannot downgrade the exchange.
    async fn code_had_challenge(&self, signature: &str) -> AuthResult<bool> {
        Ok(self
            .storage
            .get_authorize_code_session(signature)
            .await?
            .is_some_and(|stored| {
                stored
                    .request
                    .form_value("code_challenge")
                    .is_some_and(|c| !c.is_empty())
            }))
    }
}

#[async_trait]
impl AuthorizeEndpointHandler for PkceHandler {
    async fn handle_authorize_request(
        &self,
        ar: &mut AuthorizeRequest,
    ) -> AuthResult<HandlerOutcome> {
        if !ar.response_types.has("code") {
            return Ok(HandlerOutcome::NotApplicable);
        }

        let Some(challenge) = ar.code_challenge.as_deref().filter(|c| !c.is_empty()) else {
            if self.is_enforced_for(ar.request.client.is_public()) {
                return Err(AuthError::invalid_request(
                    "Clients must include a code_challenge when performing the authorize code flow.",
                ));
            }
            return Ok(HandlerOutcome::NotApplicable);
        };

        self.parse_challenge(challenge, ar.code_challenge_method.as_deref())?;
        Ok(HandlerOutcome::Applied)
    }

    async fn handle_authorize_response(
        &self,
        ar: &mut AuthorizeRequest,
        response: &mut AuthorizeResponse,
    ) -> AuthResult<HandlerOutcome> {
        let Some(challenge) = ar.code_challenge.clone().filter(|c| !c.is_empty()) else {
            return Ok(HandlerOutcome::NotApplicable);
        };
        let Some(code) = response.code() else {
            return Ok(HandlerOutcome::NotApplicable);
        };

        let signature = self.strategy.signature(TokenKind::AuthorizeCode, code);
        let mut request = ar.request.sanitized();
        request.form.insert("code_challenge".to_string(), challenge);
        if let Some(method) = &ar.code_challenge_method {
            request
                .form
                .insert("code_challenge_method".to_string(), method.clone());
        }
        self.storage.create_pkce_session(&signature, &request).await?;

        tracing::debug!(
            request_id = %ar.request.id,
            signature = %log_signature(&signature),
            "Stored PKCE challenge"
        );
        Ok(HandlerOutcome::Applied)
    }
}

#[async_trait]
impl TokenEndpointHandler for PkceHandler {
    async fn handle_token_request(&self, tr: &mut TokenRequest) -> AuthResult<HandlerOutcome> {
        if !tr.grant_types.exact(GrantType::AuthorizationCode.as_str()) {
            return Ok(HandlerOutcome::NotApplicable);
        }
        let Some(code) = tr.code.as_deref() else {
            return Ok(HandlerOutcome::NotApplicable);
        };

        let signature = self.strategy.signature(TokenKind::AuthorizeCode, code);
        let verifier = tr.code_verifier.as_deref().filter(|v| !v.is_empty());

        let Some(stored) = self.storage.get_pkce_session(&signature).await? else {
            if self.code_had_challenge(&signature).await? {
                tracing::warn!(
                    client_id = %tr.request.client.client_id,
                    signature = %log_signature(&signature),
                    "PKCE session missing for a code issued with a challenge"
                );
                return Err(AuthError::invalid_grant(
                    "The authorization code was issued with a code_challenge that can no longer be verified.",
                ));
            }
            if self.is_enforced_for(tr.request.client.is_public()) {
                return Err(AuthError::invalid_request(
                    "Clients must include a code_challenge when performing the authorize code flow.",
                ));
            }
            if verifier.is_some() {
                return Err(AuthError::invalid_grant(
                    "The code_verifier was provided but the authorize request had no code_challenge.",
                ));
            }
            return Ok(HandlerOutcome::NotApplicable);
        };

        let verifier = verifier.ok_or_else(|| {
            AuthError::invalid_grant("The PKCE code verifier must be provided.")
        })?;
        let challenge = self.parse_challenge(
            stored.form_value("code_challenge").unwrap_or_default(),
            stored.form_value("code_challenge_method"),
        )?;
        let verifier = PkceVerifier::new(verifier.to_string())?;
        challenge.verify(&verifier).map_err(|e| {
            tracing::debug!(
                client_id = %tr.request.client.client_id,
                method = %challenge.method(),
                "PKCE verification failed"
            );
            AuthError::from(e)
        })?;

        // Only a matching verifier consumes the challenge.
        self.storage.delete_pkce_session(&signature).await?;
        Ok(HandlerOutcome::Applied)
    }

    async fn handle_token_response(
        &self,
        _tr: &mut TokenRequest,
        _response: &mut TokenResponse,
    ) -> AuthResult<HandlerOutcome> {
        Ok(HandlerOutcome::NotApplicable)
    }
}

// =============================================================================
// Tests
// =============================================================================
