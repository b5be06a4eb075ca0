//! Token generation and validation.
//!
//! This module provides:
//!
//! - The [`TokenStrategy`] contract shared by opaque and signed tokens
//! - Opaque HMAC tokens ([`HmacStrategy`])
//! - JWT access tokens and ID tokens ([`JwtStrategy`], [`JwtService`])
//! - Token introspection (RFC 7662) and revocation (RFC 7009) payloads

pub mod introspection;
pub mod jwt;
pub mod opaque;
pub mod revocation;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Request;
use crate::AuthResult;

pub use introspection::{IntrospectionRequest, IntrospectionResponse};
pub use jwt::{
    AccessTokenClaims, IdTokenClaims, Jwk, Jwks, JwtError, JwtService, JwtStrategy, KeyProvider,
    SigningAlgorithm, SigningKeyPair, StaticKeyProvider,
};
pub use opaque::HmacStrategy;
pub use revocation::{RevocationRequest, TokenTypeHint};

/// The kinds of tokens the provider issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    AuthorizeCode,
    AccessToken,
    RefreshToken,
    IdToken,
}

impl TokenKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizeCode => "authorize_code",
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::IdToken => "id_token",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A freshly generated token and its storage lookup signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    pub token: String,
    pub signature: String,
}

/// Generates and validates authorization codes, access tokens and refresh
/// tokens.
///
/// Storage never sees token values, only the signature derived by
/// [`TokenStrategy::signature`].
pub trait TokenStrategy: Send + Sync {
    /// Derives the storage lookup signature of a token. Returns an empty
    /// string for tokens that are not well formed.
    fn signature(&self, kind: TokenKind, token: &str) -> String;

    /// Generates a token bound to `request`.
    ///
    /// # Errors
    ///
    /// Returns `server_error` if the token cannot be produced.
    fn generate(&self, kind: TokenKind, request: &Request) -> AuthResult<GeneratedToken>;

    /// Validates a token against the request it was issued for.
    ///
    /// # Errors
    ///
    /// - `token_expired` if the token lifetime has passed
    /// - `invalid_token` if the token is malformed
    /// - `token_signature_mismatch` if the signature does not verify
    fn validate(&self, kind: TokenKind, request: &Request, token: &str) -> AuthResult<()>;
}

/// Shortens a signature for log output.
pub(crate) fn log_signature(signature: &str) -> &str {
    signature.get(..8).unwrap_or(signature)
}
