//! Token introspection (RFC 7662)
//!
//! Never reveal why a token is inactive: expired, revoked, unknown and
//! malformed tokens all produce `{"active": false}`.
//!
//! # References
//!
//! - [RFC 7662 - OAuth 2.0 Token Introspection](https://tools.ietf.org/html/rfc7662)

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::TokenKind;
use super::revocation::TokenTypeHint;
use crate::types::Request;

// =============================================================================
// Request Types
// =============================================================================

/// Token introspection request per RFC 7662.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionRequest {
    /// The token to introspect.
    pub token: String,

    /// Optional hint about the token type.
    #[serde(default)]
    pub token_type_hint: Option<TokenTypeHint>,
}

// =============================================================================
// Response Types
// =============================================================================

/// Token introspection response per RFC 7662.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IntrospectionResponse {
    /// Whether the token is currently active. The only required field.
    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// `access_token` or `refresh_token`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Request id shared by every token of the authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl IntrospectionResponse {
    /// Creates an inactive response.
    #[must_use]
    pub fn inactive() -> Self {
        Self {
            active: false,
            ..Default::default()
        }
    }

    /// Creates an active response with no metadata.
    #[must_use]
    pub fn active() -> Self {
        Self {
            active: true,
            ..Default::default()
        }
    }

    /// Builds an active response describing a stored request.
    #[must_use]
    pub fn from_request(
        kind: TokenKind,
        request: &Request,
        expires_at: OffsetDateTime,
        issuer: &str,
    ) -> Self {
        let session = &request.session;
        let mut response = Self::active()
            .with_client_id(&request.client.client_id)
            .with_token_type(kind.as_str())
            .with_exp(expires_at.unix_timestamp())
            .with_iat(request.requested_at.unix_timestamp())
            .with_nbf(request.requested_at.unix_timestamp())
            .with_iss(issuer)
            .with_jti(request.id.to_string());
        if !request.granted_scope.is_empty() {
            response = response.with_scope(request.granted_scope.join());
        }
        if !request.granted_audience.is_empty() {
            response = response.with_aud(request.granted_audience.as_slice().to_vec());
        }
        if !session.subject.is_empty() {
            response = response.with_sub(&session.subject);
        }
        if !session.username.is_empty() {
            response = response.with_username(&session.username);
        }
        response
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into());
        self
    }

    #[must_use]
    pub fn with_exp(mut self, exp: i64) -> Self {
        self.exp = Some(exp);
        self
    }

    #[must_use]
    pub fn with_iat(mut self, iat: i64) -> Self {
        self.iat = Some(iat);
        self
    }

    #[must_use]
    pub fn with_nbf(mut self, nbf: i64) -> Self {
        self.nbf = Some(nbf);
        self
    }

    #[must_use]
    pub fn with_sub(mut self, sub: impl Into<String>) -> Self {
        self.sub = Some(sub.into());
        self
    }

    #[must_use]
    pub fn with_aud(mut self, aud: Vec<String>) -> Self {
        self.aud = Some(aud);
        self
    }

    #[must_use]
    pub fn with_iss(mut self, iss: impl Into<String>) -> Self {
        self.iss = Some(iss.into());
        self
    }

    #[must_use]
    pub fn with_jti(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }
}
