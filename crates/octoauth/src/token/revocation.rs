//! Token revocation (RFC 7009)
//!
//! Revocation cascades: revoking either token of an authorization revokes
//! every access and refresh token sharing its request id. Unknown tokens are
//! accepted silently so the endpoint never reveals whether a token exists.
//!
//! # References
//!
//! - [RFC 7009 - OAuth 2.0 Token Revocation](https://tools.ietf.org/html/rfc7009)

use serde::{Deserialize, Serialize};

use super::TokenKind;

/// Token revocation request per RFC 7009.
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationRequest {
    /// The token to revoke.
    pub token: String,

    /// Optional hint about the token type.
    #[serde(default)]
    pub token_type_hint: Option<TokenTypeHint>,
}

/// Token type hint for introspection and revocation requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTypeHint {
    /// The token is an access token.
    #[default]
    AccessToken,
    /// The token is a refresh token.
    RefreshToken,
}

impl TokenTypeHint {
    /// Returns the token type hint as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }

    /// Token kinds to try, hinted kind first.
    #[must_use]
    pub fn lookup_order(self) -> [TokenKind; 2] {
        match self {
            Self::AccessToken => [TokenKind::AccessToken, TokenKind::RefreshToken],
            Self::RefreshToken => [TokenKind::RefreshToken, TokenKind::AccessToken],
        }
    }
}

impl std::fmt::Display for TokenTypeHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
