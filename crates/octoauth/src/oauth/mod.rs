//! OAuth 2.0 / OpenID Connect protocol engine.
//!
//! Requests flow through an ordered chain of handlers:
//!
//! - [`authorize_code`] - Authorization code grant with replay detection
//! - [`openid`] - ID tokens for the authorization code flow
//! - [`pkce`] - Proof Key for Code Exchange (RFC 7636)
//! - [`client_credentials`] - Client credentials grant
//! - [`refresh_token`] - Refresh token grant with rotation
//! - [`introspection`] - Token introspection (RFC 7662)
//! - [`revocation`] - Cascading revocation (RFC 7009)
//!
//! [`OAuth2Provider`] runs the chain and is what a transport layer talks to.
//! [`compose`] assembles a provider from configuration and storage.
//!
//! # Example
//!
//! ```ignore
//! use octoauth::oauth::compose;
//!
//! let provider = compose(config, storage, key_provider)?;
//! let mut ar = provider.new_authorize_request(&params).await?;
//! // ...authenticate the user and collect consent...
//! let response = provider.new_authorize_response(&mut ar, session).await?;
//! ```

pub mod authorize_code;
pub mod client_auth;
pub mod client_credentials;
pub mod compose;
pub mod handler;
pub mod introspection;
pub mod openid;
pub mod pkce;
pub mod provider;
pub mod refresh_token;
pub mod revocation;

use time::OffsetDateTime;
use url::Url;

use crate::AuthResult;
use crate::config::AuthConfig;
use crate::token::TokenKind;
use crate::types::Request;

pub use authorize_code::AuthorizeCodeHandler;
pub use client_auth::{
    AuthenticatedClient, TokenEndpointAuthMethod, authenticate_client, parse_basic_auth,
};
pub use client_credentials::ClientCredentialsHandler;
pub use compose::{ProviderHandle, compose};
pub use handler::{
    AuthorizeEndpointHandler, HandlerOutcome, Introspection, TokenEndpointHandler,
    TokenIntrospector,
};
pub use introspection::CoreIntrospector;
pub use openid::{IdTokenStrategy, OpenIdConnectHandler};
pub use pkce::{PkceChallenge, PkceChallengeMethod, PkceError, PkceHandler, PkceVerifier};
pub use provider::{AuthorizeError, OAuth2Provider};
pub use refresh_token::RefreshTokenHandler;
pub use revocation::{TokenRevocationHandler, revoke_token_family};

pub(crate) use crate::storage::run_in_transaction;

/// Checks the requested scope and audience against the client's
/// registration.
pub(crate) fn validate_scope_and_audience(config: &AuthConfig, request: &Request) -> AuthResult<()> {
    config
        .oauth
        .scope_strategy
        .validate(&request.client.scopes, request.requested_scope.iter())?;
    config.oauth.audience_strategy.validate(
        &request.client.audience,
        request.requested_audience.as_slice(),
    )
}

/// Seconds until the token of `kind` expires, from the session's recorded
/// expiry or the configured lifetime.
pub(crate) fn expires_in(config: &AuthConfig, request: &Request, kind: TokenKind) -> i64 {
    match request.session.expires_at(kind) {
        Some(at) => (at - OffsetDateTime::now_utc()).whole_seconds().max(0),
        None => config.oauth.lifetime(kind).whole_seconds(),
    }
}

/// `https`, or `http` on a loopback host. Other schemes are custom URI
/// schemes of native apps and pass.
pub(crate) fn is_redirect_uri_secure(uri: &Url) -> bool {
    match uri.scheme() {
        "http" => uri.host_str().is_some_and(|host| {
            host == "localhost"
                || host.ends_with(".localhost")
                || host == "127.0.0.1"
                || host == "[::1]"
        }),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_uri_security() {
        let secure = [
            "https://app.example.com/cb",
            "http://localhost:8080/cb",
            "http://app.localhost/cb",
            "http://127.0.0.1/cb",
            "http://[::1]:3000/cb",
            "com.example.app:/oauth2redirect",
        ];
        for uri in secure {
            assert!(is_redirect_uri_secure(&Url::parse(uri).unwrap()), "{uri}");
        }
        for uri in ["http://app.example.com/cb", "http://localhost.evil.com/cb"] {
            assert!(!is_redirect_uri_secure(&Url::parse(uri).unwrap()), "{uri}");
        }
    }
}
