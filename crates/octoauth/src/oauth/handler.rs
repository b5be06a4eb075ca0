//! Handler chain contracts.
//!
//! Every handler is asked whether a request belongs to it. A handler that
//! does not recognize the request returns [`HandlerOutcome::NotApplicable`]
//! and the provider moves on; an `Err` aborts the chain.

use async_trait::async_trait;

use crate::AuthResult;
use crate::token::{TokenKind, TokenTypeHint};
use crate::types::{AuthorizeRequest, AuthorizeResponse, Request, TokenRequest, TokenResponse};

/// Result of asking a handler to process a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler recognized and processed the request.
    Applied,
    /// The request is not for this handler.
    NotApplicable,
}

impl HandlerOutcome {
    #[must_use]
    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }

    /// `Applied` if either outcome is.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        if self.is_applied() || other.is_applied() {
            Self::Applied
        } else {
            Self::NotApplicable
        }
    }
}

/// Participates in the authorization endpoint.
#[async_trait]
pub trait AuthorizeEndpointHandler: Send + Sync {
    /// Validates an incoming authorize request.
    async fn handle_authorize_request(&self, ar: &mut AuthorizeRequest)
        -> AuthResult<HandlerOutcome>;

    /// Builds the part of the authorize response this handler owns. Runs
    /// after the user authenticated and consented.
    async fn handle_authorize_response(
        &self,
        ar: &mut AuthorizeRequest,
        response: &mut AuthorizeResponse,
    ) -> AuthResult<HandlerOutcome>;
}

/// Participates in the token endpoint.
#[async_trait]
pub trait TokenEndpointHandler: Send + Sync {
    /// Validates an incoming token request.
    async fn handle_token_request(&self, tr: &mut TokenRequest) -> AuthResult<HandlerOutcome>;

    /// Issues the tokens this handler owns.
    async fn handle_token_response(
        &self,
        tr: &mut TokenRequest,
        response: &mut TokenResponse,
    ) -> AuthResult<HandlerOutcome>;
}

/// Outcome of an introspector.
#[derive(Debug, Clone)]
pub enum Introspection {
    /// The token is known, valid and active.
    Active(TokenKind, Box<Request>),
    /// The introspector does not know the token.
    NotApplicable,
}

/// Recognizes tokens at the introspection endpoint.
#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the token is recognized but unusable (expired,
    /// revoked or tampered with).
    async fn introspect_token(&self, token: &str, hint: TokenTypeHint)
        -> AuthResult<Introspection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_or() {
        use HandlerOutcome::{Applied, NotApplicable};
        assert_eq!(NotApplicable.or(NotApplicable), NotApplicable);
        assert_eq!(NotApplicable.or(Applied), Applied);
        assert_eq!(Applied.or(NotApplicable), Applied);
        assert!(Applied.is_applied());
    }
}
