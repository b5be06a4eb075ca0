//! Client credentials grant (RFC 6749 §4.4).

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::handler::{HandlerOutcome, TokenEndpointHandler};
use super::{expires_in, validate_scope_and_audience};
use crate::AuthResult;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::storage::OAuth2Storage;
use crate::token::{TokenKind, TokenStrategy, log_signature};
use crate::types::{GrantType, TokenRequest, TokenResponse};

/// Issues access tokens to confidential clients acting on their own behalf.
pub struct ClientCredentialsHandler {
    config: Arc<AuthConfig>,
    strategy: Arc<dyn TokenStrategy>,
    storage: Arc<dyn OAuth2Storage>,
}

impl ClientCredentialsHandler {
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        strategy: Arc<dyn TokenStrategy>,
        storage: Arc<dyn OAuth2Storage>,
    ) -> Self {
        Self {
            config,
            strategy,
            storage,
        }
    }

    fn can_handle(tr: &TokenRequest) -> bool {
        tr.grant_types.exact(GrantType::ClientCredentials.as_str())
    }
}

#[async_trait]
impl TokenEndpointHandler for ClientCredentialsHandler {
    async fn handle_token_request(&self, tr: &mut TokenRequest) -> AuthResult<HandlerOutcome> {
        if !Self::can_handle(tr) {
            return Ok(HandlerOutcome::NotApplicable);
        }

        let client = &tr.request.client;
        if client.is_public() {
            return Err(AuthError::invalid_grant(
                "The OAuth 2.0 Client is marked as public and is thus not allowed to use authorization grant 'client_credentials'.",
            ));
        }
        if !client.is_grant_type_allowed(GrantType::ClientCredentials) {
            return Err(AuthError::unauthorized_client(
                "The OAuth 2.0 Client is not allowed to use authorization grant 'client_credentials'.",
            ));
        }
        validate_scope_and_audience(&self.config, &tr.request)?;

        // No end-user takes part; everything requested is granted.
        let scopes: Vec<String> = tr.request.requested_scope.iter().map(String::from).collect();
        let audience: Vec<String> = tr
            .request
            .requested_audience
            .iter()
            .map(String::from)
            .collect();
        for scope in scopes {
            tr.request.grant_scope(scope);
        }
        for aud in audience {
            tr.request.grant_audience(aud);
        }

        if tr.request.session.subject.is_empty() {
            tr.request.session.subject = tr.request.client.client_id.clone();
        }
        tr.request.session.set_expires_at(
            TokenKind::AccessToken,
            OffsetDateTime::now_utc() + self.config.oauth.lifetime(TokenKind::AccessToken),
        );
        tr.set_grant_type_handled(GrantType::ClientCredentials.as_str());

        tracing::debug!(
            client_id = %tr.request.client.client_id,
            scope = %tr.request.granted_scope,
            "Client credentials request accepted"
        );
        Ok(HandlerOutcome::Applied)
    }

    async fn handle_token_response(
        &self,
        tr: &mut TokenRequest,
        response: &mut TokenResponse,
    ) -> AuthResult<HandlerOutcome> {
        if !Self::can_handle(tr) {
            return Ok(HandlerOutcome::NotApplicable);
        }

        let access = self.strategy.generate(TokenKind::AccessToken, &tr.request)?;
        self.storage
            .create_access_token_session(&access.signature, &tr.request)
            .await?;

        response.set_access_token(
            access.token,
            expires_in(&self.config, &tr.request, TokenKind::AccessToken),
        );
        response.set_scope(&tr.request.granted_scope);

        tracing::debug!(
            client_id = %tr.request.client.client_id,
            request_id = %tr.request.id,
            signature = %log_signature(&access.signature),
            "Issued client credentials access token"
        );
        Ok(HandlerOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::{AccessTokenStorage, MemoryStore};
    use crate::token::HmacStrategy;
    use crate::types::{Arguments, Client, Request};

    fn backend() -> Client {
        Client::new("backend", "Backend")
            .with_secret_hash("$argon2id$v=19$m=19456,t=2,p=1$abc$def")
            .with_grant_types([GrantType::ClientCredentials])
            .with_scopes(["reports", "metrics"])
            .with_audience(["https://api.example.com"])
    }

    fn handler() -> (ClientCredentialsHandler, Arc<HmacStrategy>, MemoryStore) {
        let mut config = AuthConfig::default();
        config.tokens.secret = "c".repeat(64);
        let config = Arc::new(config);
        let strategy = Arc::new(HmacStrategy::new(Arc::clone(&config)).unwrap());
        let store = MemoryStore::new().with_client(backend());
        let handler =
            ClientCredentialsHandler::new(config, strategy.clone(), Arc::new(store.clone()));
        (handler, strategy, store)
    }

    fn token_request(client: Client, scope: &str) -> TokenRequest {
        let mut request = Request::new(client);
        request.requested_scope = Arguments::from_space_delimited(scope);
        TokenRequest::new(request, Arguments::from_space_delimited("client_credentials"))
    }

    #[tokio::test]
    async fn test_issues_access_token() {
        let (handler, strategy, store) = handler();
        let mut tr = token_request(backend(), "reports");
        tr.request.requested_audience = Arguments::from_space_delimited("https://api.example.com/v1");

        assert!(handler.handle_token_request(&mut tr).await.unwrap().is_applied());
        assert!(tr.request.granted_scope.has("reports"));
        assert!(tr.request.granted_audience.has("https://api.example.com/v1"));
        assert_eq!(tr.request.session.subject, "backend");

        let mut response = TokenResponse::default();
        handler
            .handle_token_response(&mut tr, &mut response)
            .await
            .unwrap();
        assert_eq!(response.token_type, "bearer");
        assert!(response.refresh_token.is_none());
        assert!(response.expires_in.unwrap() > 3500);

        let signature = strategy.signature(TokenKind::AccessToken, &response.access_token);
        assert!(store
            .get_access_token_session(&signature)
            .await
            .unwrap()
            .is_some_and(|s| s.active));
    }

    #[tokio::test]
    async fn test_public_client_rejected() {
        let (handler, _, _) = handler();
        let public = Client::new("spa", "SPA").with_grant_types([GrantType::ClientCredentials]);
        let mut tr = token_request(public, "");
        let err = handler.handle_token_request(&mut tr).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_undeclared_grant_and_scope() {
        let (handler, _, _) = handler();
        let mut tr = token_request(
            backend().with_grant_types([GrantType::RefreshToken]),
            "reports",
        );
        let err = handler.handle_token_request(&mut tr).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnauthorizedClient);

        let mut tr = token_request(backend(), "admin");
        let err = handler.handle_token_request(&mut tr).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScope);
    }

    #[tokio::test]
    async fn test_other_grant_not_applicable() {
        let (handler, _, _) = handler();
        let mut tr = token_request(backend(), "");
        tr.grant_types = Arguments::from_space_delimited("refresh_token");
        assert_eq!(
            handler.handle_token_request(&mut tr).await.unwrap(),
            HandlerOutcome::NotApplicable
        );
    }
}
