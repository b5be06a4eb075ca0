//! Refresh token grant (RFC 6749 §6) with rotation.
//!
//! Every refresh revokes the presented refresh token and the access tokens
//! issued with it, then issues a new pair under the same request id.
//! Presenting a revoked refresh token revokes the whole family.

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::handler::{HandlerOutcome, TokenEndpointHandler};
use super::revocation::revoke_token_family;
use super::{expires_in, run_in_transaction};
use crate::AuthResult;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::storage::{NoopTransaction, OAuth2Storage, Transactional};
use crate::token::{TokenKind, TokenStrategy, log_signature};
use crate::types::{GrantType, TokenRequest, TokenResponse};

/// Exchanges refresh tokens for new token pairs.
pub struct RefreshTokenHandler {
    config: Arc<AuthConfig>,
    strategy: Arc<dyn TokenStrategy>,
    storage: Arc<dyn OAuth2Storage>,
    transactional: Arc<dyn Transactional>,
}

struct Rotated {
    access_token: String,
    refresh_token: String,
}

impl RefreshTokenHandler {
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        strategy: Arc<dyn TokenStrategy>,
        storage: Arc<dyn OAuth2Storage>,
    ) -> Self {
        let transactional = storage
            .transactional()
            .unwrap_or_else(|| Arc::new(NoopTransaction));
        Self {
            config,
            strategy,
            storage,
            transactional,
        }
    }

    fn can_handle(tr: &TokenRequest) -> bool {
        tr.grant_types.exact(GrantType::RefreshToken.as_str())
    }

    async fn rotate(&self, tr: &TokenRequest) -> AuthResult<Rotated> {
        // Re-check under the transaction so two concurrent refreshes cannot
        // both rotate the same token.
        let token = tr.refresh_token.as_deref().unwrap_or_default();
        let signature = self.strategy.signature(TokenKind::RefreshToken, token);
        let still_active = self
            .storage
            .get_refresh_token_session(&signature)
            .await?
            .is_some_and(|s| s.active);
        if !still_active {
            return Err(AuthError::invalid_grant(
                "The refresh token has already been used.",
            ));
        }

        self.storage.revoke_access_token(tr.request.id).await?;
        self.storage.revoke_refresh_token(tr.request.id).await?;

        let access = self.strategy.generate(TokenKind::AccessToken, &tr.request)?;
        let refresh = self.strategy.generate(TokenKind::RefreshToken, &tr.request)?;
        self.storage
            .create_access_token_session(&access.signature, &tr.request)
            .await?;
        self.storage
            .create_refresh_token_session(&refresh.signature, &tr.request)
            .await?;

        Ok(Rotated {
            access_token: access.token,
            refresh_token: refresh.token,
        })
    }
}

#[async_trait]
impl TokenEndpointHandler for RefreshTokenHandler {
    async fn handle_token_request(&self, tr: &mut TokenRequest) -> AuthResult<HandlerOutcome> {
        if !Self::can_handle(tr) {
            return Ok(HandlerOutcome::NotApplicable);
        }

        let client_id = tr.request.client.client_id.clone();
        if !tr.request.client.is_grant_type_allowed(GrantType::RefreshToken) {
            return Err(AuthError::unauthorized_client(
                "The OAuth 2.0 Client is not allowed to use authorization grant 'refresh_token'.",
            ));
        }

        let token = tr.refresh_token.clone().ok_or_else(|| {
            AuthError::invalid_request("The 'refresh_token' parameter is missing.")
        })?;
        let signature = self.strategy.signature(TokenKind::RefreshToken, &token);

        let Some(stored) = self.storage.get_refresh_token_session(&signature).await? else {
            return Err(AuthError::invalid_grant("The refresh token is unknown."));
        };

        if !stored.active {
            tracing::warn!(
                client_id = %client_id,
                request_id = %stored.request.id,
                signature = %log_signature(&signature),
                "Revoked refresh token reused, revoking token family"
            );
            let mut err = AuthError::invalid_grant("The refresh token has been revoked.");
            if let Some(failures) =
                revoke_token_family(self.storage.as_ref(), stored.request.id).await
            {
                err = err.with_debug(failures);
            }
            return Err(err);
        }

        self.strategy
            .validate(TokenKind::RefreshToken, &stored.request, &token)
            .map_err(|e| {
                AuthError::invalid_grant("The refresh token is invalid.").with_debug(e.to_string())
            })?;

        if stored.request.client.client_id != client_id {
            return Err(AuthError::invalid_grant(
                "The OAuth 2.0 Client ID from this request does not match the ID during the initial token issuance.",
            ));
        }

        let original = stored.request;
        if !original
            .granted_scope
            .has_one_of(&self.config.oauth.refresh_token_scopes)
        {
            return Err(AuthError::invalid_scope(format!(
                "The OAuth 2.0 Client was not granted any of the scopes '{}' and may thus not perform the 'refresh_token' authorization grant.",
                self.config.oauth.refresh_token_scopes.join(" ")
            )));
        }

        // A refresh may narrow the original grant, never widen it.
        let granted_scope = if tr.request.requested_scope.is_empty() {
            original.granted_scope.clone()
        } else {
            for scope in tr.request.requested_scope.iter() {
                if !original.granted_scope.has(scope) {
                    return Err(AuthError::invalid_scope(format!(
                        "The requested scope '{scope}' was not originally granted by the resource owner."
                    )));
                }
            }
            tr.request.requested_scope.clone()
        };

        let now = OffsetDateTime::now_utc();
        tr.request.id = original.id;
        tr.request.requested_at = original.requested_at;
        tr.request.granted_scope = granted_scope;
        tr.request.requested_audience = original.requested_audience;
        tr.request.granted_audience = original.granted_audience;
        tr.request.session = original.session;
        tr.request.session.set_expires_at(
            TokenKind::AccessToken,
            now + self.config.oauth.lifetime(TokenKind::AccessToken),
        );
        tr.request.session.set_expires_at(
            TokenKind::RefreshToken,
            now + self.config.oauth.lifetime(TokenKind::RefreshToken),
        );
        tr.set_grant_type_handled(GrantType::RefreshToken.as_str());

        tracing::debug!(
            client_id = %client_id,
            request_id = %tr.request.id,
            "Refresh token request accepted"
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

        let rotated = run_in_transaction(self.transactional.as_ref(), self.rotate(tr)).await?;

        response.set_access_token(
            rotated.access_token,
            expires_in(&self.config, &tr.request, TokenKind::AccessToken),
        );
        response.refresh_token = Some(rotated.refresh_token);
        response.set_scope(&tr.request.granted_scope);

        tracing::debug!(
            client_id = %tr.request.client.client_id,
            request_id = %tr.request.id,
            "Rotated refresh token"
        );
        Ok(HandlerOutcome::Applied)
    }
}
