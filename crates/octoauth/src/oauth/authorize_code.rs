//! Authorization code grant (RFC 6749 §4.1).
//!
//! A consumed code stays in storage with `active == false`. Presenting it
//! again revokes every token issued with it and fails with
//! `invalid_grant`.

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::handler::{AuthorizeEndpointHandler, HandlerOutcome, TokenEndpointHandler};
use super::revocation::revoke_token_family;
use super::{expires_in, is_redirect_uri_secure, run_in_transaction, validate_scope_and_audience};
use crate::AuthResult;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::storage::{NoopTransaction, OAuth2Storage, Transactional};
use crate::token::{TokenKind, TokenStrategy, log_signature};
use crate::types::{AuthorizeRequest, AuthorizeResponse, GrantType, TokenRequest, TokenResponse};

const CODE: &str = "code";

/// Issues authorization codes and exchanges them for tokens.
pub struct AuthorizeCodeHandler {
    config: Arc<AuthConfig>,
    strategy: Arc<dyn TokenStrategy>,
    storage: Arc<dyn OAuth2Storage>,
    transactional: Arc<dyn Transactional>,
}

impl AuthorizeCodeHandler {
    /// Creates the handler. The transactional capability of `storage` is
    /// resolved here once.
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

    fn can_handle_token_request(tr: &TokenRequest) -> bool {
        tr.grant_types.exact(GrantType::AuthorizationCode.as_str())
    }

    async fn issue_tokens(&self, tr: &TokenRequest, code_signature: &str) -> AuthResult<Issued> {
        // Re-check under the transaction so two concurrent exchanges cannot
        // both redeem the code.
        let still_active = self
            .storage
            .get_authorize_code_session(code_signature)
            .await?
            .is_some_and(|s| s.active);
        if !still_active {
            return Err(AuthError::invalid_grant(
                "The authorization code has already been used.",
            ));
        }
        self.storage
            .invalidate_authorize_code_session(code_signature)
            .await?;

        let access = self.strategy.generate(TokenKind::AccessToken, &tr.request)?;
        self.storage
            .create_access_token_session(&access.signature, &tr.request)
            .await?;

        let refresh = if tr
            .request
            .granted_scope
            .has_one_of(&self.config.oauth.refresh_token_scopes)
        {
            let refresh = self.strategy.generate(TokenKind::RefreshToken, &tr.request)?;
            self.storage
                .create_refresh_token_session(&refresh.signature, &tr.request)
                .await?;
            Some(refresh.token)
        } else {
            None
        };

        Ok(Issued {
            access_token: access.token,
            refresh_token: refresh,
        })
    }
}

struct Issued {
    access_token: String,
    refresh_token: Option<String>,
}

#[async_trait]
impl AuthorizeEndpointHandler for AuthorizeCodeHandler {
    async fn handle_authorize_request(
        &self,
        ar: &mut AuthorizeRequest,
    ) -> AuthResult<HandlerOutcome> {
        if !ar.response_types.exact(CODE) {
            return Ok(HandlerOutcome::NotApplicable);
        }

        let client = &ar.request.client;
        if !client.is_response_type_allowed(&[CODE]) {
            return Err(AuthError::unsupported_response_type(
                "The client is not allowed to request response_type 'code'.",
            ));
        }
        if !client.is_response_mode_allowed(ar.response_mode) {
            return Err(AuthError::unsupported_response_mode(format!(
                "The client is not allowed to request response_mode '{}'.",
                ar.response_mode.as_str()
            )));
        }
        validate_scope_and_audience(&self.config, &ar.request)?;

        tracing::debug!(
            client_id = %client.client_id,
            request_id = %ar.request.id,
            "Authorization code request accepted"
        );
        Ok(HandlerOutcome::Applied)
    }

    async fn handle_authorize_response(
        &self,
        ar: &mut AuthorizeRequest,
        response: &mut AuthorizeResponse,
    ) -> AuthResult<HandlerOutcome> {
        if !ar.response_types.exact(CODE) {
            return Ok(HandlerOutcome::NotApplicable);
        }

        if !is_redirect_uri_secure(&ar.redirect_uri) {
            return Err(AuthError::invalid_request(
                "Redirect URL is using an insecure protocol, http is only allowed for hosts with suffix 'localhost'.",
            ));
        }

        let expires_at = OffsetDateTime::now_utc()
            + self.config.oauth.lifetime(TokenKind::AuthorizeCode);
        ar.request
            .session
            .set_expires_at(TokenKind::AuthorizeCode, expires_at);

        let code = self.strategy.generate(TokenKind::AuthorizeCode, &ar.request)?;
        let mut stored = ar.request.sanitized();
        if let Some(challenge) = ar.code_challenge.as_ref().filter(|c| !c.is_empty()) {
            stored
                .form
                .insert("code_challenge".to_string(), challenge.clone());
        }
        self.storage
            .create_authorize_code_session(&code.signature, &stored)
            .await?;

        response.add_parameter("code", code.token);
        response.add_parameter("state", ar.state.clone());
        response.add_parameter("scope", ar.request.granted_scope.join());
        ar.set_response_type_handled(CODE);

        tracing::debug!(
            client_id = %ar.request.client.client_id,
            request_id = %ar.request.id,
            signature = %log_signature(&code.signature),
            "Issued authorization code"
        );
        Ok(HandlerOutcome::Applied)
    }
}

#[async_trait]
impl TokenEndpointHandler for AuthorizeCodeHandler {
    async fn handle_token_request(&self, tr: &mut TokenRequest) -> AuthResult<HandlerOutcome> {
        if !Self::can_handle_token_request(tr) {
            return Ok(HandlerOutcome::NotApplicable);
        }

        let client_id = tr.request.client.client_id.clone();
        if !tr
            .request
            .client
            .is_grant_type_allowed(GrantType::AuthorizationCode)
        {
            return Err(AuthError::unauthorized_client(
                "The OAuth 2.0 Client is not allowed to use authorization grant 'authorization_code'.",
            ));
        }

        let code = tr
            .code
            .clone()
            .ok_or_else(|| AuthError::invalid_request("The 'code' parameter is missing."))?;
        let signature = self.strategy.signature(TokenKind::AuthorizeCode, &code);

        let Some(stored) = self.storage.get_authorize_code_session(&signature).await? else {
            return Err(AuthError::invalid_grant(
                "The authorization code is unknown.",
            ));
        };

        if !stored.active {
            tracing::warn!(
                client_id = %client_id,
                request_id = %stored.request.id,
                signature = %log_signature(&signature),
                "Authorization code replayed, revoking issued tokens"
            );
            let mut err = AuthError::invalid_grant(
                "The authorization code has already been used.",
            );
            if let Some(failures) = revoke_token_family(self.storage.as_ref(), stored.request.id).await
            {
                err = err
                    .with_hint(format!(
                        "The authorization code has already been used. Additionally, revoking the tokens issued with it failed: {failures}"
                    ))
                    .with_debug(failures);
            }
            return Err(err);
        }

        self.strategy
            .validate(TokenKind::AuthorizeCode, &stored.request, &code)
            .map_err(|e| {
                AuthError::invalid_grant("The authorization code is invalid.")
                    .with_debug(e.to_string())
            })?;

        if stored.request.client.client_id != client_id {
            return Err(AuthError::invalid_grant(
                "The OAuth 2.0 Client ID from this request does not match the one from the authorize request.",
            ));
        }

        let original_redirect = stored.request.form_value("redirect_uri").map(str::to_string);
        if let Some(original) = original_redirect {
            if tr.redirect_uri.as_deref() != Some(original.as_str()) {
                return Err(AuthError::invalid_grant(
                    "The 'redirect_uri' from this request does not match the one from the authorize request.",
                ));
            }
        }

        // The token response reflects what was granted at authorize time.
        let now = OffsetDateTime::now_utc();
        let stored_request = stored.request;
        tr.request.id = stored_request.id;
        tr.request.requested_at = stored_request.requested_at;
        tr.request.requested_scope = stored_request.requested_scope;
        tr.request.granted_scope = stored_request.granted_scope;
        tr.request.requested_audience = stored_request.requested_audience;
        tr.request.granted_audience = stored_request.granted_audience;
        tr.request.session = stored_request.session;
        tr.request.session.set_expires_at(
            TokenKind::AccessToken,
            now + self.config.oauth.lifetime(TokenKind::AccessToken),
        );
        tr.request.session.set_expires_at(
            TokenKind::RefreshToken,
            now + self.config.oauth.lifetime(TokenKind::RefreshToken),
        );
        tr.set_grant_type_handled(GrantType::AuthorizationCode.as_str());

        tracing::debug!(
            client_id = %client_id,
            request_id = %tr.request.id,
            "Authorization code exchange accepted"
        );
        Ok(HandlerOutcome::Applied)
    }

    async fn handle_token_response(
        &self,
        tr: &mut TokenRequest,
        response: &mut TokenResponse,
    ) -> AuthResult<HandlerOutcome> {
        if !Self::can_handle_token_request(tr) {
            return Ok(HandlerOutcome::NotApplicable);
        }

        let code = tr
            .code
            .clone()
            .ok_or_else(|| AuthError::invalid_request("The 'code' parameter is missing."))?;
        let signature = self.strategy.signature(TokenKind::AuthorizeCode, &code);

        let issued =
            run_in_transaction(self.transactional.as_ref(), self.issue_tokens(tr, &signature))
                .await?;

        response.set_access_token(
            issued.access_token,
            expires_in(&self.config, &tr.request, TokenKind::AccessToken),
        );
        response.refresh_token = issued.refresh_token;
        response.set_scope(&tr.request.granted_scope);

        tracing::debug!(
            client_id = %tr.request.client.client_id,
            request_id = %tr.request.id,
            refresh = response.refresh_token.is_some(),
            "Exchanged authorization code for tokens"
        );
        Ok(HandlerOutcome::Applied)
    }
}
