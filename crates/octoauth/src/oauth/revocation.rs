//! Token revocation (RFC 7009).
//!
//! Access and refresh tokens issued for one authorization share a request
//! id; revoking any of them revokes all of them.

use std::sync::Arc;

use uuid::Uuid;

use crate::AuthResult;
use crate::error::AuthError;
use crate::storage::{OAuth2Storage, StoredSession, TokenRevocationStorage};
use crate::token::{TokenKind, TokenStrategy, TokenTypeHint, log_signature};
use crate::types::Client;

/// Revokes every access and refresh token issued under `request_id`.
///
/// Both revocations are attempted even when the first fails. Returns a
/// description of the failures, if any.
pub async fn revoke_token_family<S>(storage: &S, request_id: Uuid) -> Option<String>
where
    S: TokenRevocationStorage + ?Sized,
{
    let mut failures = Vec::new();
    if let Err(e) = storage.revoke_access_token(request_id).await {
        tracing::warn!(request_id = %request_id, error = %e, "Revoking access tokens failed");
        failures.push(format!("access tokens: {e}"));
    }
    if let Err(e) = storage.revoke_refresh_token(request_id).await {
        tracing::warn!(request_id = %request_id, error = %e, "Revoking refresh tokens failed");
        failures.push(format!("refresh tokens: {e}"));
    }
    (!failures.is_empty()).then(|| failures.join("; "))
}

/// Looks up a token by signature, trying kinds in hint order.
pub(crate) async fn find_token(
    strategy: &dyn TokenStrategy,
    storage: &dyn OAuth2Storage,
    token: &str,
    hint: TokenTypeHint,
) -> AuthResult<Option<(TokenKind, String, StoredSession)>> {
    for kind in hint.lookup_order() {
        let signature = strategy.signature(kind, token);
        if signature.is_empty() {
            continue;
        }
        let stored = match kind {
            TokenKind::RefreshToken => storage.get_refresh_token_session(&signature).await?,
            _ => storage.get_access_token_session(&signature).await?,
        };
        if let Some(stored) = stored {
            return Ok(Some((kind, signature, stored)));
        }
    }
    Ok(None)
}

/// Revokes tokens on behalf of an authenticated client.
pub struct TokenRevocationHandler {
    strategy: Arc<dyn TokenStrategy>,
    storage: Arc<dyn OAuth2Storage>,
}

impl TokenRevocationHandler {
    #[must_use]
    pub fn new(strategy: Arc<dyn TokenStrategy>, storage: Arc<dyn OAuth2Storage>) -> Self {
        Self { strategy, storage }
    }

    /// Revokes `token` and every token sharing its request id.
    ///
    /// Unknown tokens succeed without effect.
    ///
    /// # Errors
    ///
    /// - `unauthorized_client` if the token was issued to another client
    /// - `server_error` if storage fails
    pub async fn revoke_token(
        &self,
        client: &Client,
        token: &str,
        hint: TokenTypeHint,
    ) -> AuthResult<()> {
        let Some((kind, signature, stored)) =
            find_token(self.strategy.as_ref(), self.storage.as_ref(), token, hint).await?
        else {
            tracing::debug!(client_id = %client.client_id, hint = %hint, "Revocation of unknown token ignored");
            return Ok(());
        };

        if stored.request.client.client_id != client.client_id {
            return Err(AuthError::unauthorized_client(
                "The OAuth 2.0 Client is not allowed to revoke a token issued to another client.",
            ));
        }

        if let Some(failures) = revoke_token_family(self.storage.as_ref(), stored.request.id).await {
            return Err(AuthError::server_error(failures));
        }

        tracing::debug!(
            client_id = %client.client_id,
            request_id = %stored.request.id,
            kind = %kind,
            signature = %log_signature(&signature),
            "Revoked token family"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::error::ErrorCode;
    use crate::storage::{AccessTokenStorage, MemoryStore, RefreshTokenStorage};
    use crate::token::HmacStrategy;
    use crate::types::Request;
    use async_trait::async_trait;

    struct Issued {
        access: String,
        access_sig: String,
        refresh: String,
        refresh_sig: String,
    }

    fn setup() -> (TokenRevocationHandler, Arc<HmacStrategy>, MemoryStore) {
        let mut config = AuthConfig::default();
        config.tokens.secret = "r".repeat(64);
        let strategy = Arc::new(HmacStrategy::new(Arc::new(config)).unwrap());
        let store = MemoryStore::new()
            .with_client(Client::new("app", "App"))
            .with_client(Client::new("other", "Other"));
        let handler = TokenRevocationHandler::new(strategy.clone(), Arc::new(store.clone()));
        (handler, strategy, store)
    }

    async fn issue(strategy: &HmacStrategy, store: &MemoryStore) -> Issued {
        let request = Request::new(Client::new("app", "App"));
        let access = strategy.generate(TokenKind::AccessToken, &request).unwrap();
        let refresh = strategy.generate(TokenKind::RefreshToken, &request).unwrap();
        store
            .create_access_token_session(&access.signature, &request)
            .await
            .unwrap();
        store
            .create_refresh_token_session(&refresh.signature, &request)
            .await
            .unwrap();
        Issued {
            access: access.token,
            access_sig: access.signature,
            refresh: refresh.token,
            refresh_sig: refresh.signature,
        }
    }

    #[tokio::test]
    async fn test_revoking_refresh_token_revokes_access_token() {
        let (handler, strategy, store) = setup();
        let issued = issue(&strategy, &store).await;
        assert!(!issued.access.is_empty());

        handler
            .revoke_token(
                &Client::new("app", "App"),
                &issued.refresh,
                TokenTypeHint::RefreshToken,
            )
            .await
            .unwrap();

        let access = store.get_access_token_session(&issued.access_sig).await.unwrap().unwrap();
        let refresh = store
            .get_refresh_token_session(&issued.refresh_sig)
            .await
            .unwrap()
            .unwrap();
        assert!(!access.active);
        assert!(!refresh.active);
    }

    #[tokio::test]
    async fn test_wrong_hint_still_finds_token() {
        let (handler, strategy, store) = setup();
        let issued = issue(&strategy, &store).await;
        handler
            .revoke_token(
                &Client::new("app", "App"),
                &issued.refresh,
                TokenTypeHint::AccessToken,
            )
            .await
            .unwrap();
        let refresh = store
            .get_refresh_token_session(&issued.refresh_sig)
            .await
            .unwrap()
            .unwrap();
        assert!(!refresh.active);
    }

    #[tokio::test]
    async fn test_foreign_client_rejected() {
        let (handler, strategy, store) = setup();
        let issued = issue(&strategy, &store).await;
        let err = handler
            .revoke_token(
                &Client::new("other", "Other"),
                &issued.access,
                TokenTypeHint::AccessToken,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnauthorizedClient);
    }

    #[tokio::test]
    async fn test_unknown_token_is_ok() {
        let (handler, _, _) = setup();
        handler
            .revoke_token(&Client::new("app", "App"), "nope.nope", TokenTypeHint::AccessToken)
            .await
            .unwrap();
    }

    struct FailingAccessRevocation;

    #[async_trait]
    impl TokenRevocationStorage for FailingAccessRevocation {
        async fn revoke_access_token(&self, _: Uuid) -> AuthResult<()> {
            Err(AuthError::storage("connection reset"))
        }

        async fn revoke_refresh_token(&self, _: Uuid) -> AuthResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_family_revocation_reports_failures() {
        let failures = revoke_token_family(&FailingAccessRevocation, Uuid::new_v4())
            .await
            .unwrap();
        assert!(failures.contains("access tokens"));
        assert!(!failures.contains("refresh tokens"));
    }
}
