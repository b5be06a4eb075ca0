//! Token introspection (RFC 7662).

use std::sync::Arc;

use async_trait::async_trait;

use super::handler::{Introspection, TokenIntrospector};
use crate::AuthResult;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::storage::OAuth2Storage;
use crate::token::{TokenKind, TokenStrategy, TokenTypeHint, log_signature};

/// Recognizes access and refresh tokens issued by this provider.
pub struct CoreIntrospector {
    config: Arc<AuthConfig>,
    strategy: Arc<dyn TokenStrategy>,
    storage: Arc<dyn OAuth2Storage>,
}

impl CoreIntrospector {
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

    fn lookup_order(&self, hint: TokenTypeHint) -> Vec<TokenKind> {
        if self.config.oauth.disable_refresh_token_validation {
            vec![TokenKind::AccessToken]
        } else {
            hint.lookup_order().to_vec()
        }
    }
}

#[async_trait]
impl TokenIntrospector for CoreIntrospector {
    async fn introspect_token(
        &self,
        token: &str,
        hint: TokenTypeHint,
    ) -> AuthResult<Introspection> {
        for kind in self.lookup_order(hint) {
            let signature = self.strategy.signature(kind, token);
            if signature.is_empty() {
                continue;
            }
            let stored = match kind {
                TokenKind::RefreshToken => self.storage.get_refresh_token_session(&signature).await?,
                _ => self.storage.get_access_token_session(&signature).await?,
            };
            let Some(stored) = stored else {
                continue;
            };

            if !stored.active {
                tracing::debug!(
                    kind = %kind,
                    signature = %log_signature(&signature),
                    "Introspected token is revoked"
                );
                return Err(AuthError::token_inactive(format!("The {kind} has been revoked.")));
            }
            self.strategy.validate(kind, &stored.request, token)?;
            return Ok(Introspection::Active(kind, Box::new(stored.request)));
        }
        Ok(Introspection::NotApplicable)
    }
}
