//! Assembles a provider from configuration, storage and signing keys.
//!
//! [`ProviderHandle`] keeps the active provider behind an [`ArcSwap`] so a
//! new configuration can be applied without interrupting in-flight requests:
//! callers that already loaded a provider finish with their snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;

use super::authorize_code::AuthorizeCodeHandler;
use super::client_credentials::ClientCredentialsHandler;
use super::introspection::CoreIntrospector;
use super::openid::{IdTokenStrategy, OpenIdConnectHandler};
use super::pkce::PkceHandler;
use super::provider::OAuth2Provider;
use super::refresh_token::RefreshTokenHandler;
use crate::config::{AccessTokenFormat, AuthConfig, ConfigError};
use crate::storage::OAuth2Storage;
use crate::token::{HmacStrategy, JwtService, JwtStrategy, KeyProvider, TokenStrategy};

/// Builds a provider with the standard handler chain: authorization code,
/// OpenID Connect, PKCE, client credentials and refresh token.
///
/// # Errors
///
/// Returns a [`ConfigError`] if `config` fails validation.
pub fn compose(
    config: Arc<AuthConfig>,
    storage: Arc<dyn OAuth2Storage>,
    keys: Arc<dyn KeyProvider>,
) -> Result<OAuth2Provider, ConfigError> {
    config.validate()?;

    let jwt = JwtService::new(keys, config.issuer.clone());
    let opaque = HmacStrategy::new(Arc::clone(&config))?;
    let strategy: Arc<dyn TokenStrategy> = match config.tokens.access_token_format {
        AccessTokenFormat::Opaque => Arc::new(opaque),
        AccessTokenFormat::Jwt => Arc::new(JwtStrategy::new(jwt.clone(), opaque, Arc::clone(&config))),
    };

    let authorize_code = Arc::new(AuthorizeCodeHandler::new(
        Arc::clone(&config),
        Arc::clone(&strategy),
        Arc::clone(&storage),
    ));
    let openid = Arc::new(OpenIdConnectHandler::new(
        Arc::clone(&config),
        IdTokenStrategy::new(jwt.clone(), Arc::clone(&config)),
        Arc::clone(&strategy),
        Arc::clone(&storage),
    ));
    let pkce = Arc::new(PkceHandler::new(
        config.pkce.clone(),
        Arc::clone(&strategy),
        Arc::clone(&storage),
    ));
    let client_credentials = Arc::new(ClientCredentialsHandler::new(
        Arc::clone(&config),
        Arc::clone(&strategy),
        Arc::clone(&storage),
    ));
    let refresh = Arc::new(RefreshTokenHandler::new(
        Arc::clone(&config),
        Arc::clone(&strategy),
        Arc::clone(&storage),
    ));
    let introspector = Arc::new(CoreIntrospector::new(
        Arc::clone(&config),
        Arc::clone(&strategy),
        Arc::clone(&storage),
    ));

    tracing::info!(
        issuer = %config.issuer,
        access_token_format = ?config.tokens.access_token_format,
        "OAuth 2.0 provider composed"
    );

    Ok(OAuth2Provider::new(config, storage, strategy, jwt)
        .with_authorize_handler(authorize_code.clone())
        .with_authorize_handler(openid.clone())
        .with_authorize_handler(pkce.clone())
        .with_token_handler(authorize_code)
        .with_token_handler(openid)
        .with_token_handler(pkce)
        .with_token_handler(client_credentials)
        .with_token_handler(refresh)
        .with_introspector(introspector))
}

// =============================================================================
// Provider Handle
// =============================================================================

/// Shared, atomically replaceable provider.
#[derive(Clone)]
pub struct ProviderHandle {
    inner: Arc<ArcSwap<OAuth2Provider>>,
}

impl ProviderHandle {
    #[must_use]
    pub fn new(provider: OAuth2Provider) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(provider)),
        }
    }

    /// Current provider snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<OAuth2Provider> {
        self.inner.load_full()
    }

    /// Installs `provider` for all subsequent requests.
    pub fn replace(&self, provider: OAuth2Provider) {
        self.inner.store(Arc::new(provider));
    }

    /// Recomposes the provider from a new configuration, keeping the current
    /// one if the configuration is invalid.
    ///
    /// # Errors
    ///
    /// Returns the validation error; the active provider stays in place.
    pub fn reload(
        &self,
        config: AuthConfig,
        storage: Arc<dyn OAuth2Storage>,
        keys: Arc<dyn KeyProvider>,
    ) -> Result<(), ConfigError> {
        match compose(Arc::new(config), storage, keys) {
            Ok(provider) => {
                self.replace(provider);
                tracing::info!("OAuth 2.0 provider configuration reloaded");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Rejected provider configuration, keeping current");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("issuer", &self.load().config().issuer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::token::{SigningKeyPair, StaticKeyProvider};

    fn keys() -> Arc<dyn KeyProvider> {
        Arc::new(StaticKeyProvider::new(SigningKeyPair::generate_ec().unwrap()))
    }

    fn config(issuer: &str) -> AuthConfig {
        let mut config = AuthConfig::default();
        config.issuer = issuer.to_string();
        config.tokens.secret = "k".repeat(64);
        config
    }

    #[test]
    fn test_compose_rejects_short_secret() {
        let mut bad = config("https://auth.example.com");
        bad.tokens.secret = "short".to_string();
        assert!(compose(Arc::new(bad), Arc::new(MemoryStore::new()), keys()).is_err());
    }

    #[test]
    fn test_compose_with_jwt_access_tokens() {
        let mut cfg = config("https://auth.example.com");
        cfg.tokens.access_token_format = AccessTokenFormat::Jwt;
        let provider = compose(Arc::new(cfg), Arc::new(MemoryStore::new()), keys()).unwrap();
        assert_eq!(provider.jwks().keys.len(), 1);
    }

    #[test]
    fn test_handle_reload_swaps_snapshot() {
        let store: Arc<dyn OAuth2Storage> = Arc::new(MemoryStore::new());
        let provider =
            compose(Arc::new(config("https://one.example.com")), Arc::clone(&store), keys()).unwrap();
        let handle = ProviderHandle::new(provider);
        let before = handle.load();

        handle
            .reload(config("https://two.example.com"), Arc::clone(&store), keys())
            .unwrap();
        assert_eq!(handle.load().config().issuer, "https://two.example.com");
        // earlier snapshots are unaffected
        assert_eq!(before.config().issuer, "https://one.example.com");

        let mut bad = config("https://three.example.com");
        bad.tokens.secret.clear();
        assert!(handle.reload(bad, store, keys()).is_err());
        assert_eq!(handle.load().config().issuer, "https://two.example.com");
    }
}
