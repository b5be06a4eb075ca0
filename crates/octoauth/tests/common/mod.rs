//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Once};

use octoauth::secret::hash_client_secret;
use octoauth::storage::MemoryStore;
use octoauth::token::{SigningKeyPair, StaticKeyProvider};
use octoauth::types::{AuthorizeRequest, AuthorizeResponse, IdTokenSession, Session};
use octoauth::{AuthConfig, Client, GrantType, OAuth2Provider, compose};
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const REDIRECT_URI: &str = "https://app.example.com/callback";
pub const STATE: &str = "state-0123456789";
pub const BACKEND_SECRET: &str = "backend-secret-value";

/// A public single-page app.
pub fn spa_client() -> Client {
    Client::new("spa", "Single Page App")
        .with_grant_types([GrantType::AuthorizationCode, GrantType::RefreshToken])
        .with_redirect_uris([REDIRECT_URI])
        .with_scopes(["openid", "profile", "offline_access"])
}

/// A confidential backend using client credentials and the code flow.
pub fn backend_client() -> Client {
    let hash = hash_client_secret(BACKEND_SECRET).expect("hash secret");
    Client::new("backend", "Backend Service")
        .with_secret_hash(hash)
        .with_grant_types([
            GrantType::AuthorizationCode,
            GrantType::ClientCredentials,
            GrantType::RefreshToken,
        ])
        .with_redirect_uris([REDIRECT_URI])
        .with_scopes(["openid", "reports", "offline"])
        .with_audience(["https://api.example.com"])
}

pub fn config() -> AuthConfig {
    let mut config = AuthConfig::default();
    config.issuer = "https://auth.example.com".to_string();
    config.tokens.secret = "integration-test-secret-".repeat(4);
    config.flow.login_url = "https://login.example.com/login".to_string();
    config.flow.consent_url = "https://login.example.com/consent".to_string();
    config
}

static TRACING: Once = Once::new();

/// Routes provider logs through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

pub fn setup_with(config: AuthConfig) -> (OAuth2Provider, MemoryStore) {
    init_tracing();
    let store = MemoryStore::new()
        .with_client(spa_client())
        .with_client(backend_client());
    let keys = StaticKeyProvider::new(SigningKeyPair::generate_ec().expect("generate key"));
    let provider = compose(Arc::new(config), Arc::new(store.clone()), Arc::new(keys))
        .expect("compose provider");
    (provider, store)
}

pub fn setup() -> (OAuth2Provider, MemoryStore) {
    setup_with(config())
}

pub fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn alice() -> Session {
    Session::new("alice")
        .with_username("alice@example.com")
        .with_id_token(IdTokenSession {
            auth_time: Some(OffsetDateTime::now_utc()),
            ..IdTokenSession::default()
        })
}

/// Runs an authorize request for `client_id`, grants every requested scope
/// and returns the request and response.
pub async fn authorize(
    provider: &OAuth2Provider,
    client_id: &str,
    scope: &str,
    extra: &[(&str, &str)],
) -> (AuthorizeRequest, AuthorizeResponse) {
    let mut pairs = vec![
        ("client_id", client_id),
        ("response_type", "code"),
        ("redirect_uri", REDIRECT_URI),
        ("scope", scope),
        ("state", STATE),
    ];
    pairs.extend_from_slice(extra);
    let mut ar = provider
        .new_authorize_request(&params(&pairs))
        .await
        .expect("authorize request");
    let requested: Vec<String> = ar.request.requested_scope.iter().map(String::from).collect();
    for scope in requested {
        ar.request.grant_scope(scope);
    }
    let response = provider
        .new_authorize_response(&mut ar, alice())
        .await
        .expect("authorize response");
    (ar, response)
}
