//! Rolling back a failed transaction while other requests keep writing to
//! the same in-memory store.

mod common;

use std::sync::Arc;

use common::{REDIRECT_URI, authorize, params, setup};
use octoauth::storage::{AccessTokenStorage, RefreshTokenStorage, run_in_transaction};
use octoauth::token::{HmacStrategy, TokenKind, TokenStrategy};
use octoauth::{AuthError, ErrorCode, OAuth2Provider, TokenResponse, TokenTypeHint};

fn signature(kind: TokenKind, token: &str) -> String {
    let strategy = HmacStrategy::new(Arc::new(common::config())).expect("strategy");
    strategy.signature(kind, token)
}

async fn issue(provider: &OAuth2Provider) -> TokenResponse {
    let (_, response) = authorize(provider, "spa", "offline_access", &[]).await;
    let code = response.code().unwrap().to_string();
    let form = params(&[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", REDIRECT_URI),
        ("client_id", "spa"),
    ]);
    let mut tr = provider.new_token_request(&form, None).await.unwrap();
    provider.new_token_response(&mut tr).await.unwrap()
}

// =============================================================================
// Rollback isolation
// =============================================================================

#[tokio::test]
async fn test_rollback_keeps_concurrent_revocation() {
    let (provider, store) = setup();
    let provider = Arc::new(provider);
    let alice = issue(&provider).await;
    let bob = issue(&provider).await;

    let alice_refresh = alice.refresh_token.clone().unwrap();
    let refresh_signature = signature(TokenKind::RefreshToken, &alice_refresh);
    let rotated_signature = signature(TokenKind::AccessToken, "rotated.access-token");

    let err = run_in_transaction(&store, async {
        // first half of a rotation
        let session = store
            .get_refresh_token_session(&refresh_signature)
            .await?
            .expect("refresh session");
        store.delete_refresh_token_session(&refresh_signature).await?;
        store
            .create_access_token_session(&rotated_signature, &session.request)
            .await?;

        // bob revokes his tokens meanwhile
        let other = Arc::clone(&provider);
        let token = bob.access_token.clone();
        tokio::spawn(async move {
            other
                .revoke_token(&params(&[("client_id", "spa"), ("token", &token)]), None)
                .await
        })
        .await
        .expect("revocation task")?;

        Err::<(), _>(AuthError::server_error("issuing the rotated pair failed"))
    })
    .await
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ServerError);

    // the failed rotation left no trace
    assert!(
        store
            .get_access_token_session(&rotated_signature)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        provider
            .introspect_token(&alice_refresh, Some(TokenTypeHint::RefreshToken))
            .await
            .active
    );
    assert!(provider.introspect_token(&alice.access_token, None).await.active);

    // the revocation survived the rollback
    assert!(!provider.introspect_token(&bob.access_token, None).await.active);
    assert!(
        !provider
            .introspect_token(
                bob.refresh_token.as_deref().unwrap(),
                Some(TokenTypeHint::RefreshToken)
            )
            .await
            .active
    );
}

#[tokio::test]
async fn test_commit_keeps_own_writes() {
    let (provider, store) = setup();
    let tokens = issue(&provider).await;
    let refresh_signature = signature(TokenKind::RefreshToken, tokens.refresh_token.as_deref().unwrap());

    run_in_transaction(&store, async {
        store.delete_refresh_token_session(&refresh_signature).await
    })
    .await
    .unwrap();

    assert!(
        store
            .get_refresh_token_session(&refresh_signature)
            .await
            .unwrap()
            .is_none()
    );
}
