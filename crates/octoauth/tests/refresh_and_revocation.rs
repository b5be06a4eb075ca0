//! Refresh token rotation and RFC 7009 revocation through the provider.

mod common;

use common::{BACKEND_SECRET, REDIRECT_URI, authorize, params, setup};
use octoauth::{ErrorCode, OAuth2Provider, TokenResponse, TokenTypeHint};

/// Runs the code flow for `client_id` with offline access and returns the
/// issued tokens.
async fn issue(
    provider: &OAuth2Provider,
    client_id: &str,
    scope: &str,
    basic: Option<(&str, &str)>,
) -> TokenResponse {
    let (_, response) = authorize(provider, client_id, scope, &[]).await;
    let code = response.code().unwrap().to_string();
    let form = params(&[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", REDIRECT_URI),
        ("client_id", client_id),
    ]);
    let mut tr = provider.new_token_request(&form, basic).await.unwrap();
    provider.new_token_response(&mut tr).await.unwrap()
}

async fn refresh(
    provider: &OAuth2Provider,
    refresh_token: &str,
    scope: Option<&str>,
) -> octoauth::AuthResult<TokenResponse> {
    let mut pairs = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", "spa"),
    ];
    if let Some(scope) = scope {
        pairs.push(("scope", scope));
    }
    let mut tr = provider.new_token_request(&params(&pairs), None).await?;
    provider.new_token_response(&mut tr).await
}

// =============================================================================
// Refresh
// =============================================================================

#[tokio::test]
async fn test_refresh_rotates_token_pair() {
    let (provider, _) = setup();
    let first = issue(&provider, "spa", "openid profile offline_access", None).await;
    let first_refresh = first.refresh_token.clone().expect("offline access granted");

    let second = refresh(&provider, &first_refresh, None).await.unwrap();
    let second_refresh = second.refresh_token.clone().expect("rotated refresh token");
    assert_ne!(second_refresh, first_refresh);
    assert_ne!(second.access_token, first.access_token);
    assert_eq!(second.scope.as_deref(), Some("openid profile offline_access"));

    // the previous pair is revoked, the new one is live
    assert!(!provider.introspect_token(&first.access_token, None).await.active);
    assert!(
        !provider
            .introspect_token(&first_refresh, Some(TokenTypeHint::RefreshToken))
            .await
            .active
    );
    assert!(provider.introspect_token(&second.access_token, None).await.active);
    let refresh_introspection = provider
        .introspect_token(&second_refresh, Some(TokenTypeHint::RefreshToken))
        .await;
    assert!(refresh_introspection.active);
    assert_eq!(refresh_introspection.token_type.as_deref(), Some("refresh_token"));
}

#[tokio::test]
async fn test_refresh_token_reuse_revokes_family() {
    let (provider, _) = setup();
    let first = issue(&provider, "spa", "offline_access profile", None).await;
    let first_refresh = first.refresh_token.unwrap();
    let second = refresh(&provider, &first_refresh, None).await.unwrap();

    let err = refresh(&provider, &first_refresh, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidGrant);

    // the legitimate holder lost its tokens too
    assert!(!provider.introspect_token(&second.access_token, None).await.active);
    let err = refresh(&provider, &second.refresh_token.unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidGrant);
}

#[tokio::test]
async fn test_refresh_scope_may_narrow_but_not_widen() {
    let (provider, _) = setup();
    let tokens = issue(&provider, "spa", "offline_access profile", None).await;

    let err = refresh(&provider, tokens.refresh_token.as_deref().unwrap(), Some("openid"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidScope);

    let narrowed = refresh(
        &provider,
        tokens.refresh_token.as_deref().unwrap(),
        Some("offline_access"),
    )
    .await
    .unwrap();
    assert_eq!(narrowed.scope.as_deref(), Some("offline_access"));
}

#[tokio::test]
async fn test_refresh_token_of_other_client() {
    let (provider, _) = setup();
    let tokens = issue(
        &provider,
        "backend",
        "offline reports",
        Some(("backend", BACKEND_SECRET)),
    )
    .await;

    let err = refresh(&provider, tokens.refresh_token.as_deref().unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidGrant);
}

// =============================================================================
// Revocation
// =============================================================================

#[tokio::test]
async fn test_revoking_refresh_token_revokes_access_token() {
    let (provider, _) = setup();
    let tokens = issue(&provider, "spa", "offline_access", None).await;
    let refresh_token = tokens.refresh_token.unwrap();

    provider
        .revoke_token(
            &params(&[
                ("client_id", "spa"),
                ("token", &refresh_token),
                ("token_type_hint", "refresh_token"),
            ]),
            None,
        )
        .await
        .unwrap();

    assert!(!provider.introspect_token(&tokens.access_token, None).await.active);
    let err = refresh(&provider, &refresh_token, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidGrant);
}

#[tokio::test]
async fn test_revoking_access_token_without_hint() {
    let (provider, _) = setup();
    let tokens = issue(&provider, "spa", "offline_access", None).await;

    provider
        .revoke_token(
            &params(&[("client_id", "spa"), ("token", &tokens.access_token)]),
            None,
        )
        .await
        .unwrap();
    assert!(
        !provider
            .introspect_token(
                tokens.refresh_token.as_deref().unwrap(),
                Some(TokenTypeHint::RefreshToken)
            )
            .await
            .active
    );
}

#[tokio::test]
async fn test_revocation_requires_ownership() {
    let (provider, _) = setup();
    let tokens = issue(&provider, "spa", "offline_access", None).await;

    let err = provider
        .revoke_token(
            &params(&[("token", &tokens.access_token)]),
            Some(("backend", BACKEND_SECRET)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnauthorizedClient);
    assert!(provider.introspect_token(&tokens.access_token, None).await.active);

    // unknown tokens are accepted without revealing anything
    provider
        .revoke_token(&params(&[("client_id", "spa"), ("token", "no.such-token")]), None)
        .await
        .unwrap();
}
