//! OpenID Connect for the authorization code flow.
//!
//! The authorize phase validates OIDC parameters and request objects and
//! stores the OIDC session next to the authorization code. The token phase
//! turns that session into an ID token.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::handler::{AuthorizeEndpointHandler, HandlerOutcome, TokenEndpointHandler};
use crate::AuthResult;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::storage::OAuth2Storage;
use crate::token::{IdTokenClaims, JwtService, TokenKind, TokenStrategy, log_signature};
use crate::types::{
    Arguments, AuthorizeRequest, AuthorizeResponse, Client, GrantType, Request, TokenRequest,
    TokenResponse,
};

const OPENID: &str = "openid";

// =============================================================================
// ID Token Strategy
// =============================================================================

/// Signs ID tokens with the provider's key.
pub struct IdTokenStrategy {
    jwt: JwtService,
    config: Arc<AuthConfig>,
}

impl IdTokenStrategy {
    #[must_use]
    pub fn new(jwt: JwtService, config: Arc<AuthConfig>) -> Self {
        Self { jwt, config }
    }

    /// Issues an ID token for `request`. `access_token` is hashed into
    /// `at_hash` when present.
    ///
    /// # Errors
    ///
    /// - `server_error` if `max_age` was requested but the session carries no
    ///   `auth_time`, or if signing fails
    pub fn generate(&self, request: &Request, access_token: Option<&str>) -> AuthResult<String> {
        let now = OffsetDateTime::now_utc();
        let has_auth_time = request
            .session
            .id_token
            .as_ref()
            .is_some_and(|s| s.auth_time.is_some());
        if request.form_value("max_age").is_some() && !has_auth_time {
            return Err(AuthError::server_error(
                "max_age was requested but the session has no auth_time",
            ));
        }

        let expires_at = request
            .session
            .expires_at(TokenKind::IdToken)
            .unwrap_or_else(|| now + self.config.oauth.lifetime(TokenKind::IdToken));
        let mut claims = IdTokenClaims::for_request(self.jwt.issuer(), request, now, expires_at);
        claims.at_hash = access_token.map(|token| self.jwt.algorithm().half_hash(token));

        self.jwt.encode(&claims).map_err(AuthError::from)
    }
}

// =============================================================================
// Handler
// =============================================================================

/// OpenID Connect extension of the authorization code grant.
pub struct OpenIdConnectHandler {
    config: Arc<AuthConfig>,
    id_tokens: IdTokenStrategy,
    strategy: Arc<dyn TokenStrategy>,
    storage: Arc<dyn OAuth2Storage>,
}

impl OpenIdConnectHandler {
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        id_tokens: IdTokenStrategy,
        strategy: Arc<dyn TokenStrategy>,
        storage: Arc<dyn OAuth2Storage>,
    ) -> Self {
        Self {
            config,
            id_tokens,
            strategy,
            storage,
        }
    }

    fn validate_parameters(&self, ar: &AuthorizeRequest) -> AuthResult<()> {
        if ar.request.form_value("redirect_uri").is_none() {
            return Err(AuthError::invalid_request(
                "The 'redirect_uri' parameter is required when using OpenID Connect.",
            ));
        }
        if ar.prompt.has("none") && ar.prompt.len() > 1 {
            return Err(AuthError::invalid_request(
                "Parameter 'prompt' was set to 'none', but contains other values as well which is not allowed.",
            ));
        }
        if let Some(nonce) = ar.nonce.as_deref() {
            if nonce.len() < self.config.oauth.min_parameter_entropy {
                return Err(AuthError::invalid_request(format!(
                    "Parameter 'nonce' is set but does not satisfy the minimum entropy of {} characters.",
                    self.config.oauth.min_parameter_entropy
                )));
            }
        }
        if ar.max_age.is_some_and(|age| age < 0) {
            return Err(AuthError::invalid_request(
                "Parameter 'max_age' must not be negative.",
            ));
        }
        Ok(())
    }

    /// Verifies a `request` object and merges its claims into `ar`.
    fn apply_request_object(&self, ar: &mut AuthorizeRequest, object: &str) -> AuthResult<()> {
        let claims = verify_request_object(&ar.request.client, object)?;

        if let Some(client_id) = claims.get("client_id").and_then(Value::as_str) {
            if client_id != ar.request.client.client_id {
                return Err(AuthError::invalid_request(
                    "The 'client_id' of the request object does not match the request.",
                ));
            }
        }
        if let Some(response_type) = claims.get("response_type").and_then(Value::as_str) {
            if !Arguments::from_space_delimited(response_type).matches(
                &ar.response_types.iter().collect::<Vec<_>>(),
            ) {
                return Err(AuthError::invalid_request(
                    "The 'response_type' of the request object does not match the request.",
                ));
            }
        }

        for (key, value) in &claims {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            ar.request.form.insert(key.clone(), value);
        }
        if let Some(scope) = claims.get("scope").and_then(Value::as_str) {
            ar.request.requested_scope = Arguments::from_space_delimited(scope);
        }
        if let Some(nonce) = claims.get("nonce").and_then(Value::as_str) {
            ar.nonce = Some(nonce.to_string());
        }
        if let Some(state) = claims.get("state").and_then(Value::as_str) {
            ar.state = state.to_string();
        }
        if let Some(prompt) = claims.get("prompt").and_then(Value::as_str) {
            ar.prompt = Arguments::from_space_delimited(prompt);
        }
        if let Some(max_age) = claims.get("max_age").and_then(Value::as_i64) {
            ar.max_age = Some(max_age);
        }

        tracing::debug!(
            client_id = %ar.request.client.client_id,
            claims = claims.len(),
            "Merged request object"
        );
        Ok(())
    }
}

/// Verifies a request object with the client's registered keys.
fn verify_request_object(client: &Client, object: &str) -> AuthResult<Map<String, Value>> {
    let Some(oidc) = client.oidc.as_ref() else {
        return Err(AuthError::request_not_supported(
            "The OAuth 2.0 Client does not support OpenID Connect request objects.",
        ));
    };

    let invalid = |debug: String| {
        AuthError::invalid_request("Unable to verify the request object.").with_debug(debug)
    };
    let header_alg = object
        .split('.')
        .next()
        .and_then(|h| URL_SAFE_NO_PAD.decode(h).ok())
        .and_then(|h| serde_json::from_slice::<Value>(&h).ok())
        .and_then(|h| h.get("alg").and_then(Value::as_str).map(str::to_string))
        .ok_or_else(|| invalid("malformed request object header".to_string()))?;

    let registered_alg = oidc.request_object_signing_alg.as_deref();
    if let Some(registered) = registered_alg {
        if registered != header_alg {
            return Err(invalid(format!(
                "request object is signed with {header_alg} but the client registered {registered}"
            )));
        }
    }

    if header_alg == "none" {
        if registered_alg != Some("none") {
            return Err(invalid(
                "unsigned request objects require request_object_signing_alg=none".to_string(),
            ));
        }
        let payload = match object.split('.').collect::<Vec<_>>().as_slice() {
            [_, payload, ""] => URL_SAFE_NO_PAD
                .decode(payload)
                .map_err(|e| invalid(e.to_string()))?,
            _ => return Err(invalid("unsigned request object must end with '.'".to_string())),
        };
        return serde_json::from_slice(&payload).map_err(|e| invalid(e.to_string()));
    }

    let Some(jwks) = oidc.jwks.as_ref() else {
        return Err(AuthError::request_not_supported(
            "The OAuth 2.0 Client has no inline JSON Web Key Set to verify request objects.",
        ));
    };
    let header = decode_header(object).map_err(|e| invalid(e.to_string()))?;
    let jwk = find_key(jwks, header.kid.as_deref())
        .ok_or_else(|| invalid("no matching key in client JWKS".to_string()))?;
    let key = DecodingKey::from_jwk(jwk).map_err(|e| invalid(e.to_string()))?;

    let mut validation = Validation::new(header.alg);
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();
    let data = decode::<Map<String, Value>>(object, &key, &validation)
        .map_err(|e| invalid(e.to_string()))?;
    Ok(data.claims)
}

fn find_key<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Option<&'a jsonwebtoken::jwk::Jwk> {
    match kid {
        Some(kid) => jwks.find(kid),
        None if jwks.keys.len() == 1 => jwks.keys.first(),
        None => None,
    }
}

#[async_trait]
impl AuthorizeEndpointHandler for OpenIdConnectHandler {
    async fn handle_authorize_request(
        &self,
        ar: &mut AuthorizeRequest,
    ) -> AuthResult<HandlerOutcome> {
        if !ar.request.requested_scope.has(OPENID) || !ar.response_types.exact("code") {
            return Ok(HandlerOutcome::NotApplicable);
        }

        let object = ar.request.form_value("request").map(str::to_string);
        let object_uri = ar.request.form_value("request_uri").map(str::to_string);
        match (object, object_uri) {
            (Some(_), Some(_)) => {
                return Err(AuthError::invalid_request(
                    "OpenID Connect parameters 'request' and 'request_uri' were both given, but you can use at most one.",
                ));
            }
            (None, Some(_)) => {
                return Err(AuthError::request_uri_not_supported(
                    "Fetching request objects by reference is not supported.",
                ));
            }
            (Some(object), None) => {
                if !ar.request.client.supports_request_objects() {
                    return Err(AuthError::request_not_supported(
                        "The OAuth 2.0 Client does not support OpenID Connect request objects.",
                    ));
                }
                self.apply_request_object(ar, &object)?;
            }
            (None, None) => {}
        }

        self.validate_parameters(ar)?;
        Ok(HandlerOutcome::Applied)
    }

    async fn handle_authorize_response(
        &self,
        ar: &mut AuthorizeRequest,
        response: &mut AuthorizeResponse,
    ) -> AuthResult<HandlerOutcome> {
        if !ar.request.granted_scope.has(OPENID) || !ar.response_types.exact("code") {
            return Ok(HandlerOutcome::NotApplicable);
        }
        let Some(code) = response.code() else {
            return Ok(HandlerOutcome::NotApplicable);
        };

        let signature = self.strategy.signature(TokenKind::AuthorizeCode, code);
        let mut request = ar.request.sanitized();
        if let Some(nonce) = &ar.nonce {
            request.form.insert("nonce".to_string(), nonce.clone());
        }
        if let Some(max_age) = ar.max_age {
            request.form.insert("max_age".to_string(), max_age.to_string());
        }
        self.storage
            .create_openid_connect_session(&signature, &request)
            .await?;

        tracing::debug!(
            request_id = %ar.request.id,
            signature = %log_signature(&signature),
            "Stored OpenID Connect session"
        );
        Ok(HandlerOutcome::Applied)
    }
}

#[async_trait]
impl TokenEndpointHandler for OpenIdConnectHandler {
    async fn handle_token_request(&self, _tr: &mut TokenRequest) -> AuthResult<HandlerOutcome> {
        Ok(HandlerOutcome::NotApplicable)
    }

    async fn handle_token_response(
        &self,
        tr: &mut TokenRequest,
        response: &mut TokenResponse,
    ) -> AuthResult<HandlerOutcome> {
        if !tr.grant_types.exact(GrantType::AuthorizationCode.as_str()) {
            return Ok(HandlerOutcome::NotApplicable);
        }
        let Some(code) = tr.code.as_deref() else {
            return Ok(HandlerOutcome::NotApplicable);
        };

        let signature = self.strategy.signature(TokenKind::AuthorizeCode, code);
        let Some(stored) = self.storage.get_openid_connect_session(&signature).await? else {
            return Ok(HandlerOutcome::NotApplicable);
        };
        self.storage
            .delete_openid_connect_session(&signature)
            .await?;

        if !stored.granted_scope.has(OPENID) {
            return Ok(HandlerOutcome::NotApplicable);
        }

        // The stored request carries nonce and max_age; the token request
        // carries the session adopted during the code exchange.
        let mut request = stored;
        request.session = tr.request.session.clone();
        let access_token = (!response.access_token.is_empty()).then_some(response.access_token.as_str());
        response.id_token = Some(self.id_tokens.generate(&request, access_token)?);

        tracing::debug!(
            client_id = %tr.request.client.client_id,
            request_id = %tr.request.id,
            "Issued ID token"
        );
        Ok(HandlerOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::{MemoryStore, OpenIdConnectStorage};
    use crate::token::{HmacStrategy, SigningKeyPair, StaticKeyProvider};
    use crate::types::{IdTokenSession, OidcClientMetadata, Session};
    use url::Url;

    const ISSUER: &str = "https://auth.example.com";

    fn client() -> Client {
        Client::new("app", "App")
            .with_redirect_uris(["https://app.example.com/cb"])
            .with_scopes(["openid", "profile"])
    }

    struct Fixture {
        handler: OpenIdConnectHandler,
        jwt: JwtService,
        store: MemoryStore,
    }

    fn fixture() -> Fixture {
        let mut config = AuthConfig::default();
        config.issuer = ISSUER.to_string();
        config.tokens.secret = "o".repeat(64);
        let config = Arc::new(config);
        let jwt = JwtService::new(
            Arc::new(StaticKeyProvider::new(SigningKeyPair::generate_ec().unwrap())),
            ISSUER,
        );
        let store = MemoryStore::new().with_client(client());
        let handler = OpenIdConnectHandler::new(
            Arc::clone(&config),
            IdTokenStrategy::new(jwt.clone(), Arc::clone(&config)),
            Arc::new(HmacStrategy::new(config).unwrap()),
            Arc::new(store.clone()),
        );
        Fixture {
            handler,
            jwt,
            store,
        }
    }

    fn authorize_request(client: Client, scope: &str) -> AuthorizeRequest {
        let mut request = Request::new(client);
        request.requested_scope = Arguments::from_space_delimited(scope);
        request
            .form
            .insert("redirect_uri".into(), "https://app.example.com/cb".into());
        AuthorizeRequest::new(
            request,
            Arguments::from_space_delimited("code"),
            Url::parse("https://app.example.com/cb").unwrap(),
        )
    }

    fn unsigned_object(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("{header}.{payload}.")
    }

    #[tokio::test]
    async fn test_skipped_without_openid_scope() {
        let f = fixture();
        let mut ar = authorize_request(client(), "profile");
        assert_eq!(
            f.handler.handle_authorize_request(&mut ar).await.unwrap(),
            HandlerOutcome::NotApplicable
        );
    }

    #[tokio::test]
    async fn test_parameter_validation() {
        let f = fixture();
        let mut ar = authorize_request(client(), "openid");
        ar.request.form.remove("redirect_uri");
        let err = f.handler.handle_authorize_request(&mut ar).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);

        let mut ar = authorize_request(client(), "openid");
        ar.prompt = Arguments::from_space_delimited("none login");
        let err = f.handler.handle_authorize_request(&mut ar).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);

        let mut ar = authorize_request(client(), "openid");
        ar.nonce = Some("short".into());
        let err = f.handler.handle_authorize_request(&mut ar).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_request_object_capability() {
        let f = fixture();
        let mut ar = authorize_request(client(), "openid");
        ar.request.form.insert("request".into(), "x.y.".into());
        let err = f.handler.handle_authorize_request(&mut ar).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RequestNotSupported);

        let mut ar = authorize_request(client(), "openid");
        ar.request
            .form
            .insert("request_uri".into(), "https://app.example.com/r".into());
        let err = f.handler.handle_authorize_request(&mut ar).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RequestUriNotSupported);

        let mut ar = authorize_request(client(), "openid");
        ar.request.form.insert("request".into(), "x.y.".into());
        ar.request
            .form
            .insert("request_uri".into(), "https://app.example.com/r".into());
        let err = f.handler.handle_authorize_request(&mut ar).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_unsigned_request_object_merged() {
        let f = fixture();
        let oidc_client = client().with_oidc(OidcClientMetadata {
            request_object_signing_alg: Some("none".into()),
            ..Default::default()
        });
        let mut ar = authorize_request(oidc_client, "openid");
        let object = unsigned_object(&serde_json::json!({
            "scope": "openid profile",
            "nonce": "nonce-from-object",
            "max_age": 300
        }));
        ar.request.form.insert("request".into(), object);

        assert!(f.handler.handle_authorize_request(&mut ar).await.unwrap().is_applied());
        assert!(ar.request.requested_scope.has("profile"));
        assert_eq!(ar.nonce.as_deref(), Some("nonce-from-object"));
        assert_eq!(ar.max_age, Some(300));
    }

    #[tokio::test]
    async fn test_signed_request_object() {
        let f = fixture();
        let client_key = SigningKeyPair::generate_ec().unwrap();
        let jwk_json = serde_json::to_value(client_key.to_jwk()).unwrap();
        let jwks: JwkSet = serde_json::from_value(serde_json::json!({ "keys": [jwk_json] })).unwrap();
        let oidc_client = client().with_oidc(OidcClientMetadata {
            jwks: Some(jwks),
            ..Default::default()
        });
        let client_jwt = JwtService::new(Arc::new(StaticKeyProvider::new(client_key)), "app");
        let object = client_jwt
            .encode(&serde_json::json!({"client_id": "app", "state": "from-object"}))
            .unwrap();

        let mut ar = authorize_request(oidc_client.clone(), "openid");
        ar.request.form.insert("request".into(), object);
        f.handler.handle_authorize_request(&mut ar).await.unwrap();
        assert_eq!(ar.state, "from-object");

        let mut ar = authorize_request(oidc_client, "openid");
        ar.request
            .form
            .insert("request".into(), unsigned_object(&serde_json::json!({})));
        let err = f.handler.handle_authorize_request(&mut ar).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_id_token_issued_at_token_endpoint() {
        let f = fixture();
        let code = "a2V5.b2lkYw";
        let mut ar = authorize_request(client(), "openid");
        ar.nonce = Some("n-0S6_WzA2Mj".into());
        ar.request.grant_scope("openid");
        let auth_time = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        ar.request.session = Session::new("alice").with_id_token(IdTokenSession {
            auth_time: Some(auth_time),
            ..Default::default()
        });
        let mut authorize_response = AuthorizeResponse::new();
        authorize_response.add_parameter("code", code);
        f.handler
            .handle_authorize_response(&mut ar, &mut authorize_response)
            .await
            .unwrap();

        let mut tr = TokenRequest::new(
            Request::new(client()),
            Arguments::from_space_delimited("authorization_code"),
        );
        tr.code = Some(code.to_string());
        tr.request.session = ar.request.session.clone();
        let mut response = TokenResponse::default();
        response.set_access_token("jHkWEdUXMU1BwAsC4vtUsZwnNvTIxEl0z9K3vx5KF0Y".into(), 3600);
        assert!(f
            .handler
            .handle_token_response(&mut tr, &mut response)
            .await
            .unwrap()
            .is_applied());

        let claims = f
            .jwt
            .decode::<IdTokenClaims>(response.id_token.as_deref().unwrap())
            .unwrap()
            .claims;
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.aud, vec!["app".to_string()]);
        assert_eq!(claims.nonce.as_deref(), Some("n-0S6_WzA2Mj"));
        assert_eq!(claims.auth_time, Some(1_700_000_000));
        assert!(claims.at_hash.is_some());

        let signature = f
            .handler
            .strategy
            .signature(TokenKind::AuthorizeCode, code);
        assert!(f
            .store
            .get_openid_connect_session(&signature)
            .await
            .unwrap()
            .is_none());
    }
}
