//! The provider façade consumed by a transport layer.
//!
//! [`OAuth2Provider`] parses raw endpoint parameters into typed requests and
//! runs them through the registered handler chain. It never touches HTTP:
//! callers pass decoded form parameters and Basic Auth credentials in and
//! turn the returned values (or [`AuthError::to_body`]) into responses.

use std::collections::BTreeMap;
use std::sync::Arc;

use time::OffsetDateTime;
use url::Url;

use super::client_auth::{AuthenticatedClient, authenticate_client};
use super::handler::{
    AuthorizeEndpointHandler, HandlerOutcome, Introspection, TokenEndpointHandler,
    TokenIntrospector,
};
use super::revocation::TokenRevocationHandler;
use crate::AuthResult;
use crate::config::AuthConfig;
use crate::error::{AuthError, ErrorBody, ErrorCode};
use crate::storage::OAuth2Storage;
use crate::token::{
    IntrospectionResponse, Jwks, JwtService, TokenKind, TokenStrategy, TokenTypeHint,
};
use crate::types::request::redirect_with;
use crate::types::{
    Arguments, AuthorizeRequest, AuthorizeResponse, Client, Request, ResponseMode, Session,
    TokenRequest, TokenResponse,
};

// =============================================================================
// Authorize Error
// =============================================================================

/// A failed authorize request.
///
/// Once the redirect URI has been validated the error is delivered to the
/// client through `redirect_url`. Before that point the user agent must not
/// be redirected and `redirect_url` is `None`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct AuthorizeError {
    pub error: AuthError,
    pub redirect_url: Option<Url>,
}

impl AuthorizeError {
    fn direct(error: AuthError) -> Self {
        Self {
            error,
            redirect_url: None,
        }
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }
}

impl From<AuthorizeError> for AuthError {
    fn from(err: AuthorizeError) -> Self {
        err.error
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Runs the authorize, token, introspection and revocation endpoints.
pub struct OAuth2Provider {
    config: Arc<AuthConfig>,
    storage: Arc<dyn OAuth2Storage>,
    jwt: JwtService,
    authorize_handlers: Vec<Arc<dyn AuthorizeEndpointHandler>>,
    token_handlers: Vec<Arc<dyn TokenEndpointHandler>>,
    introspectors: Vec<Arc<dyn TokenIntrospector>>,
    revocation: TokenRevocationHandler,
}

impl OAuth2Provider {
    /// Creates a provider without handlers. Use [`super::compose`] for the
    /// standard chain.
    #[must_use]
    pub fn new(
        config: Arc<AuthConfig>,
        storage: Arc<dyn OAuth2Storage>,
        strategy: Arc<dyn TokenStrategy>,
        jwt: JwtService,
    ) -> Self {
        let revocation = TokenRevocationHandler::new(strategy, Arc::clone(&storage));
        Self {
            config,
            storage,
            jwt,
            authorize_handlers: Vec::new(),
            token_handlers: Vec::new(),
            introspectors: Vec::new(),
            revocation,
        }
    }

    /// Appends an authorize endpoint handler. Handlers run in the order added.
    #[must_use]
    pub fn with_authorize_handler(mut self, handler: Arc<dyn AuthorizeEndpointHandler>) -> Self {
        self.authorize_handlers.push(handler);
        self
    }

    /// Appends a token endpoint handler.
    #[must_use]
    pub fn with_token_handler(mut self, handler: Arc<dyn TokenEndpointHandler>) -> Self {
        self.token_handlers.push(handler);
        self
    }

    #[must_use]
    pub fn with_introspector(mut self, introspector: Arc<dyn TokenIntrospector>) -> Self {
        self.introspectors.push(introspector);
        self
    }

    #[must_use]
    pub fn config(&self) -> &Arc<AuthConfig> {
        &self.config
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn OAuth2Storage> {
        &self.storage
    }

    /// Public keys of the signing key provider.
    #[must_use]
    pub fn jwks(&self) -> Jwks {
        self.jwt.jwks()
    }

    /// Serializable error body, with debug details only when configured.
    #[must_use]
    pub fn error_body(&self, err: &AuthError) -> ErrorBody {
        err.to_body(self.config.oauth.send_debug_messages)
    }

    // -------------------------------------------------------------------------
    // Authorize endpoint
    // -------------------------------------------------------------------------

    /// Parses and validates an authorize request.
    ///
    /// # Errors
    ///
    /// Client and redirect URI problems are returned without a redirect.
    /// Every later failure carries the redirect that reports it to the client.
    pub async fn new_authorize_request(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<AuthorizeRequest, AuthorizeError> {
        let client = self
            .load_client(param(params, "client_id"))
            .await
            .map_err(AuthorizeError::direct)?;
        let redirect_uri =
            resolve_redirect_uri(&client, param(params, "redirect_uri")).map_err(AuthorizeError::direct)?;

        let mut request = Request::new(client);
        request.form = params.clone();
        request.requested_scope = Arguments::from_space_delimited(param(params, "scope").unwrap_or(""));
        request.requested_audience =
            Arguments::from_space_delimited(param(params, "audience").unwrap_or(""));

        let response_types =
            Arguments::from_space_delimited(param(params, "response_type").unwrap_or(""));
        let mut ar = AuthorizeRequest::new(request, response_types, redirect_uri);
        ar.state = param(params, "state").unwrap_or("").to_string();
        ar.prompt = Arguments::from_space_delimited(param(params, "prompt").unwrap_or(""));
        ar.nonce = param(params, "nonce").map(String::from);
        ar.code_challenge = param(params, "code_challenge").map(String::from);
        ar.code_challenge_method = param(params, "code_challenge_method").map(String::from);

        match ResponseMode::parse(param(params, "response_mode").unwrap_or("")) {
            Some(mode) => ar.response_mode = mode,
            None => {
                let err = AuthError::unsupported_response_mode(
                    "The requested response mode is not supported by this server.",
                );
                return Err(self.redirect_error(&ar, err));
            }
        }

        if let Err(err) = self.validate_authorize_parameters(&mut ar) {
            return Err(self.redirect_error(&ar, err));
        }

        let mut outcome = HandlerOutcome::NotApplicable;
        for handler in &self.authorize_handlers {
            match handler.handle_authorize_request(&mut ar).await {
                Ok(handled) => outcome = outcome.or(handled),
                Err(err) => return Err(self.redirect_error(&ar, err)),
            }
        }
        if !outcome.is_applied() {
            let err = AuthError::unsupported_response_type(format!(
                "The response type '{}' is not supported.",
                ar.response_types
            ));
            return Err(self.redirect_error(&ar, err));
        }

        tracing::debug!(
            client_id = %ar.request.client.client_id,
            request_id = %ar.request.id,
            response_type = %ar.response_types,
            scope = %ar.request.requested_scope,
            "Authorize request accepted"
        );
        Ok(ar)
    }

    /// Issues the authorize response once the user authenticated and
    /// consented. `session` describes the user and the granted scope must
    /// already be recorded on `ar.request`.
    ///
    /// # Errors
    ///
    /// Returns a handler error, or `unsupported_response_type` if some
    /// requested response type was left unhandled.
    pub async fn new_authorize_response(
        &self,
        ar: &mut AuthorizeRequest,
        session: Session,
    ) -> AuthResult<AuthorizeResponse> {
        ar.request.session = session;
        let mut response = AuthorizeResponse::new();
        for handler in &self.authorize_handlers {
            handler.handle_authorize_response(ar, &mut response).await?;
        }
        if !ar.did_handle_all_response_types() {
            return Err(AuthError::unsupported_response_type(format!(
                "Not every requested response type in '{}' could be fulfilled.",
                ar.response_types
            )));
        }

        tracing::debug!(
            client_id = %ar.request.client.client_id,
            request_id = %ar.request.id,
            subject = %ar.request.session.subject,
            "Authorize response issued"
        );
        Ok(response)
    }

    /// Where to send the user agent to report `err` for `ar`.
    #[must_use]
    pub fn authorize_error_redirect(&self, ar: &AuthorizeRequest, err: &AuthError) -> Url {
        let body = self.error_body(err);
        let mut parameters = BTreeMap::new();
        parameters.insert("error".to_string(), body.error);
        parameters.insert("error_description".to_string(), body.error_description);
        if let Some(hint) = body.error_hint {
            parameters.insert("error_hint".to_string(), hint);
        }
        if let Some(debug) = body.error_debug {
            parameters.insert("error_debug".to_string(), debug);
        }
        if !ar.state.is_empty() {
            parameters.insert("state".to_string(), ar.state.clone());
        }
        redirect_with(&ar.redirect_uri, ar.effective_response_mode(), &parameters)
    }

    fn redirect_error(&self, ar: &AuthorizeRequest, error: AuthError) -> AuthorizeError {
        tracing::debug!(
            client_id = %ar.request.client.client_id,
            error = %error.code(),
            "Authorize request rejected"
        );
        AuthorizeError {
            redirect_url: Some(self.authorize_error_redirect(ar, &error)),
            error,
        }
    }

    fn validate_authorize_parameters(&self, ar: &mut AuthorizeRequest) -> AuthResult<()> {
        if ar.response_types.is_empty() {
            return Err(AuthError::invalid_request(
                "The 'response_type' parameter is missing.",
            ));
        }
        let min_entropy = self.config.oauth.min_parameter_entropy;
        if ar.state.len() < min_entropy {
            return Err(AuthError::invalid_request(format!(
                "Request parameter 'state' must be at least {min_entropy} characters long to ensure sufficient entropy."
            )));
        }
        if let Some(raw) = ar.request.form_value("max_age") {
            let max_age = raw.parse::<i64>().ok().filter(|age| *age >= 0).ok_or_else(|| {
                AuthError::invalid_request("The 'max_age' parameter must be a non-negative integer.")
            })?;
            ar.max_age = Some(max_age);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Token endpoint
    // -------------------------------------------------------------------------

    /// Authenticates the client and validates a token request.
    ///
    /// # Errors
    ///
    /// `invalid_request` without `grant_type`, `invalid_client` on failed
    /// client authentication, a handler error, or `unsupported_grant_type`
    /// when no handler accepts the grant.
    pub async fn new_token_request(
        &self,
        params: &BTreeMap<String, String>,
        basic_auth: Option<(&str, &str)>,
    ) -> AuthResult<TokenRequest> {
        let grant_type = param(params, "grant_type")
            .ok_or_else(|| AuthError::invalid_request("The 'grant_type' parameter is missing."))?;
        let authenticated = self.authenticate_client(params, basic_auth).await?;

        let mut request = Request::new(authenticated.client);
        request.form = params.clone();
        request.requested_scope = Arguments::from_space_delimited(param(params, "scope").unwrap_or(""));
        request.requested_audience =
            Arguments::from_space_delimited(param(params, "audience").unwrap_or(""));

        let mut tr = TokenRequest::new(request, Arguments::from_space_delimited(grant_type));
        tr.code = param(params, "code").map(String::from);
        tr.code_verifier = param(params, "code_verifier").map(String::from);
        tr.redirect_uri = param(params, "redirect_uri").map(String::from);
        tr.refresh_token = param(params, "refresh_token").map(String::from);

        let mut outcome = HandlerOutcome::NotApplicable;
        for handler in &self.token_handlers {
            outcome = outcome.or(handler.handle_token_request(&mut tr).await?);
        }
        if !outcome.is_applied() {
            return Err(AuthError::unsupported_grant_type(format!(
                "The authorization grant type '{grant_type}' is not supported by this server."
            )));
        }

        tracing::debug!(
            client_id = %tr.request.client.client_id,
            request_id = %tr.request.id,
            grant_type = %grant_type,
            auth_method = %authenticated.auth_method,
            "Token request accepted"
        );
        Ok(tr)
    }

    /// Issues the tokens for a validated token request.
    ///
    /// # Errors
    ///
    /// Returns a handler error, or `server_error` if no handler issued a
    /// response.
    pub async fn new_token_response(&self, tr: &mut TokenRequest) -> AuthResult<TokenResponse> {
        let mut response = TokenResponse::default();
        let mut outcome = HandlerOutcome::NotApplicable;
        for handler in &self.token_handlers {
            outcome = outcome.or(handler.handle_token_response(tr, &mut response).await?);
        }
        if !outcome.is_applied() {
            return Err(AuthError::server_error(format!(
                "no handler issued a response for grant type '{}'",
                tr.grant_types
            )));
        }
        Ok(response)
    }

    /// Authenticates the client of a token or revocation request.
    ///
    /// # Errors
    ///
    /// Returns `invalid_client` when authentication fails.
    pub async fn authenticate_client(
        &self,
        params: &BTreeMap<String, String>,
        basic_auth: Option<(&str, &str)>,
    ) -> AuthResult<AuthenticatedClient> {
        authenticate_client(params, basic_auth, self.storage.as_ref()).await
    }

    // -------------------------------------------------------------------------
    // Introspection and revocation
    // -------------------------------------------------------------------------

    /// Introspects `token`. Every failure is reported as inactive.
    pub async fn introspect_token(
        &self,
        token: &str,
        hint: Option<TokenTypeHint>,
    ) -> IntrospectionResponse {
        let hint = hint.unwrap_or_default();
        for introspector in &self.introspectors {
            match introspector.introspect_token(token, hint).await {
                Ok(Introspection::Active(kind, request)) => {
                    let expires_at = self.expires_at(kind, &request);
                    return IntrospectionResponse::from_request(
                        kind,
                        &request,
                        expires_at,
                        &self.config.issuer,
                    );
                }
                Ok(Introspection::NotApplicable) => {}
                Err(err) => {
                    tracing::debug!(error = %err.code(), "Introspected token is inactive");
                    return IntrospectionResponse::inactive();
                }
            }
        }
        IntrospectionResponse::inactive()
    }

    fn expires_at(&self, kind: TokenKind, request: &Request) -> OffsetDateTime {
        request
            .session
            .expires_at(kind)
            .unwrap_or_else(|| request.requested_at + self.config.oauth.lifetime(kind))
    }

    /// Authenticates the client and revokes the token named in `params`
    /// together with its family.
    ///
    /// # Errors
    ///
    /// `invalid_client`, `invalid_request` without `token`,
    /// `unauthorized_client` for another client's token, or `server_error`.
    pub async fn revoke_token(
        &self,
        params: &BTreeMap<String, String>,
        basic_auth: Option<(&str, &str)>,
    ) -> AuthResult<()> {
        let authenticated = self.authenticate_client(params, basic_auth).await?;
        let token = param(params, "token")
            .ok_or_else(|| AuthError::invalid_request("The 'token' parameter is missing."))?;
        let hint = match param(params, "token_type_hint") {
            Some("refresh_token") => TokenTypeHint::RefreshToken,
            _ => TokenTypeHint::AccessToken,
        };
        self.revocation
            .revoke_token(&authenticated.client, token, hint)
            .await
    }

    async fn load_client(&self, client_id: Option<&str>) -> AuthResult<Client> {
        let client_id = client_id
            .ok_or_else(|| AuthError::invalid_request("The 'client_id' parameter is missing."))?;
        match self.storage.find_by_client_id(client_id).await? {
            Some(client) if client.active => Ok(client),
            _ => Err(AuthError::invalid_client(
                "The requested OAuth 2.0 Client does not exist.",
            )),
        }
    }
}

/// Non-empty parameter value.
fn param<'a>(params: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// The redirect URI named by the request, or the single registered one.
fn resolve_redirect_uri(client: &Client, requested: Option<&str>) -> AuthResult<Url> {
    let raw = match requested {
        Some(raw) if client.is_redirect_uri_allowed(raw) => raw,
        Some(_) => {
            return Err(AuthError::invalid_request(
                "The 'redirect_uri' parameter does not match any of the OAuth 2.0 Client's pre-registered redirect urls.",
            ));
        }
        None => match client.redirect_uris.as_slice() {
            [only] => only.as_str(),
            _ => {
                return Err(AuthError::invalid_request(
                    "The 'redirect_uri' parameter is required when the client has more than one registered redirect URI.",
                ));
            }
        },
    };
    let url = Url::parse(raw).map_err(|e| {
        AuthError::invalid_request("The 'redirect_uri' parameter is malformed.")
            .with_debug(e.to_string())
    })?;
    if url.fragment().is_some() {
        return Err(AuthError::invalid_request(
            "The 'redirect_uri' parameter must not contain a fragment.",
        ));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::compose;
    use crate::storage::MemoryStore;
    use crate::token::{SigningKeyPair, StaticKeyProvider};

    fn client() -> Client {
        Client::new("spa", "SPA")
            .with_redirect_uris(["https://spa.example.com/cb"])
            .with_scopes(["openid", "offline", "profile"])
    }

    fn provider() -> OAuth2Provider {
        let mut config = AuthConfig::default();
        config.issuer = "https://auth.example.com".to_string();
        config.tokens.secret = "p".repeat(64);
        let store = MemoryStore::new().with_client(client()).with_client(
            Client::new("multi", "Multi")
                .with_redirect_uris(["https://a.example.com/cb", "https://b.example.com/cb"]),
        );
        let key = SigningKeyPair::generate_ec().unwrap();
        compose(
            Arc::new(config),
            Arc::new(store),
            Arc::new(StaticKeyProvider::new(key)),
        )
        .unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_client_is_not_redirected() {
        let p = provider();
        let err = p
            .new_authorize_request(&params(&[("client_id", "nobody"), ("response_type", "code")]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidClient);
        assert!(err.redirect_url.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_redirect_is_not_redirected() {
        let p = provider();
        let err = p
            .new_authorize_request(&params(&[
                ("client_id", "spa"),
                ("redirect_uri", "https://evil.example.com/cb"),
                ("response_type", "code"),
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert!(err.redirect_url.is_none());

        let err = p
            .new_authorize_request(&params(&[("client_id", "multi"), ("response_type", "code")]))
            .await
            .unwrap_err();
        assert!(err.redirect_url.is_none());
    }

    #[tokio::test]
    async fn test_single_redirect_uri_is_default() {
        let p = provider();
        let ar = p
            .new_authorize_request(&params(&[
                ("client_id", "spa"),
                ("response_type", "code"),
                ("scope", "profile"),
                ("state", "statestate"),
            ]))
            .await
            .unwrap();
        assert_eq!(ar.redirect_uri.as_str(), "https://spa.example.com/cb");
        assert_eq!(ar.state, "statestate");
    }

    #[tokio::test]
    async fn test_short_state_redirects_with_error() {
        let p = provider();
        let err = p
            .new_authorize_request(&params(&[
                ("client_id", "spa"),
                ("response_type", "code"),
                ("state", "short"),
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        let url = err.redirect_url.unwrap();
        assert!(url.as_str().starts_with("https://spa.example.com/cb?"));
        assert!(url.query_pairs().any(|(k, v)| k == "error" && v == "invalid_request"));
        assert!(url.query_pairs().any(|(k, v)| k == "state" && v == "short"));
    }

    #[tokio::test]
    async fn test_unknown_response_type_and_mode() {
        let p = provider();
        let err = p
            .new_authorize_request(&params(&[
                ("client_id", "spa"),
                ("response_type", "token"),
                ("state", "statestate"),
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedResponseType);

        let err = p
            .new_authorize_request(&params(&[
                ("client_id", "spa"),
                ("response_type", "code"),
                ("response_mode", "web_message"),
                ("state", "statestate"),
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedResponseMode);
        assert!(err.redirect_url.is_some());
    }

    #[tokio::test]
    async fn test_fragment_mode_error_redirect() {
        let p = provider();
        let mut ar = p
            .new_authorize_request(&params(&[
                ("client_id", "spa"),
                ("response_type", "code"),
                ("state", "statestate"),
            ]))
            .await
            .unwrap();
        ar.response_mode = ResponseMode::Fragment;
        let url = p.authorize_error_redirect(&ar, &AuthError::access_denied("nope"));
        let fragment = url.fragment().unwrap();
        assert!(fragment.contains("error=access_denied"));
        assert!(fragment.contains("state=statestate"));
        assert!(!fragment.contains("error_debug"));
    }

    #[tokio::test]
    async fn test_token_request_requires_grant_type() {
        let p = provider();
        let err = p
            .new_token_request(&params(&[("client_id", "spa")]), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);

        let err = p
            .new_token_request(&params(&[("client_id", "spa"), ("grant_type", "password")]), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedGrantType);
    }

    #[tokio::test]
    async fn test_unknown_token_introspects_inactive() {
        let p = provider();
        let response = p.introspect_token("garbage", None).await;
        assert!(!response.active);
        assert_eq!(response, IntrospectionResponse::inactive());
    }

    #[tokio::test]
    async fn test_revoke_requires_token() {
        let p = provider();
        let err = p
            .revoke_token(&params(&[("client_id", "spa")]), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert!(p
            .revoke_token(&params(&[("client_id", "spa"), ("token", "unknown")]), None)
            .await
            .is_ok());
    }

    #[test]
    fn test_error_body_hides_debug_by_default() {
        let p = provider();
        let body = p.error_body(&AuthError::server_error("db down"));
        assert!(body.error_debug.is_none());
        assert_eq!(body.error, "server_error");
    }

    #[test]
    fn test_jwks_has_signing_key() {
        let p = provider();
        assert_eq!(p.jwks().keys.len(), 1);
    }
}
