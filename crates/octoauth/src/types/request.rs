//! Authorize and token requests and their responses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

use super::arguments::Arguments;
use super::client::{Client, ResponseMode};
use super::session::Session;

/// Form parameters that never leave the request they arrived with.
const SENSITIVE_PARAMETERS: &[&str] = &[
    "client_secret",
    "code",
    "code_verifier",
    "refresh_token",
    "login_verifier",
    "consent_verifier",
    "password",
];

// =============================================================================
// Request
// =============================================================================

/// The part shared by every protocol request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request identity. All tokens issued for one authorization share it.
    pub id: Uuid,
    pub requested_at: OffsetDateTime,
    pub client: Client,
    pub requested_scope: Arguments,
    pub granted_scope: Arguments,
    pub requested_audience: Arguments,
    pub granted_audience: Arguments,
    /// Raw request parameters.
    pub form: BTreeMap<String, String>,
    pub session: Session,
}

impl Request {
    /// Creates a request for `client` with a fresh id.
    #[must_use]
    pub fn new(client: Client) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            requested_at: now.replace_nanosecond(0).unwrap_or(now),
            client,
            requested_scope: Arguments::new(),
            granted_scope: Arguments::new(),
            requested_audience: Arguments::new(),
            granted_audience: Arguments::new(),
            form: BTreeMap::new(),
            session: Session::default(),
        }
    }

    /// Grants a scope.
    pub fn grant_scope(&mut self, scope: impl Into<String>) {
        self.granted_scope.append(scope);
    }

    /// Grants an audience.
    pub fn grant_audience(&mut self, audience: impl Into<String>) {
        self.granted_audience.append(audience);
    }

    /// Returns a form parameter, treating empty values as absent.
    #[must_use]
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Returns a copy without credentials and one-time values in the form,
    /// suitable for persisting.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        let mut request = self.clone();
        request
            .form
            .retain(|k, _| !SENSITIVE_PARAMETERS.contains(&k.as_str()));
        request
    }
}

// =============================================================================
// Authorize Request / Response
// =============================================================================

/// A validated authorization endpoint request.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub request: Request,
    pub response_types: Arguments,
    pub redirect_uri: Url,
    pub state: String,
    pub response_mode: ResponseMode,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub prompt: Arguments,
    pub max_age: Option<i64>,
    pub nonce: Option<String>,
    handled_response_types: Arguments,
}

impl AuthorizeRequest {
    /// Creates an authorize request.
    #[must_use]
    pub fn new(request: Request, response_types: Arguments, redirect_uri: Url) -> Self {
        Self {
            request,
            response_types,
            redirect_uri,
            state: String::new(),
            response_mode: ResponseMode::Default,
            code_challenge: None,
            code_challenge_method: None,
            prompt: Arguments::new(),
            max_age: None,
            nonce: None,
            handled_response_types: Arguments::new(),
        }
    }

    /// Marks a response type as handled by a handler.
    pub fn set_response_type_handled(&mut self, response_type: &str) {
        self.handled_response_types.append(response_type);
    }

    /// Returns true once every requested response type has been handled.
    #[must_use]
    pub fn did_handle_all_response_types(&self) -> bool {
        self.response_types
            .iter()
            .all(|rt| self.handled_response_types.has(rt))
    }

    /// Response mode in effect, resolving `Default` to the response type's
    /// default (query for `code`, fragment otherwise).
    #[must_use]
    pub fn effective_response_mode(&self) -> ResponseMode {
        match self.response_mode {
            ResponseMode::Default if self.response_types.exact("code") => ResponseMode::Query,
            ResponseMode::Default => ResponseMode::Fragment,
            mode => mode,
        }
    }
}

/// Parameters returned to the client's redirect URI.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeResponse {
    parameters: BTreeMap<String, String>,
}

impl AuthorizeResponse {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// The issued authorization code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.parameter("code")
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Builds the redirect URL for the query and fragment response modes.
    /// For `form_post` the parameters are returned unchanged on the URI and
    /// the caller renders the form from [`AuthorizeResponse::parameters`].
    #[must_use]
    pub fn redirect_url(&self, ar: &AuthorizeRequest) -> Url {
        redirect_with(&ar.redirect_uri, ar.effective_response_mode(), &self.parameters)
    }
}

/// Appends `parameters` to `redirect_uri` according to `mode`.
pub(crate) fn redirect_with(
    redirect_uri: &Url,
    mode: ResponseMode,
    parameters: &BTreeMap<String, String>,
) -> Url {
    let mut url = redirect_uri.clone();
    match mode {
        ResponseMode::Fragment => {
            let fragment = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(parameters)
                .finish();
            url.set_fragment(Some(&fragment));
        }
        ResponseMode::FormPost => {}
        ResponseMode::Default | ResponseMode::Query => {
            url.query_pairs_mut().extend_pairs(parameters);
        }
    }
    url
}

// =============================================================================
// Token Request / Response
// =============================================================================

/// A token endpoint request.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub request: Request,
    pub grant_types: Arguments,
    pub code: Option<String>,
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    handled_grant_types: Arguments,
}

impl TokenRequest {
    /// Creates a token request.
    #[must_use]
    pub fn new(request: Request, grant_types: Arguments) -> Self {
        Self {
            request,
            grant_types,
            code: None,
            code_verifier: None,
            redirect_uri: None,
            refresh_token: None,
            handled_grant_types: Arguments::new(),
        }
    }

    /// Marks a grant type as handled.
    pub fn set_grant_type_handled(&mut self, grant_type: &str) {
        self.handled_grant_types.append(grant_type);
    }

    /// Returns true if some handler accepted `grant_type`.
    #[must_use]
    pub fn is_grant_type_handled(&self, grant_type: &str) -> bool {
        self.handled_grant_types.has(grant_type)
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Sets the access token and the `bearer` token type.
    pub fn set_access_token(&mut self, token: String, expires_in: i64) {
        self.access_token = token;
        self.token_type = "bearer".to_string();
        self.expires_in = Some(expires_in);
    }

    /// Sets the `scope` field from granted scopes; empty scopes are omitted.
    pub fn set_scope(&mut self, scope: &Arguments) {
        self.scope = (!scope.is_empty()).then(|| scope.join());
    }
}
