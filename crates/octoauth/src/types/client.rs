//! OAuth 2.0 client registration types.

use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Serialize};

// =============================================================================
// Grant Type
// =============================================================================

/// OAuth 2.0 grant types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// Authorization Code flow.
    AuthorizationCode,
    /// Client Credentials flow (confidential clients only).
    ClientCredentials,
    /// Refresh Token flow.
    RefreshToken,
}

impl GrantType {
    /// Returns the OAuth 2.0 grant_type parameter value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken => "refresh_token",
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Response Mode
// =============================================================================

/// How authorization response parameters are returned to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Use the default mode of the response type (query for `code`).
    #[default]
    Default,
    Query,
    Fragment,
    FormPost,
}

impl ResponseMode {
    /// Parses the `response_mode` parameter. An empty value is `Default`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(Self::Default),
            "query" => Some(Self::Query),
            "fragment" => Some(Self::Fragment),
            "form_post" => Some(Self::FormPost),
            _ => None,
        }
    }

    /// Returns the parameter value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "",
            Self::Query => "query",
            Self::Fragment => "fragment",
            Self::FormPost => "form_post",
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// OpenID Connect client metadata.
///
/// A client carrying this metadata may send signed request objects
/// (`request` / `request_uri`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcClientMetadata {
    /// Inline JWKS used to verify request objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwkSet>,

    /// JWKS URI of the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Algorithm the client signs request objects with (`none` allowed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_object_signing_alg: Option<String>,
}

/// OAuth 2.0 client registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// Unique client identifier used in OAuth flows.
    pub client_id: String,

    /// Argon2-hashed client secret (for confidential clients).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Human-readable display name.
    pub name: String,

    /// OAuth 2.0 grant types this client is allowed to use.
    pub grant_types: Vec<GrantType>,

    /// Registered response types, e.g. `code` or `code id_token`.
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,

    /// Registered response modes. Empty allows `query` and the default mode.
    #[serde(default)]
    pub response_modes: Vec<ResponseMode>,

    /// Allowed redirect URIs.
    #[serde(default)]
    pub redirect_uris: Vec<String>,

    /// Scopes this client may request.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Audiences this client may request.
    #[serde(default)]
    pub audience: Vec<String>,

    /// Whether this is a confidential client (has client secret).
    pub confidential: bool,

    /// Whether this client is currently active and can be used.
    pub active: bool,

    /// OpenID Connect metadata, when the client supports request objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcClientMetadata>,
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

impl Client {
    /// Creates an active public client allowed to use the authorization code
    /// grant.
    #[must_use]
    pub fn new(client_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            name: name.into(),
            grant_types: vec![GrantType::AuthorizationCode],
            response_types: default_response_types(),
            response_modes: Vec::new(),
            redirect_uris: Vec::new(),
            scopes: Vec::new(),
            audience: Vec::new(),
            confidential: false,
            active: true,
            oidc: None,
        }
    }

    /// Makes the client confidential with the given secret hash.
    #[must_use]
    pub fn with_secret_hash(mut self, hash: impl Into<String>) -> Self {
        self.client_secret = Some(hash.into());
        self.confidential = true;
        self
    }

    /// Sets the allowed grant types.
    #[must_use]
    pub fn with_grant_types(mut self, grant_types: impl IntoIterator<Item = GrantType>) -> Self {
        self.grant_types = grant_types.into_iter().collect();
        self
    }

    /// Sets the redirect URIs.
    #[must_use]
    pub fn with_redirect_uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redirect_uris = uris.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the allowed scopes.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the allowed audiences.
    #[must_use]
    pub fn with_audience<I, S>(mut self, audience: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.audience = audience.into_iter().map(Into::into).collect();
        self
    }

    /// Attaches OpenID Connect metadata.
    #[must_use]
    pub fn with_oidc(mut self, oidc: OidcClientMetadata) -> Self {
        self.oidc = Some(oidc);
        self
    }

    /// Validates the client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the client configuration is invalid.
    pub fn validate(&self) -> Result<(), ClientValidationError> {
        if self.client_id.is_empty() {
            return Err(ClientValidationError::EmptyClientId);
        }

        if self.name.is_empty() {
            return Err(ClientValidationError::EmptyName);
        }

        if self.grant_types.is_empty() {
            return Err(ClientValidationError::NoGrantTypes);
        }

        if !self.confidential && self.grant_types.contains(&GrantType::ClientCredentials) {
            return Err(ClientValidationError::PublicClientCredentials);
        }

        if self.confidential && self.client_secret.is_none() {
            return Err(ClientValidationError::MissingSecret);
        }

        if self.grant_types.contains(&GrantType::AuthorizationCode) && self.redirect_uris.is_empty()
        {
            return Err(ClientValidationError::NoRedirectUris);
        }

        Ok(())
    }

    /// Returns true for clients without a secret.
    #[must_use]
    pub fn is_public(&self) -> bool {
        !self.confidential
    }

    /// Checks if the given redirect URI is registered for this client.
    #[must_use]
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|allowed| allowed == uri)
    }

    /// Checks if the client may use the given grant type.
    #[must_use]
    pub fn is_grant_type_allowed(&self, grant_type: GrantType) -> bool {
        self.grant_types.contains(&grant_type)
    }

    /// Checks if the given grant type parameter value is allowed.
    #[must_use]
    pub fn is_grant_type_name_allowed(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g.as_str() == grant_type)
    }

    /// Checks if a set of response types is registered. Order of the
    /// space-separated values does not matter.
    #[must_use]
    pub fn is_response_type_allowed(&self, response_types: &[&str]) -> bool {
        self.response_types.iter().any(|registered| {
            let mut registered: Vec<&str> = registered.split_whitespace().collect();
            let mut requested = response_types.to_vec();
            registered.sort_unstable();
            requested.sort_unstable();
            registered == requested
        })
    }

    /// Checks if the response mode is allowed.
    #[must_use]
    pub fn is_response_mode_allowed(&self, mode: ResponseMode) -> bool {
        if mode == ResponseMode::Default {
            return true;
        }
        if self.response_modes.is_empty() {
            return mode == ResponseMode::Query;
        }
        self.response_modes.contains(&mode)
    }

    /// Returns true if the client may send request objects.
    #[must_use]
    pub fn supports_request_objects(&self) -> bool {
        self.oidc.is_some()
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Errors that can occur during client validation.
#[derive(Debug, thiserror::Error)]
pub enum ClientValidationError {
    /// Client ID cannot be empty.
    #[error("Client ID cannot be empty")]
    EmptyClientId,

    /// Client name cannot be empty.
    #[error("Client name cannot be empty")]
    EmptyName,

    /// At least one grant type is required.
    #[error("At least one grant type is required")]
    NoGrantTypes,

    /// Public clients cannot use client_credentials grant.
    #[error("Public clients cannot use client_credentials grant")]
    PublicClientCredentials,

    /// Authorization code flow requires redirect URIs.
    #[error("Authorization code flow requires redirect URIs")]
    NoRedirectUris,

    /// Confidential clients require a client secret.
    #[error("Confidential clients require a client secret")]
    MissingSecret,
}

// =============================================================================
// Tests
// =============================================================================
