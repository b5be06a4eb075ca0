//! Login and consent flows.
//!
//! A [`Flow`] records one authorization attempt while the user is away at
//! the external login and consent pages. It travels through two legs:
//!
//! ```text
//! LoginInitialized -> LoginAuthenticated | LoginError -> LoginHandled
//! ConsentInitialized -> ConsentGranted | ConsentError -> ConsentHandled
//! ```
//!
//! Only one leg is open at a time and the `*_was_handled` flags never go
//! back to `false`. Flows are persisted between legs and carried to the
//! external pages as encrypted challenges and verifiers (see [`codec`]).

pub mod codec;
pub mod strategy;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{AuthError, ErrorCode};
use crate::types::{Arguments, AuthorizeRequest};

pub use codec::{FlowCodec, FlowPurpose};
pub use strategy::{ConsentOutcome, ConsentResult, ConsentStrategy};

// =============================================================================
// Flow State
// =============================================================================

/// State of a flow. Login and consent legs use independent states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    LoginInitialized,
    LoginAuthenticated,
    LoginError,
    LoginHandled,
    ConsentInitialized,
    ConsentGranted,
    ConsentError,
    ConsentHandled,
}

impl FlowState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginInitialized => "login_initialized",
            Self::LoginAuthenticated => "login_authenticated",
            Self::LoginError => "login_error",
            Self::LoginHandled => "login_handled",
            Self::ConsentInitialized => "consent_initialized",
            Self::ConsentGranted => "consent_granted",
            Self::ConsentError => "consent_error",
            Self::ConsentHandled => "consent_handled",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which leg of the flow an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLeg {
    Login,
    Consent,
}

impl fmt::Display for FlowLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login => f.write_str("login"),
            Self::Consent => f.write_str("consent"),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Flow state machine and codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// The leg was already handled; its verifier cannot be redeemed again.
    #[error("the {0} request was already handled")]
    AlreadyHandled(FlowLeg),

    /// The flow is in a state that does not allow the transition.
    #[error("the flow is in state {actual}, which does not allow this {leg} transition")]
    InvalidState { leg: FlowLeg, actual: FlowState },

    /// The authenticated subject differs from the subject already on the flow.
    #[error("subject {asserted} conflicts with the flow subject {current}")]
    SubjectConflict { current: String, asserted: String },

    /// The encoded flow could not be decoded.
    #[error("invalid flow")]
    Invalid,
}

impl From<FlowError> for AuthError {
    fn from(err: FlowError) -> Self {
        AuthError::invalid_request("The login or consent flow is invalid.")
            .with_debug(err.to_string())
    }
}

/// Error recorded by the login or consent page when the user is denied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDeniedError {
    /// OAuth 2.0 error code. Defaults to `access_denied`.
    pub error: String,
    pub error_description: String,
    pub error_hint: String,
}

impl RequestDeniedError {
    #[must_use]
    pub fn access_denied(hint: impl Into<String>) -> Self {
        Self {
            error: ErrorCode::AccessDenied.as_str().to_string(),
            error_description: ErrorCode::AccessDenied.description().to_string(),
            error_hint: hint.into(),
        }
    }

    /// Converts the page-supplied error into the error returned to the client.
    #[must_use]
    pub fn to_auth_error(&self) -> AuthError {
        let code = ErrorCode::parse(&self.error).unwrap_or(ErrorCode::AccessDenied);
        let mut err = AuthError::new(code);
        if !self.error_description.is_empty() {
            err = err.with_description(self.error_description.clone());
        }
        if !self.error_hint.is_empty() {
            err = err.with_hint(self.error_hint.clone());
        }
        err
    }
}

// =============================================================================
// Handled requests
// =============================================================================

/// Result of the login page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandledLoginRequest {
    pub subject: String,
    /// Remember the login in a browser session.
    pub remember: bool,
    /// How long a remembered login lasts, in seconds. `0` means until the
    /// session cookie expires.
    pub remember_for: i64,
    pub acr: Option<String>,
    pub amr: Vec<String>,
    pub error: Option<RequestDeniedError>,
}

impl HandledLoginRequest {
    #[must_use]
    pub fn accept(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn reject(error: RequestDeniedError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn remember_for(mut self, seconds: i64) -> Self {
        self.remember = true;
        self.remember_for = seconds;
        self
    }
}

/// Result of the consent page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandledConsentRequest {
    pub grant_scope: Vec<String>,
    pub grant_audience: Vec<String>,
    /// Remember the grant for this subject and client.
    pub remember: bool,
    /// How long a remembered grant lasts, in seconds. `0` means forever.
    pub remember_for: i64,
    /// Extra claims copied into the session of issued tokens.
    pub session: Map<String, Value>,
    pub error: Option<RequestDeniedError>,
}

impl HandledConsentRequest {
    #[must_use]
    pub fn grant(scope: Vec<String>) -> Self {
        Self {
            grant_scope: scope,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn reject(error: RequestDeniedError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_audience(mut self, audience: Vec<String>) -> Self {
        self.grant_audience = audience;
        self
    }

    #[must_use]
    pub fn remember_for(mut self, seconds: i64) -> Self {
        self.remember = true;
        self.remember_for = seconds;
        self
    }
}

// =============================================================================
// Flow
// =============================================================================

/// One authorization attempt across the login and consent legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    /// Authorize URL the pages redirect back to with a verifier.
    pub request_url: String,
    pub client_id: String,
    pub requested_scope: Arguments,
    pub requested_audience: Arguments,
    pub granted_scope: Arguments,
    pub granted_audience: Arguments,
    pub subject: String,
    /// Browser login session the flow belongs to.
    pub session_id: String,
    #[serde(with = "time::serde::timestamp")]
    pub requested_at: OffsetDateTime,
    pub state: FlowState,

    pub login_challenge: String,
    pub login_csrf: String,
    pub login_skip: bool,
    pub login_remember: bool,
    pub login_remember_for: i64,
    #[serde(with = "time::serde::timestamp::option")]
    pub login_authenticated_at: Option<OffsetDateTime>,
    pub login_error: Option<RequestDeniedError>,
    pub login_was_handled: bool,
    pub acr: Option<String>,
    pub amr: Vec<String>,

    pub consent_challenge: String,
    pub consent_csrf: String,
    pub consent_skip: bool,
    pub consent_remember: bool,
    pub consent_remember_for: i64,
    #[serde(with = "time::serde::timestamp::option")]
    pub consent_handled_at: Option<OffsetDateTime>,
    pub consent_error: Option<RequestDeniedError>,
    pub consent_was_handled: bool,

    /// Extra session claims granted on the consent page.
    pub session_extra: Map<String, Value>,
}

impl Flow {
    /// Starts a flow for an authorize request.
    #[must_use]
    pub fn new(ar: &AuthorizeRequest, request_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            request_url: request_url.into(),
            client_id: ar.request.client.client_id.clone(),
            requested_scope: ar.request.requested_scope.clone(),
            requested_audience: ar.request.requested_audience.clone(),
            granted_scope: Arguments::new(),
            granted_audience: Arguments::new(),
            subject: String::new(),
            session_id: String::new(),
            requested_at: truncate_to_seconds(OffsetDateTime::now_utc()),
            state: FlowState::LoginInitialized,
            login_challenge: String::new(),
            login_csrf: String::new(),
            login_skip: false,
            login_remember: false,
            login_remember_for: 0,
            login_authenticated_at: None,
            login_error: None,
            login_was_handled: false,
            acr: None,
            amr: Vec::new(),
            consent_challenge: String::new(),
            consent_csrf: String::new(),
            consent_skip: false,
            consent_remember: false,
            consent_remember_for: 0,
            consent_handled_at: None,
            consent_error: None,
            consent_was_handled: false,
            session_extra: Map::new(),
        }
    }

    /// Records the outcome of the login page.
    ///
    /// # Errors
    ///
    /// Fails if the login leg was already handled, the flow is not in a
    /// login state, or the subject conflicts with the one on the flow.
    pub fn handle_login_request(&mut self, handled: &HandledLoginRequest) -> Result<(), FlowError> {
        if self.login_was_handled {
            return Err(FlowError::AlreadyHandled(FlowLeg::Login));
        }
        if !matches!(
            self.state,
            FlowState::LoginInitialized | FlowState::LoginAuthenticated | FlowState::LoginError
        ) {
            return Err(FlowError::InvalidState {
                leg: FlowLeg::Login,
                actual: self.state,
            });
        }
        if handled.error.is_none()
            && !self.subject.is_empty()
            && self.subject != handled.subject
        {
            return Err(FlowError::SubjectConflict {
                current: self.subject.clone(),
                asserted: handled.subject.clone(),
            });
        }

        if let Some(error) = &handled.error {
            self.state = FlowState::LoginError;
            self.login_error = Some(error.clone());
        } else {
            self.state = FlowState::LoginAuthenticated;
            self.login_error = None;
            self.subject = handled.subject.clone();
        }

        self.login_remember = handled.remember;
        self.login_remember_for = handled.remember_for;
        self.acr = handled.acr.clone();
        self.amr = handled.amr.clone();

        if self.login_skip {
            self.login_remember = true;
        } else {
            self.login_authenticated_at = Some(truncate_to_seconds(OffsetDateTime::now_utc()));
        }
        Ok(())
    }

    /// Consumes the login verifier.
    ///
    /// # Errors
    ///
    /// Fails if the login leg was already handled or has no outcome yet.
    pub fn invalidate_login_request(&mut self) -> Result<(), FlowError> {
        if self.login_was_handled {
            return Err(FlowError::AlreadyHandled(FlowLeg::Login));
        }
        if !matches!(
            self.state,
            FlowState::LoginAuthenticated | FlowState::LoginError
        ) {
            return Err(FlowError::InvalidState {
                leg: FlowLeg::Login,
                actual: self.state,
            });
        }
        self.state = FlowState::LoginHandled;
        self.login_was_handled = true;
        Ok(())
    }

    /// Opens the consent leg once the login leg has been handled.
    ///
    /// # Errors
    ///
    /// Fails unless the login leg is handled.
    pub fn start_consent(&mut self) -> Result<(), FlowError> {
        if self.state != FlowState::LoginHandled {
            return Err(FlowError::InvalidState {
                leg: FlowLeg::Consent,
                actual: self.state,
            });
        }
        self.state = FlowState::ConsentInitialized;
        Ok(())
    }

    /// Records the outcome of the consent page.
    ///
    /// # Errors
    ///
    /// Fails if the consent leg was already handled or the flow is not in
    /// a consent state.
    pub fn handle_consent_request(
        &mut self,
        handled: &HandledConsentRequest,
    ) -> Result<(), FlowError> {
        if self.consent_was_handled {
            return Err(FlowError::AlreadyHandled(FlowLeg::Consent));
        }
        if !matches!(
            self.state,
            FlowState::ConsentInitialized | FlowState::ConsentGranted | FlowState::ConsentError
        ) {
            return Err(FlowError::InvalidState {
                leg: FlowLeg::Consent,
                actual: self.state,
            });
        }

        if let Some(error) = &handled.error {
            self.state = FlowState::ConsentError;
            self.consent_error = Some(error.clone());
        } else {
            self.state = FlowState::ConsentGranted;
            self.consent_error = None;
            self.granted_scope = handled.grant_scope.iter().cloned().collect();
            self.granted_audience = handled.grant_audience.iter().cloned().collect();
            self.session_extra = handled.session.clone();
        }
        self.consent_remember = handled.remember;
        self.consent_remember_for = handled.remember_for;
        self.consent_handled_at = Some(truncate_to_seconds(OffsetDateTime::now_utc()));
        Ok(())
    }

    /// Consumes the consent verifier.
    ///
    /// # Errors
    ///
    /// Fails if the consent leg was already handled or has no outcome yet.
    pub fn invalidate_consent_request(&mut self) -> Result<(), FlowError> {
        if self.consent_was_handled {
            return Err(FlowError::AlreadyHandled(FlowLeg::Consent));
        }
        if !matches!(
            self.state,
            FlowState::ConsentGranted | FlowState::ConsentError
        ) {
            return Err(FlowError::InvalidState {
                leg: FlowLeg::Consent,
                actual: self.state,
            });
        }
        self.state = FlowState::ConsentHandled;
        self.consent_was_handled = true;
        Ok(())
    }

    /// Both legs are done.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state == FlowState::ConsentHandled
    }
}

// =============================================================================
// Remembered state
// =============================================================================

/// A remembered browser login, referenced by the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginSession {
    pub id: String,
    pub subject: String,
    #[serde(with = "time::serde::timestamp")]
    pub authenticated_at: OffsetDateTime,
    /// `None` lasts until the session is deleted.
    #[serde(with = "time::serde::timestamp::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub remember: bool,
}

impl LoginSession {
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A consent grant remembered for a subject and client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberedConsent {
    pub subject: String,
    pub client_id: String,
    pub granted_scope: Arguments,
    pub granted_audience: Arguments,
    #[serde(with = "time::serde::timestamp")]
    pub handled_at: OffsetDateTime,
    /// `None` never expires.
    #[serde(with = "time::serde::timestamp::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl RememberedConsent {
    /// The grant is still valid and covers every requested scope and
    /// audience.
    #[must_use]
    pub fn covers(&self, scope: &Arguments, audience: &Arguments, now: OffsetDateTime) -> bool {
        if self.expires_at.is_some_and(|at| at <= now) {
            return false;
        }
        scope.iter().all(|s| self.granted_scope.has(s))
            && audience.iter().all(|a| self.granted_audience.has(a))
    }
}

pub(crate) fn truncate_to_seconds(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(0).unwrap_or(at)
}
