//! Drives login and consent for authorize requests.
//!
//! An authorize request passes through [`ConsentStrategy::handle_authorize_request`]
//! up to three times:
//!
//! 1. Without a verifier: a flow is created and the user agent is sent to
//!    the login page with a `login_challenge`.
//! 2. With `login_verifier`: the login outcome is redeemed and the user agent
//!    is sent to the consent page with a `consent_challenge`.
//! 3. With `consent_verifier`: the consent outcome is redeemed and the
//!    request is granted.
//!
//! Remembered logins and consents skip the corresponding page. The login and
//! consent pages talk to the accept/reject operations, which answer with the
//! URL the user agent returns to.

use std::sync::Arc;

use cookie::{Cookie, CookieJar, SameSite};
use time::OffsetDateTime;
use url::Url;

use super::codec::{FlowCodec, FlowPurpose};
use super::{
    Flow, HandledConsentRequest, HandledLoginRequest, LoginSession, RememberedConsent,
    RequestDeniedError, truncate_to_seconds,
};
use crate::AuthResult;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::secret::{constant_time_eq, random_token};
use crate::storage::ConsentStorage;
use crate::types::{Arguments, AuthorizeRequest, IdTokenSession, Session};

/// Bytes of randomness in CSRF tokens and login session ids.
const TOKEN_BYTES: usize = 32;

// =============================================================================
// Outcomes
// =============================================================================

/// What the authorize endpoint should do next.
#[derive(Debug, Clone)]
pub enum ConsentOutcome {
    /// Send the user agent to `location`, setting `cookies`.
    Redirect {
        location: Url,
        cookies: Vec<Cookie<'static>>,
    },
    /// Login and consent are complete.
    Granted(ConsentResult),
}

/// A completed login and consent.
#[derive(Debug, Clone)]
pub struct ConsentResult {
    pub session: Session,
    pub granted_scope: Arguments,
    pub granted_audience: Arguments,
    /// Cookies to set on the final response.
    pub cookies: Vec<Cookie<'static>>,
}

impl ConsentResult {
    /// Records the grant on `ar` and returns the session to issue the
    /// authorize response with.
    pub fn apply_to(&self, ar: &mut AuthorizeRequest) -> Session {
        for scope in self.granted_scope.iter() {
            ar.request.grant_scope(scope);
        }
        for audience in self.granted_audience.iter() {
            ar.request.grant_audience(audience);
        }
        self.session.clone()
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// Login and consent orchestration backed by [`ConsentStorage`].
pub struct ConsentStrategy {
    config: Arc<AuthConfig>,
    codec: FlowCodec,
    storage: Arc<dyn ConsentStorage>,
}

impl ConsentStrategy {
    /// Creates a strategy. Challenges and verifiers are encrypted with a key
    /// derived from `config.tokens.secret`.
    #[must_use]
    pub fn new(config: Arc<AuthConfig>, storage: Arc<dyn ConsentStorage>) -> Self {
        let codec = FlowCodec::new(config.tokens.secret.as_bytes());
        Self {
            config,
            codec,
            storage,
        }
    }

    /// Advances the flow of `ar`.
    ///
    /// `request_url` is the authorize URL the user agent called, without any
    /// verifier. `cookies` are the cookies the user agent sent.
    ///
    /// # Errors
    ///
    /// - `login_required` / `consent_required` for `prompt=none` requests
    ///   that need user interaction
    /// - `invalid_request` for invalid, replayed or CSRF-failing verifiers
    /// - the page-supplied error (default `access_denied`) when the user was
    ///   denied
    pub async fn handle_authorize_request(
        &self,
        ar: &AuthorizeRequest,
        request_url: &str,
        cookies: &CookieJar,
    ) -> AuthResult<ConsentOutcome> {
        if let Some(verifier) = ar.request.form_value("consent_verifier") {
            return self.verify_consent(ar, verifier, cookies).await;
        }
        if let Some(verifier) = ar.request.form_value("login_verifier") {
            return self.verify_authentication(ar, verifier, cookies).await;
        }
        self.request_authentication(ar, request_url, cookies).await
    }

    // -------------------------------------------------------------------------
    // Login leg
    // -------------------------------------------------------------------------

    async fn request_authentication(
        &self,
        ar: &AuthorizeRequest,
        request_url: &str,
        cookies: &CookieJar,
    ) -> AuthResult<ConsentOutcome> {
        let prompt_none = ar.prompt.has("none");
        if prompt_none && ar.prompt.len() > 1 {
            return Err(AuthError::invalid_request(
                "Parameter 'prompt' was set to 'none', but contains other values as well which is not allowed.",
            ));
        }

        let now = OffsetDateTime::now_utc();
        let remembered = self.remembered_login(cookies, now).await?;
        let reauthenticate = ar.prompt.has("login")
            || match (&remembered, ar.max_age) {
                (Some(session), Some(max_age)) => session
                    .authenticated_at
                    .checked_add(time::Duration::seconds(max_age))
                    .is_some_and(|deadline| deadline < now),
                _ => false,
            };

        let mut flow = Flow::new(ar, request_url);
        match remembered {
            Some(session) if !reauthenticate => {
                flow.login_skip = true;
                flow.subject = session.subject.clone();
                flow.session_id = session.id.clone();
                flow.login_authenticated_at = Some(session.authenticated_at);
                flow.handle_login_request(&HandledLoginRequest::accept(&session.subject))?;
                flow.invalidate_login_request()?;
                tracing::debug!(
                    flow_id = %flow.id,
                    client_id = %flow.client_id,
                    subject = %flow.subject,
                    "Remembered login session reused"
                );
                self.request_consent(ar, flow, Vec::new()).await
            }
            _ if prompt_none => Err(AuthError::login_required(
                "Prompt 'none' was requested, but no existing login session was found.",
            )),
            _ => {
                flow.login_csrf = random_token(TOKEN_BYTES);
                flow.login_challenge = self.codec.encode(&flow, FlowPurpose::LoginChallenge)?;
                self.storage.save_flow(&flow).await?;

                let location = page_url(
                    &self.config.flow.login_url,
                    "login_challenge",
                    &flow.login_challenge,
                )?;
                let csrf = self.csrf_cookie(&self.config.flow.login_csrf_cookie, &flow.login_csrf);
                tracing::debug!(
                    flow_id = %flow.id,
                    client_id = %flow.client_id,
                    "Redirecting to login page"
                );
                Ok(ConsentOutcome::Redirect {
                    location,
                    cookies: vec![csrf],
                })
            }
        }
    }

    async fn remembered_login(
        &self,
        cookies: &CookieJar,
        now: OffsetDateTime,
    ) -> AuthResult<Option<LoginSession>> {
        let Some(cookie) = cookies.get(&self.config.flow.session_cookie) else {
            return Ok(None);
        };
        let session = self.storage.get_login_session(cookie.value()).await?;
        Ok(session.filter(|s| s.remember && !s.is_expired(now)))
    }

    async fn verify_authentication(
        &self,
        ar: &AuthorizeRequest,
        verifier: &str,
        cookies: &CookieJar,
    ) -> AuthResult<ConsentOutcome> {
        let redeemed = self.redeem(verifier, FlowPurpose::LoginVerifier, ar).await?;
        check_csrf(cookies, &self.config.flow.login_csrf_cookie, &redeemed.login_csrf)?;

        let mut flow = redeemed.clone();
        flow.invalidate_login_request()?;
        self.claim(&redeemed, &flow, FlowPurpose::LoginVerifier).await?;
        if let Some(error) = flow.login_error.clone() {
            tracing::debug!(flow_id = %flow.id, error = %error.error, "Login was denied");
            return Err(error.to_auth_error());
        }

        let mut out_cookies = vec![removal_cookie(&self.config.flow.login_csrf_cookie)];
        if flow.login_remember && !flow.login_skip {
            let session = self.remember_login(&flow).await?;
            flow.session_id = session.id.clone();
            out_cookies.push(self.session_cookie(&session));
        }
        self.request_consent(ar, flow, out_cookies).await
    }

    async fn remember_login(&self, flow: &Flow) -> AuthResult<LoginSession> {
        let authenticated_at = flow
            .login_authenticated_at
            .unwrap_or_else(|| truncate_to_seconds(OffsetDateTime::now_utc()));
        let session = LoginSession {
            id: random_token(TOKEN_BYTES),
            subject: flow.subject.clone(),
            authenticated_at,
            expires_at: remember_until(authenticated_at, flow.login_remember_for),
            remember: true,
        };
        self.storage.save_login_session(&session).await?;
        Ok(session)
    }

    // -------------------------------------------------------------------------
    // Consent leg
    // -------------------------------------------------------------------------

    async fn request_consent(
        &self,
        ar: &AuthorizeRequest,
        mut flow: Flow,
        mut cookies: Vec<Cookie<'static>>,
    ) -> AuthResult<ConsentOutcome> {
        flow.start_consent()?;

        let now = OffsetDateTime::now_utc();
        let remembered = if ar.prompt.has("consent") {
            None
        } else {
            self.storage
                .find_remembered_consent(&flow.subject, &flow.client_id)
                .await?
                .filter(|c| c.covers(&flow.requested_scope, &flow.requested_audience, now))
        };

        if remembered.is_some() {
            flow.consent_skip = true;
            let handled = HandledConsentRequest::grant(flow.requested_scope.as_slice().to_vec())
                .with_audience(flow.requested_audience.as_slice().to_vec());
            flow.handle_consent_request(&handled)?;
            flow.invalidate_consent_request()?;
            return self.finish(flow, cookies).await;
        }
        if ar.prompt.has("none") {
            return Err(AuthError::consent_required(
                "Prompt 'none' was requested, but no previous consent was found.",
            ));
        }

        flow.consent_csrf = random_token(TOKEN_BYTES);
        flow.consent_challenge = self.codec.encode(&flow, FlowPurpose::ConsentChallenge)?;
        self.storage.save_flow(&flow).await?;

        let location = page_url(
            &self.config.flow.consent_url,
            "consent_challenge",
            &flow.consent_challenge,
        )?;
        cookies.push(self.csrf_cookie(&self.config.flow.consent_csrf_cookie, &flow.consent_csrf));
        tracing::debug!(
            flow_id = %flow.id,
            client_id = %flow.client_id,
            subject = %flow.subject,
            "Redirecting to consent page"
        );
        Ok(ConsentOutcome::Redirect {
            location,
            cookies,
        })
    }

    async fn verify_consent(
        &self,
        ar: &AuthorizeRequest,
        verifier: &str,
        cookies: &CookieJar,
    ) -> AuthResult<ConsentOutcome> {
        let redeemed = self.redeem(verifier, FlowPurpose::ConsentVerifier, ar).await?;
        check_csrf(cookies, &self.config.flow.consent_csrf_cookie, &redeemed.consent_csrf)?;

        let mut flow = redeemed.clone();
        flow.invalidate_consent_request()?;
        self.claim(&redeemed, &flow, FlowPurpose::ConsentVerifier).await?;
        if let Some(error) = flow.consent_error.clone() {
            tracing::debug!(flow_id = %flow.id, error = %error.error, "Consent was denied");
            return Err(error.to_auth_error());
        }

        if flow.consent_remember {
            let handled_at = flow
                .consent_handled_at
                .unwrap_or_else(|| truncate_to_seconds(OffsetDateTime::now_utc()));
            let consent = RememberedConsent {
                subject: flow.subject.clone(),
                client_id: flow.client_id.clone(),
                granted_scope: flow.granted_scope.clone(),
                granted_audience: flow.granted_audience.clone(),
                handled_at,
                expires_at: remember_until(handled_at, flow.consent_remember_for),
            };
            self.storage.remember_consent(&consent).await?;
        }

        let cookies = vec![removal_cookie(&self.config.flow.consent_csrf_cookie)];
        self.finish(flow, cookies).await
    }

    async fn finish(
        &self,
        flow: Flow,
        cookies: Vec<Cookie<'static>>,
    ) -> AuthResult<ConsentOutcome> {
        self.storage.save_flow(&flow).await?;

        let mut session = Session::new(flow.subject.clone()).with_id_token(IdTokenSession {
            auth_time: flow.login_authenticated_at,
            acr: flow.acr.clone(),
            amr: flow.amr.clone(),
            ..IdTokenSession::default()
        });
        session.extra = flow.session_extra.clone();

        tracing::info!(
            flow_id = %flow.id,
            client_id = %flow.client_id,
            subject = %flow.subject,
            login_skipped = flow.login_skip,
            consent_skipped = flow.consent_skip,
            scope = %flow.granted_scope,
            "Login and consent flow completed"
        );
        Ok(ConsentOutcome::Granted(ConsentResult {
            session,
            granted_scope: flow.granted_scope,
            granted_audience: flow.granted_audience,
            cookies,
        }))
    }

    // -------------------------------------------------------------------------
    // Login and consent page operations
    // -------------------------------------------------------------------------

    /// Loads the flow behind a login challenge.
    ///
    /// # Errors
    ///
    /// `invalid_request` for an invalid, expired or already handled
    /// challenge, `not_found` if the flow is gone.
    pub async fn get_login_request(&self, challenge: &str) -> AuthResult<Flow> {
        let flow = self.load_challenge(challenge, FlowPurpose::LoginChallenge).await?;
        if flow.login_was_handled {
            return Err(AuthError::invalid_request(
                "The login request was already handled.",
            ));
        }
        Ok(flow)
    }

    /// Records a successful login and returns the URL the user agent goes
    /// back to.
    ///
    /// # Errors
    ///
    /// See [`ConsentStrategy::get_login_request`]; also fails on a subject
    /// conflict.
    pub async fn accept_login_request(
        &self,
        challenge: &str,
        handled: HandledLoginRequest,
    ) -> AuthResult<Url> {
        self.handle_login(challenge, &handled).await
    }

    /// Records a denied login.
    ///
    /// # Errors
    ///
    /// See [`ConsentStrategy::get_login_request`].
    pub async fn reject_login_request(
        &self,
        challenge: &str,
        error: RequestDeniedError,
    ) -> AuthResult<Url> {
        self.handle_login(challenge, &HandledLoginRequest::reject(error))
            .await
    }

    async fn handle_login(
        &self,
        challenge: &str,
        handled: &HandledLoginRequest,
    ) -> AuthResult<Url> {
        let loaded = self.get_login_request(challenge).await?;
        let mut flow = loaded.clone();
        flow.handle_login_request(handled)?;
        self.claim(&loaded, &flow, FlowPurpose::LoginChallenge).await?;

        let verifier = self.codec.encode(&flow, FlowPurpose::LoginVerifier)?;
        tracing::debug!(
            flow_id = %flow.id,
            state = %flow.state,
            "Login request handled"
        );
        page_url(&flow.request_url, "login_verifier", &verifier)
    }

    /// Loads the flow behind a consent challenge.
    ///
    /// # Errors
    ///
    /// `invalid_request` for an invalid, expired or already handled
    /// challenge, `not_found` if the flow is gone.
    pub async fn get_consent_request(&self, challenge: &str) -> AuthResult<Flow> {
        let flow = self
            .load_challenge(challenge, FlowPurpose::ConsentChallenge)
            .await?;
        if flow.consent_was_handled {
            return Err(AuthError::invalid_request(
                "The consent request was already handled.",
            ));
        }
        Ok(flow)
    }

    /// Records a consent grant and returns the URL the user agent goes back
    /// to.
    ///
    /// # Errors
    ///
    /// See [`ConsentStrategy::get_consent_request`].
    pub async fn accept_consent_request(
        &self,
        challenge: &str,
        handled: HandledConsentRequest,
    ) -> AuthResult<Url> {
        self.handle_consent(challenge, &handled).await
    }

    /// Records a denied consent.
    ///
    /// # Errors
    ///
    /// See [`ConsentStrategy::get_consent_request`].
    pub async fn reject_consent_request(
        &self,
        challenge: &str,
        error: RequestDeniedError,
    ) -> AuthResult<Url> {
        self.handle_consent(challenge, &HandledConsentRequest::reject(error))
            .await
    }

    async fn handle_consent(
        &self,
        challenge: &str,
        handled: &HandledConsentRequest,
    ) -> AuthResult<Url> {
        let loaded = self.get_consent_request(challenge).await?;
        let mut flow = loaded.clone();
        flow.handle_consent_request(handled)?;
        self.claim(&loaded, &flow, FlowPurpose::ConsentChallenge).await?;

        let verifier = self.codec.encode(&flow, FlowPurpose::ConsentVerifier)?;
        tracing::debug!(
            flow_id = %flow.id,
            state = %flow.state,
            "Consent request handled"
        );
        page_url(&flow.request_url, "consent_verifier", &verifier)
    }

    // -------------------------------------------------------------------------
    // Lookup helpers
    // -------------------------------------------------------------------------

    /// Decodes `encoded` and returns the stored flow it points to.
    async fn load(&self, encoded: &str, purpose: FlowPurpose) -> AuthResult<Flow> {
        let decoded = self.codec.decode(encoded, purpose)?;
        let flow = self
            .storage
            .get_flow(&decoded.id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("The {purpose} does not exist.")))?;

        let expires_at = flow.requested_at + self.config.flow.lifetime();
        if expires_at < OffsetDateTime::now_utc() {
            return Err(AuthError::invalid_request(format!("The {purpose} has expired.")));
        }
        Ok(flow)
    }

    async fn load_challenge(&self, challenge: &str, purpose: FlowPurpose) -> AuthResult<Flow> {
        let flow = self.load(challenge, purpose).await?;
        let current = match purpose {
            FlowPurpose::LoginChallenge => &flow.login_challenge,
            _ => &flow.consent_challenge,
        };
        if !constant_time_eq(current, challenge) {
            return Err(AuthError::invalid_request(format!(
                "The {purpose} is no longer valid."
            )));
        }
        Ok(flow)
    }

    /// Stores `next` if the flow is still as `loaded`; a concurrent request
    /// that got there first wins.
    async fn claim(&self, loaded: &Flow, next: &Flow, purpose: FlowPurpose) -> AuthResult<()> {
        if self.storage.replace_flow(loaded, next).await? {
            return Ok(());
        }
        tracing::warn!(flow_id = %loaded.id, %purpose, "Concurrent use of a flow rejected");
        Err(AuthError::invalid_request(format!(
            "The {purpose} has already been used."
        )))
    }

    async fn redeem(
        &self,
        verifier: &str,
        purpose: FlowPurpose,
        ar: &AuthorizeRequest,
    ) -> AuthResult<Flow> {
        let flow = self.load(verifier, purpose).await?;
        if flow.client_id != ar.request.client.client_id {
            return Err(AuthError::invalid_request(format!(
                "The {purpose} was issued to a different OAuth 2.0 Client."
            )));
        }
        Ok(flow)
    }

    // -------------------------------------------------------------------------
    // Cookies
    // -------------------------------------------------------------------------

    fn secure_cookies(&self) -> bool {
        self.config.issuer.starts_with("https://")
    }

    fn csrf_cookie(&self, name: &str, value: &str) -> Cookie<'static> {
        Cookie::build((name.to_string(), value.to_string()))
            .http_only(true)
            .secure(self.secure_cookies())
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(self.config.flow.lifetime())
            .build()
    }

    fn session_cookie(&self, session: &LoginSession) -> Cookie<'static> {
        let mut builder = Cookie::build((self.config.flow.session_cookie.clone(), session.id.clone()))
            .http_only(true)
            .secure(self.secure_cookies())
            .same_site(SameSite::Lax)
            .path("/");
        if let Some(expires_at) = session.expires_at {
            builder = builder.max_age(expires_at - OffsetDateTime::now_utc());
        }
        builder.build()
    }
}

/// Expiry of a remembered login or consent. `None` for no limit, also when
/// `remember_for` runs past the representable range.
fn remember_until(from: OffsetDateTime, remember_for: i64) -> Option<OffsetDateTime> {
    if remember_for <= 0 {
        return None;
    }
    from.checked_add(time::Duration::seconds(remember_for))
}

fn removal_cookie(name: &str) -> Cookie<'static> {
    let mut cookie = Cookie::build((name.to_string(), String::new()))
        .path("/")
        .build();
    cookie.make_removal();
    cookie
}

fn check_csrf(cookies: &CookieJar, name: &str, expected: &str) -> AuthResult<()> {
    match cookies.get(name) {
        Some(cookie) if !expected.is_empty() && constant_time_eq(cookie.value(), expected) => {
            Ok(())
        }
        _ => Err(AuthError::invalid_request(
            "No CSRF value available in the session cookie.",
        )
        .with_debug(format!("the '{name}' cookie is missing or does not match the flow"))),
    }
}

/// `base` with `key=value` appended to its query.
fn page_url(base: &str, key: &str, value: &str) -> AuthResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| AuthError::server_error(format!("invalid flow URL '{base}': {e}")))?;
    url.query_pairs_mut().append_pair(key, value);
    Ok(url)
}
