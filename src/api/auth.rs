//! Operator sign-in and the cookies that identify a terminal.
//!
//! Three cookies are in play: the identity session (`sb-access-token`,
//! `sb-refresh-token`) and the terminal id, which scopes the persisted client
//! state. The terminal cookie outlives sign-out so a terminal keeps its
//! last-selected event across operators.

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{header::SET_COOKIE, request::Parts, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::validate_terminal_id;
use crate::identity::{AuthUser, Session, SignedIn};
use crate::state::ClientState;
use crate::tenant::TenantBinding;
use crate::AppState;

pub const ACCESS_COOKIE: &str = "sb-access-token";
pub const REFRESH_COOKIE: &str = "sb-refresh-token";
pub const TERMINAL_COOKIE: &str = "boxoffice-terminal";

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub user: AuthUser,
    pub tenant: TenantBinding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub user: AuthUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

/// The identity session found in the request cookies, if any.
pub struct OperatorSession(pub Option<Session>);

impl OperatorSession {
    pub fn get(&self) -> Option<&Session> {
        self.0.as_ref()
    }
}

fn session_from_jar(jar: &CookieJar) -> Option<Session> {
    let access_token = jar
        .get(ACCESS_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())?;
    let refresh_token = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());
    Some(Session {
        access_token,
        refresh_token,
    })
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for OperatorSession {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        Ok(OperatorSession(session_from_jar(&jar)))
    }
}

/// Terminal id placed in the request extensions by [`terminal_middleware`].
#[derive(Debug, Clone)]
pub struct TerminalId(pub String);

/// Client state of the calling terminal.
pub struct Terminal(pub ClientState);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Terminal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let id = parts
            .extensions
            .get::<TerminalId>()
            .ok_or_else(|| ApiError::internal("Terminal id missing from request"))?;
        Ok(Terminal(state.terminal(&id.0)))
    }
}

fn session_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .build()
}

fn expired_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, "")).path("/").build()
}

fn with_session(jar: CookieJar, signed_in: &SignedIn, secure: bool) -> CookieJar {
    let jar = jar.add(session_cookie(
        ACCESS_COOKIE,
        signed_in.session.access_token.clone(),
        secure,
    ));
    match &signed_in.session.refresh_token {
        Some(refresh) => jar.add(session_cookie(REFRESH_COOKIE, refresh.clone(), secure)),
        None => jar,
    }
}

/// Makes sure every request carries a terminal id, minting one (and setting
/// the cookie on the way out) when the browser has none or a forged one.
pub async fn terminal_middleware(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let existing = jar
        .get(TERMINAL_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|id| validate_terminal_id(id).is_ok());

    let (terminal_id, minted) = match existing {
        Some(id) => (id, false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };
    request.extensions_mut().insert(TerminalId(terminal_id.clone()));

    let mut response = next.run(request).await;

    if minted {
        let cookie = Cookie::build((TERMINAL_COOKIE, terminal_id))
            .path("/")
            .http_only(true)
            .secure(state.config.cookies.secure)
            .same_site(SameSite::Lax)
            .permanent()
            .build();
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "Failed to encode terminal cookie"),
        }
    }
    response
}

/// Rejects point-of-sale calls that carry no session cookie at all.
pub async fn require_session(
    jar: CookieJar,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let has_session = jar.get(ACCESS_COOKIE).is_some() || jar.get(REFRESH_COOKIE).is_some();
    if !has_session {
        return Err(ApiError::unauthorized("Sign in to continue"));
    }
    Ok(next.run(request).await)
}

/// POST /api/auth/login
///
/// Signs the operator in and binds the terminal to their company. A user
/// without a company is signed straight back out.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Terminal(terminal): Terminal,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if request.email.trim().is_empty() {
        errors.add("email", "Email is required");
    }
    if request.password.is_empty() {
        errors.add("password", "Password is required");
    }
    errors.finish()?;

    let signed_in = state
        .identity
        .sign_in(request.email.trim(), &request.password)
        .await?;

    let tenant = state
        .resolver
        .force_refresh(Some(&signed_in.session), &terminal)
        .await?;

    info!(
        terminal = %terminal.terminal(),
        user_id = %signed_in.user.id,
        company_id = tenant.company_id,
        mode = %tenant.mode,
        "Operator signed in"
    );

    let jar = with_session(jar, &signed_in, state.config.cookies.secure);
    Ok((
        jar,
        Json(LoginResponse {
            user: signed_in.user,
            tenant,
            expires_in: signed_in.expires_in,
        }),
    ))
}

/// POST /api/auth/refresh
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ApiError> {
    let refresh_token = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("No session to refresh"))?;

    let signed_in = state.identity.refresh(&refresh_token).await?;
    let jar = with_session(jar, &signed_in, state.config.cookies.secure);
    Ok((
        jar,
        Json(RefreshResponse {
            user: signed_in.user,
            expires_in: signed_in.expires_in,
        }),
    ))
}

/// POST /api/auth/logout
pub async fn logout(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
    jar: CookieJar,
) -> Result<impl IntoResponse, ApiError> {
    state.resolver.sign_out(session.get(), &terminal).await?;

    let jar = jar
        .remove(expired_cookie(ACCESS_COOKIE))
        .remove(expired_cookie(REFRESH_COOKIE));
    Ok((jar, Json(serde_json::json!({ "redirect": super::error::LOGIN_PATH }))))
}
