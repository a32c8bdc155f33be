//! HTTP handlers: the browser sign-in flow and the JSON lookup API.
//!
//! The sign-in flow talks to humans and renders small HTML pages; the
//! lookup API talks to other services and speaks JSON. Each surface has
//! its own error type.

use axum::{
    extract::{Path, Query, State},
    http::{header::SET_COOKIE, StatusCode},
    response::{AppendHeaders, Html, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization, Cookie},
    TypedHeader,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::db::{escape_html, DbError};
use crate::deeplink::OP_REGISTER;

/// Binds the provider callback to the browser session that started it.
const STATE_COOKIE: &str = "janus_state";
/// Sign-in must complete within this window.
const STATE_COOKIE_MAX_AGE_SECS: u32 = 600;

const RESTART_TIP: &str = "Go back to the <a href=\"/\">home page</a> and start \
                           over. If the problem persists, contact an administrator.";
const SIGNOUT_TIP: &str = "You probably signed in with the wrong account. Sign \
                           out of every account in your browser, then try again!";
const RECORDED_TIP: &str = "The error has been recorded in the server logs.";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/login", get(login))
        .route("/authorize", get(authorize))
        .route("/api/v1/accounts/:id", get(lookup_account))
        .with_state(state)
}

// ============================================================================
// Sign-in flow
// ============================================================================

async fn index(State(state): State<AppState>) -> Html<String> {
    page(
        "Janus Gate",
        &format!(
            "<p>This service links a <b>{}</b> identity to your Telegram \
             account, so that the bot can let you into the group.</p>\n\
             <p><a href=\"/login\">Sign in</a></p>",
            escape_html(&state.config.institution_domain)
        ),
    )
}

async fn login(State(state): State<AppState>) -> impl IntoResponse {
    let nonce = format!("{:032x}", rand::thread_rng().gen::<u128>());
    let cookie = format!(
        "{STATE_COOKIE}={nonce}; Path=/; Max-Age={STATE_COOKIE_MAX_AGE_SECS}; \
         HttpOnly; SameSite=Lax"
    );
    let url = state.oidc.authorize_url(&nonce);
    (AppendHeaders([(SET_COOKIE, cookie)]), Redirect::to(&url))
}

async fn authorize(
    State(state): State<AppState>,
    cookies: Option<TypedHeader<Cookie>>,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let cookies = cookies.map(|TypedHeader(cookie)| cookie);
    match sign_in(&state, cookies, query).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// The provider callback: verify the state echo, trade the code for
/// claims, check the address, refresh the identity row and hand the
/// browser off to Telegram with a signed deep link.
async fn sign_in(
    state: &AppState,
    cookies: Option<Cookie>,
    query: AuthorizeQuery,
) -> Result<Response, SignInError> {
    if let Some(error) = query.error {
        tracing::warn!(error = %error, "provider refused the sign-in");
        return Err(SignInError::AuthFailed);
    }
    let (Some(code), Some(echoed)) = (query.code.as_deref(), query.state.as_deref()) else {
        return Err(SignInError::MissingParams);
    };
    let expected = cookies.as_ref().and_then(|cookie| cookie.get(STATE_COOKIE));
    if expected != Some(echoed) {
        return Err(SignInError::AuthFailed);
    }

    let claims = state.oidc.exchange(code).await.map_err(|err| {
        tracing::warn!(error = %err, "code exchange failed");
        SignInError::AuthFailed
    })?;
    if !claims.email_verified {
        return Err(SignInError::Unverified);
    }
    let Some(email_prefix) =
        institutional_prefix(&claims.email, &state.config.institution_domain)
    else {
        return Err(SignInError::WrongDomain {
            domain: state.config.institution_domain.clone(),
        });
    };

    let student = state
        .db
        .upsert_student(&email_prefix, &claims.given_name, &claims.family_name)
        .map_err(|err| {
            tracing::error!(error = %err, "identity upsert failed");
            SignInError::Internal
        })?;

    let token = state
        .codec
        .encode(&[OP_REGISTER, &student.email_prefix])
        .map_err(|err| {
            tracing::error!(error = %err, email_prefix = %student.email_prefix,
                "deep-link token build failed");
            SignInError::TokenTooLarge
        })?;

    tracing::info!(email_prefix = %student.email_prefix, "sign-in complete, handing off to Telegram");
    let target = format!("https://t.me/{}?start={token}", state.config.bot_username);
    let clear = format!("{STATE_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax");
    Ok((AppendHeaders([(SET_COOKIE, clear)]), Redirect::to(&target)).into_response())
}

/// Local part of `email` when it belongs to the institutional domain,
/// folded to lowercase. `None` for any other address.
fn institutional_prefix(email: &str, domain: &str) -> Option<String> {
    let email = email.to_lowercase();
    let prefix = email.strip_suffix(&format!("@{}", domain.to_lowercase()))?;
    if prefix.is_empty() {
        return None;
    }
    Some(prefix.to_string())
}

/// Browser-facing failures, rendered as small HTML tip pages.
#[derive(Debug)]
enum SignInError {
    /// The callback arrived without the query parameters the flow needs.
    MissingParams,
    /// State echo mismatch, a provider `error=` response, or a failed
    /// code exchange. One page for all of them.
    AuthFailed,
    /// The provider says the address is not verified.
    Unverified,
    /// The address belongs to some other domain.
    WrongDomain { domain: String },
    /// The signed payload does not fit in a Telegram deep link.
    TokenTooLarge,
    Internal,
}

impl IntoResponse for SignInError {
    fn into_response(self) -> Response {
        let (status, error, tip) = match self {
            SignInError::MissingParams => (
                StatusCode::UNAUTHORIZED,
                "The query parameters needed to complete the sign-in are missing.".to_string(),
                RESTART_TIP,
            ),
            SignInError::AuthFailed => (
                StatusCode::UNAUTHORIZED,
                "Something went wrong during authentication.".to_string(),
                RESTART_TIP,
            ),
            SignInError::Unverified => (
                StatusCode::FORBIDDEN,
                "The email address of this account is not verified.".to_string(),
                SIGNOUT_TIP,
            ),
            SignInError::WrongDomain { domain } => (
                StatusCode::FORBIDDEN,
                format!("This account does not belong to <b>{}</b>.", escape_html(&domain)),
                SIGNOUT_TIP,
            ),
            SignInError::TokenTooLarge => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "The sign-in link came out longer than Telegram allows.".to_string(),
                RECORDED_TIP,
            ),
            SignInError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong on our side.".to_string(),
                RECORDED_TIP,
            ),
        };
        let body = format!("<p>⚠️ {error}</p>\n<p>💡 {tip}</p>");
        (status, page("Janus Gate", &body)).into_response()
    }
}

/// Minimal HTML shell shared by every browser-facing page.
fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n\
         <html lang=\"en\">\n\
         <head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body>\n{body}\n</body>\n\
         </html>\n"
    ))
}

// ============================================================================
// Lookup API
// ============================================================================

/// Whether a Telegram account is linked, and to whom. Callers present a
/// bearer token issued through the operator tooling.
async fn lookup_account(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<AccountLookupResponse>, ApiError> {
    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        return Err(ApiError::Unauthorized("Missing bearer token".to_string()));
    };
    if state.db.lookup_api_token(bearer.token())?.is_none() {
        return Err(ApiError::Unauthorized("Unknown bearer token".to_string()));
    }

    let Some(account) = state.db.get_account(account_id)? else {
        return Ok(Json(AccountLookupResponse {
            linked: false,
            student: None,
        }));
    };
    // The account row carries a foreign key, so the student must exist.
    let student = state
        .db
        .get_student(&account.student_email_prefix)?
        .ok_or_else(|| {
            ApiError::Internal(format!("Account {account_id} references a missing student"))
        })?;

    let student = (!student.privacy).then(|| LinkedStudent {
        email: student.email(&state.config.institution_domain),
        first_name: student.first_name.clone(),
        last_name: student.last_name.clone(),
    });
    Ok(Json(AccountLookupResponse {
        linked: true,
        student,
    }))
}

/// API-side failures, returned as JSON.
#[derive(Debug)]
enum ApiError {
    Unauthorized(String),
    Internal(String),
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "account lookup failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// Wire types.

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct AccountLookupResponse {
    linked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    student: Option<LinkedStudent>,
}

#[derive(Debug, Serialize)]
struct LinkedStudent {
    email: String,
    first_name: String,
    last_name: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}
