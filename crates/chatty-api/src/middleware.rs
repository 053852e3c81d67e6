use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use jsonwebtoken::{DecodingKey, Validation, decode};

use chatty_types::api::Claims;

use crate::auth::ACCESS_COOKIE;
use crate::error::ApiError;
use crate::state::{AppState, AppStateInner};

/// The authenticated caller, put into request extensions by `require_auth`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    pub email: String,
}

/// Access token from the `accessToken` cookie, falling back to an
/// `Authorization: Bearer` header.
pub fn access_token(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(ACCESS_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

pub fn decode_access_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::unauthorized("Invalid access token"))
}

/// Resolve the caller from request headers, checking the user still exists.
pub async fn authenticate(state: &AppStateInner, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    let token = access_token(headers).ok_or_else(|| ApiError::unauthorized("Unauthorized request"))?;
    let claims = decode_access_token(&state.auth.access_secret, &token)?;

    let user_id = claims.sub.clone();
    let user = state
        .run_db(move |db| db.get_user_by_id(&user_id))
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid access token"))?;

    Ok(AuthUser {
        id: user.id,
        username: user.username,
        email: user.email,
    })
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, req.headers()).await?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
